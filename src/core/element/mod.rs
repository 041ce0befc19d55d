mod buffer;
mod element_table;
#[cfg(test)]
mod element_table_test;

pub use buffer::ElementBuffer;
pub use element_table::{ElementTable, TableSplit};

use crate::core::model::element::Element;

/// UpdateBatch is one unit of element updates: elements to insert and elements to delete.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateBatch {
    pub inputs: Vec<Element>,
    pub deletes: Vec<Element>,
}

impl UpdateBatch {
    pub fn new(inputs: Vec<Element>, deletes: Vec<Element>) -> UpdateBatch {
        UpdateBatch { inputs, deletes }
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.deletes.len()
    }

    /// True when every element of the batch is well formed.
    pub fn is_well_formed(&self) -> bool {
        self.inputs
            .iter()
            .chain(self.deletes.iter())
            .all(Element::is_well_formed)
    }

    pub fn size_bytes(&self) -> usize {
        4 + self
            .inputs
            .iter()
            .chain(self.deletes.iter())
            .map(Element::size_bytes)
            .sum::<usize>()
    }
}
