use crate::core::contact::ContactTable;
use crate::core::element::ElementTable;
use crate::core::model::contact::SkipgraphContact;
use crate::core::model::range::KeyRange;
use crate::core::Identifier;
use std::fmt;
use std::fmt::{Debug, Formatter};
use tracing::Span;

/// SkipgraphNode pairs the element table a node owns with its contact table.
/// The element table is gone exactly while the node is disabled, that is, while it leaves.
#[derive(Clone)]
pub struct SkipgraphNode {
    id: Identifier,
    elements: Option<ElementTable>,
    contacts: ContactTable,
}

impl SkipgraphNode {
    /// Create a node owning `elements`, linked on level 0 to `prev` and `next` when given.
    pub fn new(
        parent_span: &Span,
        id: Identifier,
        elements: ElementTable,
        prev: Option<SkipgraphContact>,
        next: Option<SkipgraphContact>,
    ) -> SkipgraphNode {
        let contacts = ContactTable::new(parent_span, id, elements.range().clone(), prev, next);
        SkipgraphNode {
            id,
            elements: Some(elements),
            contacts,
        }
    }

    /// The first node of a graph: responsible for the whole key space, linked to nobody.
    pub fn bootstrap(parent_span: &Span, id: Identifier) -> SkipgraphNode {
        SkipgraphNode::new(parent_span, id, ElementTable::new(KeyRange::unbounded()), None, None)
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    pub fn contact(&self) -> SkipgraphContact {
        self.contacts.self_contact()
    }

    /// The range the node answers for; a disabled node keeps reporting its last range.
    pub fn range(&self) -> KeyRange {
        match &self.elements {
            Some(table) => table.range().clone(),
            None => self.contacts.self_contact().range().clone(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.elements.is_none()
    }

    pub fn element_table(&self) -> Option<&ElementTable> {
        self.elements.as_ref()
    }

    pub fn element_table_mut(&mut self) -> Option<&mut ElementTable> {
        self.elements.as_mut()
    }

    /// Number of elements held; zero once disabled.
    pub fn size(&self) -> usize {
        self.elements.as_ref().map_or(0, ElementTable::len)
    }

    /// Replaces the element table; the contact table takes over the new range.
    pub fn set_element_table(&mut self, table: ElementTable) {
        self.contacts.set_owner_range(table.range().clone());
        self.elements = Some(table);
    }

    /// Removes the element table, disabling the node.
    pub fn take_element_table(&mut self) -> Option<ElementTable> {
        self.elements.take()
    }

    pub fn contact_table(&self) -> &ContactTable {
        &self.contacts
    }

    pub fn contact_table_mut(&mut self) -> &mut ContactTable {
        &mut self.contacts
    }

    pub fn size_bytes(&self) -> usize {
        crate::core::model::IDENTIFIER_SIZE_BYTES
            + self.elements.as_ref().map_or(0, ElementTable::size_bytes)
            + self.contacts.size_bytes()
    }
}

impl PartialEq for SkipgraphNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.elements == other.elements && self.contacts == other.contacts
    }
}

impl Debug for SkipgraphNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipgraphNode")
            .field("id", &self.id)
            .field("range", &self.range().to_string())
            .field("size", &self.size())
            .field("disabled", &self.is_disabled())
            .field("height", &self.contacts.height())
            .finish()
    }
}
