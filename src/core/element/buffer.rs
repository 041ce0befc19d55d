use crate::core::element::UpdateBatch;
use std::collections::VecDeque;

/// ElementBuffer holds the update batches that reach a locked node.
/// Batches are kept in arrival order so that replaying them reproduces the same final state.
#[derive(Debug, Default)]
pub struct ElementBuffer {
    batches: VecDeque<UpdateBatch>,
}

impl ElementBuffer {
    pub fn new() -> ElementBuffer {
        ElementBuffer::default()
    }

    pub fn push(&mut self, batch: UpdateBatch) {
        if !batch.is_empty() {
            self.batches.push_back(batch);
        }
    }

    /// Number of buffered elements, inputs and deletes together.
    pub fn len(&self) -> usize {
        self.batches.iter().map(UpdateBatch::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Empties the buffer, returning the batches oldest first.
    pub fn drain(&mut self) -> Vec<UpdateBatch> {
        self.batches.drain(..).collect()
    }
}
