use std::collections::VecDeque;

use crate::capture::Chunk;
use crate::error::MirrorError;

/// Bounded FIFO of chunks waiting for the sink
#[derive(Debug)]
pub struct PlayoutQueue {
    entries: VecDeque<Chunk>,
    max_size: usize,
    dropped_total: u64,
}

impl PlayoutQueue {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(2);
        Self {
            entries: VecDeque::with_capacity(max_size + 1),
            max_size,
            dropped_total: 0,
        }
    }

    /// Queue a chunk at the tail
    ///
    /// When this overflows the bound, the oldest entries are dropped so that
    /// exactly `max_size / 2` of the newest remain. The chunk is still queued;
    /// `BufferOverflow` only reports what was lost.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), MirrorError> {
        self.entries.push_back(chunk);
        if self.entries.len() <= self.max_size {
            return Ok(());
        }
        let dropped = self.entries.len() - self.max_size / 2;
        self.entries.drain(..dropped);
        self.dropped_total += dropped as u64;
        Err(MirrorError::BufferOverflow { dropped })
    }

    /// Put a chunk back at the head (failed append)
    pub fn requeue(&mut self, chunk: Chunk) {
        self.entries.push_front(chunk);
    }

    pub fn pop(&mut self) -> Option<Chunk> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Chunks lost to overflow since creation
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }
}
