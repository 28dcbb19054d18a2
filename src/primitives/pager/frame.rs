use parking_lot::RwLock;
use std::sync::Arc;

use crate::types::{page::PAGE_SIZE, BlockNumber};

/// One slot of the buffer pool arena.
///
/// The bookkeeping fields are guarded by the pool's table mutex; the page
/// bytes carry their own reader/writer lock so page handles can outlive the
/// table lock.
pub struct Frame {
    pub block: Option<BlockNumber>,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub reference: bool,
    pub dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            block: None,
            buf: Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
            reference: false,
            dirty: false,
            pin_count: 0,
        }
    }

    pub fn is_evictable(&self) -> bool {
        self.pin_count == 0
    }

    pub fn reset(&mut self, block: BlockNumber) {
        self.block = Some(block);
        self.reference = true;
        self.dirty = false;
        self.pin_count = 0;
    }
}
