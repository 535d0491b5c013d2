//! Transaction identifier allocation over a bounded, wrapping range

use crate::errors::{Result, TcapError};
use crate::types::TransactionId;

/// Cursor over the inclusive id range `[start, end]`
///
/// The allocator owns no dialog state; callers pass a membership check so
/// that scanning and inserting happen under the caller's registry lock.
#[derive(Debug)]
pub struct IdAllocator {
    start: u32,
    end: u32,
    /// Last id handed out; `None` until the first allocation
    cursor: Option<u32>,
}

impl IdAllocator {
    /// Create allocator whose first id is `start`
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            cursor: None,
        }
    }

    /// Create allocator that resumes scanning after `cursor`
    pub fn starting_after(start: u32, end: u32, cursor: u32) -> Self {
        Self {
            start,
            end,
            cursor: Some(cursor),
        }
    }

    pub fn range(&self) -> (u32, u32) {
        (self.start, self.end)
    }

    fn advance(&mut self) -> u32 {
        let next = match self.cursor {
            Some(c) if c >= self.start && c < self.end => c + 1,
            _ => self.start,
        };
        self.cursor = Some(next);
        next
    }

    /// Next unused id
    ///
    /// Fails fast with `CapacityExceeded` when `live >= max` and never
    /// advances the cursor in that case. A full lap of the range without
    /// a free id also yields `CapacityExceeded`.
    pub fn next_id<F>(&mut self, live: usize, max: usize, in_use: F) -> Result<TransactionId>
    where
        F: Fn(TransactionId) -> bool,
    {
        if live >= max {
            return Err(TcapError::CapacityExceeded { max });
        }

        let span = (self.end - self.start) as u64 + 1;
        for _ in 0..span {
            let id = TransactionId(self.advance());
            if !in_use(id) {
                return Ok(id);
            }
        }

        Err(TcapError::CapacityExceeded { max })
    }

    /// Next id without an availability check (preview mode)
    pub fn next_unchecked(&mut self) -> TransactionId {
        TransactionId(self.advance())
    }
}
