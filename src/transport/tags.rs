//! Transaction tag allocation.
//!
//! Each connection owns one [`TagTable`]: a FIFO queue of recycled tags, a
//! counter for minting new ones, and the map of outstanding transactions.
//! A tag goes back into the queue only once its response has been taken,
//! and the oldest freed tag is reused first.

use std::collections::{HashMap, VecDeque};

use crate::core::constants::PRESEEDED_TAGS;
use crate::core::{NetError, NetResult};

/// Tag pool plus pending-transaction map.
///
/// Generic over the continuation stored per outstanding tag.
#[derive(Debug)]
pub struct TagTable<H> {
    /// Freed tags, oldest first.
    recycled: VecDeque<i32>,
    /// Next never-used tag.
    next: Option<i32>,
    /// Outstanding transactions.
    pending: HashMap<i32, H>,
}

impl<H> TagTable<H> {
    /// Create a table whose tags start at `base`.
    ///
    /// The first [`PRESEEDED_TAGS`] tags are queued up front.
    pub fn new(base: i32) -> Self {
        let mut table = Self {
            recycled: VecDeque::with_capacity(PRESEEDED_TAGS),
            next: Some(base),
            pending: HashMap::new(),
        };
        for _ in 0..PRESEEDED_TAGS {
            if let Some(tag) = table.mint() {
                table.recycled.push_back(tag);
            }
        }
        table
    }

    fn mint(&mut self) -> Option<i32> {
        let tag = self.next?;
        self.next = tag.checked_add(1);
        Some(tag)
    }

    /// Allocate a tag and register its continuation.
    pub fn allocate(&mut self, handler: H) -> NetResult<i32> {
        let tag = match self.recycled.pop_front() {
            Some(tag) => tag,
            None => self.mint().ok_or(NetError::TagsExhausted)?,
        };
        self.pending.insert(tag, handler);
        Ok(tag)
    }

    /// Take the continuation for `tag` and recycle the tag.
    ///
    /// Returns `None` if no transaction of ours is outstanding under `tag`,
    /// which means the frame is a request from the peer.
    pub fn complete(&mut self, tag: i32) -> Option<H> {
        let handler = self.pending.remove(&tag)?;
        self.recycled.push_back(tag);
        Some(handler)
    }

    /// Number of outstanding transactions.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Check if `tag` is outstanding.
    #[cfg(test)]
    pub fn is_pending(&self, tag: i32) -> bool {
        self.pending.contains_key(&tag)
    }

    /// Drop every outstanding continuation without running it.
    ///
    /// Their tags are recycled so the table stays consistent.
    pub fn abandon_all(&mut self) -> Vec<H> {
        let mut abandoned = Vec::with_capacity(self.pending.len());
        for (tag, handler) in self.pending.drain() {
            self.recycled.push_back(tag);
            abandoned.push(handler);
        }
        abandoned
    }
}
