//! Read timestamp cache kept by the lease holder.
//!
//! Records the latest read timestamp per key so later writes can be pushed
//! above it. Anything not tracked individually is assumed to have been read
//! at the low-water mark.

use std::collections::BTreeMap;

use super::types::Timestamp;

#[derive(Clone, Debug, Default)]
pub struct TimestampCache {
    low_water: Timestamp,
    reads: BTreeMap<Vec<u8>, Timestamp>,
}

impl TimestampCache {
    pub fn new(low_water: Timestamp) -> Self {
        Self {
            low_water,
            reads: BTreeMap::new(),
        }
    }

    pub fn low_water(&self) -> Timestamp {
        self.low_water
    }

    /// Ratchet the low-water mark and drop entries it now covers.
    pub fn set_low_water(&mut self, ts: Timestamp) {
        if self.low_water.forward(ts) {
            let low_water = self.low_water;
            self.reads.retain(|_, read| *read > low_water);
        }
    }

    /// Forget every entry; `now` becomes the low-water mark.
    pub fn clear(&mut self, now: Timestamp) {
        self.reads.clear();
        self.low_water = now;
    }

    pub fn add(&mut self, key: Vec<u8>, ts: Timestamp) {
        if ts <= self.low_water {
            return;
        }
        self.reads
            .entry(key)
            .and_modify(|read| {
                read.forward(ts);
            })
            .or_insert(ts);
    }

    pub fn get_max(&self, key: &[u8]) -> Timestamp {
        self.reads
            .get(key)
            .copied()
            .unwrap_or(self.low_water)
            .max(self.low_water)
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }
}
