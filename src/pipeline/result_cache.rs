use std::collections::VecDeque;
use std::sync::Arc;
use rustc_hash::FxHashMap;
use crate::slice::{ColoredSlice, SliceKey};

/// Fixed-capacity FIFO cache of finished color slices
///
/// All entries were produced with the same color table. Inserting a result made
/// with a different table drops everything first.
pub struct SliceResultCache {
    capacity: usize,
    lut_id: Option<u64>,
    entries: FxHashMap<SliceKey, Arc<ColoredSlice>>,
    order: VecDeque<SliceKey>,
}

impl SliceResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lut_id: None,
            entries: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    /// Cached slice, only if it was made with table `lut_id`
    pub fn get(&self, key: &SliceKey, lut_id: u64) -> Option<Arc<ColoredSlice>> {
        if self.lut_id != Some(lut_id) {
            return None;
        }
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &SliceKey, lut_id: u64) -> bool {
        self.lut_id == Some(lut_id) && self.entries.contains_key(key)
    }

    /// Insert, evicting the oldest entry when full
    pub fn insert_for_lut(&mut self, lut_id: u64, key: SliceKey, slice: Arc<ColoredSlice>) {
        if self.lut_id != Some(lut_id) {
            self.invalidate();
            self.lut_id = Some(lut_id);
        }
        if self.entries.insert(key, slice).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Drop every entry and forget the table
    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.lut_id = None;
    }

    pub fn lut_id(&self) -> Option<u64> {
        self.lut_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
