//! Block Pool
//!
//! Fixed-capacity slot storage with O(1) insert, lookup and removal. Every
//! insert returns a fresh index that is strictly greater than all earlier
//! ones, so stale indices are detected rather than aliased.
//!
//! An index encodes its slot as `index % capacity`; reusing a slot moves the
//! index forward by whole multiples of the capacity.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool is full at capacity {capacity}")]
    Capacity { capacity: usize },
    #[error("no value at index {index}")]
    Vacant { index: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot<T> {
    index: u64,
    value: Option<T>,
    next_free: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPool<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
    free: Option<usize>,
    last_index: Option<u64>,
    len: usize,
}

impl<T> BlockPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            free: None,
            last_index: None,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Stores `value`, returning its index.
    pub fn insert(&mut self, value: T) -> Result<u64, PoolError> {
        let slot = match self.free {
            Some(slot) => slot,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    index: 0,
                    value: None,
                    next_free: None,
                });
                self.slots.len() - 1
            }
            None => {
                return Err(PoolError::Capacity {
                    capacity: self.capacity,
                })
            }
        };

        let index = self.next_index(slot);
        let entry = &mut self.slots[slot];
        self.free = entry.next_free.take();
        entry.index = index;
        entry.value = Some(value);
        self.last_index = Some(index);
        self.len += 1;
        Ok(index)
    }

    pub fn get(&self, index: u64) -> Result<&T, PoolError> {
        let slot = self.locate(index)?;
        self.slots[slot]
            .value
            .as_ref()
            .ok_or(PoolError::Vacant { index })
    }

    pub fn get_mut(&mut self, index: u64) -> Result<&mut T, PoolError> {
        let slot = self.locate(index)?;
        self.slots[slot]
            .value
            .as_mut()
            .ok_or(PoolError::Vacant { index })
    }

    pub fn remove(&mut self, index: u64) -> Result<T, PoolError> {
        let slot = self.locate(index)?;
        let entry = &mut self.slots[slot];
        let value = entry.value.take().ok_or(PoolError::Vacant { index })?;
        entry.next_free = self.free;
        self.free = Some(slot);
        self.len -= 1;
        Ok(value)
    }

    /// Occupied entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        let mut entries: Vec<(u64, &T)> = self
            .slots
            .iter()
            .filter_map(|s| s.value.as_ref().map(|v| (s.index, v)))
            .collect();
        entries.sort_by_key(|(index, _)| *index);
        entries.into_iter()
    }

    // smallest index above the last one that maps to `slot`
    fn next_index(&self, slot: usize) -> u64 {
        let capacity = self.capacity as u64;
        let slot = slot as u64;
        match self.last_index {
            None => slot,
            Some(last) => {
                let candidate = last - last % capacity + slot;
                if candidate > last {
                    candidate
                } else {
                    candidate + capacity
                }
            }
        }
    }

    fn locate(&self, index: u64) -> Result<usize, PoolError> {
        if self.capacity == 0 {
            return Err(PoolError::Vacant { index });
        }
        let slot = (index % self.capacity as u64) as usize;
        match self.slots.get(slot) {
            Some(entry) if entry.index == index && entry.value.is_some() => Ok(slot),
            _ => Err(PoolError::Vacant { index }),
        }
    }
}
