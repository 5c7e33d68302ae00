// SPDX-License-Identifier: MIT

use alloc::vec;
use alloc::vec::Vec;

use log::debug;

use crate::types::{INVALID_BLOCK, INVALID_OBJECT_ID};
use crate::utils::BitmapOps;

// Free-block states, ranked by allocator preference (lower is better)
pub(crate) const BLOCK_STATE_ERASED: u16 = 0x0000;
pub(crate) const BLOCK_STATE_MAYBE_ERASED: u16 = 0x0001;
pub(crate) const BLOCK_STATE_UNKNOWN: u16 = 0x0002;
pub(crate) const BLOCK_STATE_GARBAGE: u16 = 0x0003;

#[inline]
fn entry_object_id(value: u32) -> u16 {
    (value >> 16) as u16
}

#[inline]
fn entry_block_index(value: u32) -> u16 {
    value as u16
}

#[inline]
fn entry_block_state(value: u32) -> u16 {
    value as u16
}

#[inline]
fn entry_value(object_id: u16, object_block_index: u16) -> u32 {
    ((object_id as u32) << 16) | object_block_index as u32
}

/// In-memory index mapping each physical block to the object and
/// object-block-index stored in it, or to a free-block state.
///
/// Rebuilt from the medium on every mount; there is no on-media copy.
#[derive(Debug)]
pub(crate) struct LookupTable {
    values: Vec<u32>,
    /// One bit per block; set when the block carries the v2 format
    version_bitmap: Vec<u8>,
    /// Seed used to generate object IDs
    pub(crate) seed: u32,
}

impl LookupTable {
    pub(crate) fn new(num_blocks: u16) -> Self {
        Self {
            values: vec![0u32; num_blocks as usize],
            version_bitmap: vec![0u8; num_blocks.div_ceil(8) as usize],
            seed: 0,
        }
    }

    #[inline]
    fn num_blocks(&self) -> u16 {
        self.values.len() as u16
    }

    #[inline]
    pub(crate) fn value_at(&self, block: u16) -> u32 {
        self.values[block as usize]
    }

    pub(crate) fn set_value(&mut self, block: u16, object_id: u16, object_block_index: u16) {
        self.values[block as usize] = entry_value(object_id, object_block_index);
    }

    pub(crate) fn set_free(&mut self, block: u16, state: u16) {
        self.set_value(block, INVALID_OBJECT_ID, state);
    }

    pub(crate) fn set_is_v2(&mut self, block: u16, value: bool) {
        self.version_bitmap.set_bit(block as usize, value);
    }

    pub(crate) fn is_v2(&self, block: u16) -> bool {
        self.version_bitmap.get_bit(block as usize)
    }

    /// Finds the physical block holding `(object_id, object_block_index)`.
    pub(crate) fn get_block(&self, object_id: u16, object_block_index: u16) -> u16 {
        let expected = entry_value(object_id, object_block_index);
        for (i, value) in self.values.iter().enumerate() {
            if *value == expected {
                return i as u16;
            }
        }
        INVALID_BLOCK
    }

    /// Number of blocks used by an object (`max(block_index) + 1`).
    pub(crate) fn get_num_blocks(&self, object_id: u16) -> u16 {
        let mut num_blocks = 0;
        for value in &self.values {
            if entry_object_id(*value) == object_id {
                num_blocks = num_blocks.max(entry_block_index(*value) + 1);
            }
        }
        num_blocks
    }

    /// Physical block holding the highest block index of an object.
    pub(crate) fn get_last_block(&self, object_id: u16) -> u16 {
        let mut last_block = INVALID_BLOCK;
        let mut max_block_index = 0;
        for (i, value) in self.values.iter().enumerate() {
            if entry_object_id(*value) != object_id {
                continue;
            }
            let block_index = entry_block_index(*value);
            if last_block == INVALID_BLOCK || block_index > max_block_index {
                last_block = i as u16;
                max_block_index = block_index;
            }
        }
        last_block
    }

    /// Whether an entry with `block_index == 0` exists for this object.
    pub(crate) fn contains_block0(&self, object_id: u16) -> bool {
        let expected = entry_value(object_id, 0);
        self.values.iter().any(|value| *value == expected)
    }

    /// Generates a fresh object ID not present in the table.
    pub(crate) fn next_object_id(&mut self) -> u16 {
        // In the worst case, this function is O(num_blocks^2), but
        // statistically there is a num_blocks / 2^16 chance that we find a
        // valid object ID with each loop, so in practice it should be very
        // fast.
        loop {
            // Very simple pseudo-random number generator which uniformly
            // generates 16-bit values
            self.seed = self.seed.wrapping_mul(1664525).wrapping_add(1013904223);
            let object_id = self.seed as u16;
            if object_id == INVALID_OBJECT_ID {
                continue;
            }
            let in_use = self
                .values
                .iter()
                .any(|value| entry_object_id(*value) == object_id);
            if !in_use {
                return object_id;
            }
        }
    }

    /// Advances `block` past the next block-0 entry and returns its object
    /// ID, or `INVALID_OBJECT_ID` when there are no more objects.
    pub(crate) fn iter_next_object(&self, block: &mut u16) -> u16 {
        for i in *block..self.num_blocks() {
            let value = self.value_at(i);
            let object_id = entry_object_id(value);
            if object_id == INVALID_OBJECT_ID || entry_block_index(value) != 0 {
                // This block is free or not the first block in the object
                continue;
            }
            *block = i + 1;
            return object_id;
        }
        INVALID_OBJECT_ID
    }

    /// Frees every entry of an object and returns the physical block which
    /// held index 0 (which the caller is expected to erase).
    pub(crate) fn delete_object(&mut self, object_id: u16) -> u16 {
        let mut first_block = INVALID_BLOCK;
        for i in 0..self.num_blocks() {
            let value = self.value_at(i);
            if entry_object_id(value) != object_id {
                continue;
            }
            let object_block_index = entry_block_index(value);
            if object_block_index == 0 {
                first_block = i;
            }
            debug!(
                "Clearing lookup table for block (block={i}, object_block_index={object_block_index})"
            );
            self.set_free(
                i,
                if object_block_index == 0 {
                    BLOCK_STATE_ERASED
                } else {
                    BLOCK_STATE_GARBAGE
                },
            );
        }
        assert_ne!(first_block, INVALID_BLOCK);
        first_block
    }

    /// Total number of blocks holding object data.
    pub(crate) fn total_in_use(&self) -> u16 {
        self.values
            .iter()
            .filter(|value| entry_object_id(**value) != INVALID_OBJECT_ID)
            .count() as u16
    }

    pub(crate) fn is_full(&self) -> bool {
        self.values
            .iter()
            .all(|value| entry_object_id(*value) != INVALID_OBJECT_ID)
    }

    /// Assigns the best free block to `(object_id, object_block_index)`.
    ///
    /// Returns the block and whether it is already erased, or `None` when
    /// the storage is full.
    pub(crate) fn acquire_block(
        &mut self,
        object_id: u16,
        object_block_index: u16,
    ) -> Option<(u16, bool)> {
        // Find the first free / best block from our lookup table (the
        // underlying storage handles wear leveling for us)
        let mut best_block = INVALID_BLOCK;
        let mut best_block_state = u16::MAX;
        for i in 0..self.num_blocks() {
            let value = self.value_at(i);
            if entry_object_id(value) == INVALID_OBJECT_ID {
                let state = entry_block_state(value);
                if state < best_block_state {
                    best_block = i;
                    best_block_state = state;
                }
                if state == BLOCK_STATE_ERASED {
                    break;
                }
            }
        }

        if best_block == INVALID_BLOCK {
            return None;
        }

        self.set_value(best_block, object_id, object_block_index);
        self.set_is_v2(best_block, true);
        Some((best_block, best_block_state == BLOCK_STATE_ERASED))
    }

    /// Frees the next in-use block at or after `start_block` for a wipe.
    ///
    /// `should_erase` comes in as the caller's secure flag and is forced on
    /// for first blocks; on return it says whether the caller must
    /// physically erase the block.
    pub(crate) fn wipe_next_in_use(&mut self, start_block: u16, should_erase: &mut bool) -> u16 {
        for i in start_block..self.num_blocks() {
            let value = self.value_at(i);
            let object_id = entry_object_id(value);
            if object_id == INVALID_OBJECT_ID {
                // This block is free
                continue;
            }
            let object_block_index = entry_block_index(value);
            // Should always erase the first block
            *should_erase = object_block_index == 0 || *should_erase;
            if *should_erase {
                debug!(
                    "Erasing block (block={i}, object_id={object_id}, object_block_index={object_block_index})"
                );
            }
            self.set_free(
                i,
                if *should_erase {
                    BLOCK_STATE_ERASED
                } else {
                    BLOCK_STATE_GARBAGE
                },
            );
            return i;
        }
        INVALID_BLOCK
    }

    pub(crate) fn num_erased(&self) -> u16 {
        self.values
            .iter()
            .filter(|value| **value == entry_value(INVALID_OBJECT_ID, BLOCK_STATE_ERASED))
            .count() as u16
    }

    /// Finds the next free block which still needs an erase, marks it
    /// erased and returns it.
    pub(crate) fn next_pending_erase(&mut self, start_block: u16) -> u16 {
        for i in start_block..self.num_blocks() {
            let value = self.value_at(i);
            if entry_object_id(value) == INVALID_OBJECT_ID
                && entry_block_state(value) != BLOCK_STATE_ERASED
            {
                self.set_free(i, BLOCK_STATE_ERASED);
                return i;
            }
        }
        INVALID_BLOCK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_prefers_erased() {
        let mut lut = LookupTable::new(4);
        lut.set_free(0, BLOCK_STATE_GARBAGE);
        lut.set_free(1, BLOCK_STATE_UNKNOWN);
        lut.set_free(2, BLOCK_STATE_ERASED);
        lut.set_free(3, BLOCK_STATE_MAYBE_ERASED);

        let (block, is_erased) = lut.acquire_block(42, 0).unwrap();
        assert_eq!(block, 2);
        assert!(is_erased);
        assert!(lut.is_v2(2));

        // Next best is maybe-erased, and it is not reported as erased
        let (block, is_erased) = lut.acquire_block(42, 1).unwrap();
        assert_eq!(block, 3);
        assert!(!is_erased);

        let (block, _) = lut.acquire_block(42, 2).unwrap();
        assert_eq!(block, 1);
        let (block, _) = lut.acquire_block(42, 3).unwrap();
        assert_eq!(block, 0);

        assert!(lut.is_full());
        assert!(lut.acquire_block(42, 4).is_none());
    }

    #[test]
    fn test_acquire_ties_break_by_index() {
        let mut lut = LookupTable::new(3);
        lut.set_free(0, BLOCK_STATE_UNKNOWN);
        lut.set_free(1, BLOCK_STATE_UNKNOWN);
        lut.set_free(2, BLOCK_STATE_UNKNOWN);
        let (block, _) = lut.acquire_block(1, 0).unwrap();
        assert_eq!(block, 0);
    }

    #[test]
    fn test_get_block_and_num_blocks() {
        let mut lut = LookupTable::new(8);
        lut.set_value(3, 7, 0);
        lut.set_value(5, 7, 1);
        lut.set_value(1, 9, 0);

        assert_eq!(lut.get_block(7, 0), 3);
        assert_eq!(lut.get_block(7, 1), 5);
        assert_eq!(lut.get_block(7, 2), INVALID_BLOCK);
        assert_eq!(lut.get_num_blocks(7), 2);
        assert_eq!(lut.get_num_blocks(9), 1);
        assert_eq!(lut.get_num_blocks(8), 0);
        assert_eq!(lut.get_last_block(7), 5);
        assert_eq!(lut.get_last_block(8), INVALID_BLOCK);
        assert_eq!(lut.total_in_use(), 3);
    }

    #[test]
    fn test_delete_object_states() {
        let mut lut = LookupTable::new(4);
        lut.set_value(0, 7, 1);
        lut.set_value(2, 7, 0);

        let first = lut.delete_object(7);
        assert_eq!(first, 2);
        assert_eq!(lut.value_at(2), BLOCK_STATE_ERASED as u32);
        assert_eq!(lut.value_at(0), BLOCK_STATE_GARBAGE as u32);
        assert_eq!(lut.total_in_use(), 0);
    }

    #[test]
    fn test_object_id_never_invalid_or_in_use() {
        let mut lut = LookupTable::new(4);
        lut.seed = 0xdeadbeef;
        let id = lut.next_object_id();
        assert_ne!(id, INVALID_OBJECT_ID);
        lut.set_value(0, id, 0);
        let id2 = lut.next_object_id();
        assert_ne!(id2, INVALID_OBJECT_ID);
        assert_ne!(id2, id);
    }

    #[test]
    fn test_iter_next_object() {
        let mut lut = LookupTable::new(6);
        lut.set_value(1, 5, 0);
        lut.set_value(2, 5, 1);
        lut.set_value(4, 9, 0);

        let mut cursor = 0;
        assert_eq!(lut.iter_next_object(&mut cursor), 5);
        assert_eq!(lut.iter_next_object(&mut cursor), 9);
        assert_eq!(lut.iter_next_object(&mut cursor), INVALID_OBJECT_ID);
    }

    #[test]
    fn test_wipe_iteration() {
        let mut lut = LookupTable::new(4);
        lut.set_value(0, 5, 0);
        lut.set_value(1, 5, 1);
        lut.set_value(3, 9, 0);

        let mut block = 0;
        let mut erased = alloc::vec::Vec::new();
        loop {
            let mut should_erase = false;
            block = lut.wipe_next_in_use(block, &mut should_erase);
            if block == INVALID_BLOCK {
                break;
            }
            if should_erase {
                erased.push(block);
            }
        }
        // Only the first blocks get erased on an insecure wipe
        assert_eq!(erased, [0, 3]);
        assert_eq!(lut.value_at(1), BLOCK_STATE_GARBAGE as u32);
        assert_eq!(lut.total_in_use(), 0);
    }

    #[test]
    fn test_pending_erase() {
        let mut lut = LookupTable::new(3);
        lut.set_free(0, BLOCK_STATE_ERASED);
        lut.set_free(1, BLOCK_STATE_GARBAGE);
        lut.set_value(2, 3, 0);

        assert_eq!(lut.num_erased(), 1);
        assert_eq!(lut.next_pending_erase(0), 1);
        assert_eq!(lut.num_erased(), 2);
        assert_eq!(lut.next_pending_erase(2), INVALID_BLOCK);
    }
}
