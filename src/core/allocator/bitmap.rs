//! Bitmap allocator for sector slots
//!
//! Each bit represents one sector slot in a storage folder:
//! - 0 = free slot
//! - 1 = used slot
//!
//! A 96 TiB folder of 4 MiB sectors needs 375,000 words (under 3 MiB), so the
//! bitmap stays small next to the sector index it backs.

use crate::error::{ContractManagerError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Randomized-probe bitmap allocator
///
/// Allocation probes random words and picks a random free bit inside the
/// first word that has one. Expected probes grow as `1 / (1 - fill_ratio)`,
/// so a nearly full folder is slower to allocate from, but never unbounded:
/// exhaustion is caught by the used counter, and after `probe_limit` misses
/// the allocator sweeps every word once starting at a random position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapAllocator {
    /// Bitmap words (each word = 64 slots)
    words: Vec<u64>,

    /// Total number of slots tracked
    capacity: u32,

    /// Number of slots currently in use
    used: u32,
}

impl BitmapAllocator {
    /// Create an allocator with every slot free
    pub fn new(capacity: u32) -> Self {
        BitmapAllocator {
            words: vec![0u64; Self::words_for(capacity)],
            capacity,
            used: 0,
        }
    }

    /// Rebuild an allocator from persisted words
    pub fn from_words(words: Vec<u64>, capacity: u32) -> Result<Self> {
        if words.len() != Self::words_for(capacity) {
            return Err(ContractManagerError::Corruption(format!(
                "bitmap has {} words, capacity {} needs {}",
                words.len(),
                capacity,
                Self::words_for(capacity)
            )));
        }

        let mut alloc = BitmapAllocator {
            words,
            capacity,
            used: 0,
        };

        if let Some(last) = alloc.words.len().checked_sub(1) {
            if alloc.words[last] & !alloc.valid_mask(last) != 0 {
                return Err(ContractManagerError::Corruption(format!(
                    "bitmap marks slots beyond capacity {}",
                    capacity
                )));
            }
        }

        alloc.used = alloc.words.iter().map(|w| w.count_ones()).sum();
        Ok(alloc)
    }

    /// Number of words needed to track `capacity` slots
    pub fn words_for(capacity: u32) -> usize {
        (capacity as usize + 63) / 64
    }

    /// Bits of word `word_idx` that correspond to real slots
    fn valid_mask(&self, word_idx: usize) -> u64 {
        let rem = self.capacity % 64;
        if word_idx + 1 == self.words.len() && rem != 0 {
            (1u64 << rem) - 1
        } else {
            u64::MAX
        }
    }

    /// Set a random free bit in `word_idx`, if there is one
    fn take_random_bit<R: Rng + ?Sized>(&mut self, word_idx: usize, rng: &mut R) -> Option<u32> {
        let free = !self.words[word_idx] & self.valid_mask(word_idx);
        if free == 0 {
            return None;
        }

        // Drop the k lowest free bits, then take the next one
        let mut remaining = free;
        for _ in 0..rng.gen_range(0..free.count_ones()) {
            remaining &= remaining - 1;
        }
        let bit = remaining.trailing_zeros();

        self.words[word_idx] |= 1u64 << bit;
        self.used += 1;
        Some(word_idx as u32 * 64 + bit)
    }

    /// Allocate one free slot
    pub fn allocate<R: Rng + ?Sized>(&mut self, rng: &mut R, probe_limit: usize) -> Result<u32> {
        if self.used >= self.capacity {
            return Err(ContractManagerError::NoSpace);
        }

        let num_words = self.words.len();
        for _ in 0..probe_limit {
            let word_idx = rng.gen_range(0..num_words);
            if let Some(slot) = self.take_random_bit(word_idx, rng) {
                return Ok(slot);
            }
        }

        let start = rng.gen_range(0..num_words);
        for offset in 0..num_words {
            let word_idx = (start + offset) % num_words;
            if let Some(slot) = self.take_random_bit(word_idx, rng) {
                return Ok(slot);
            }
        }

        Err(ContractManagerError::Corruption(format!(
            "bitmap reports {} free slots but has no clear bit",
            self.free_count()
        )))
    }

    /// Release a used slot
    ///
    /// Releasing a slot that is out of range or already free means the index
    /// and the bitmap disagree, which is reported as corruption.
    pub fn release(&mut self, slot: u32) -> Result<()> {
        if slot >= self.capacity {
            return Err(ContractManagerError::Corruption(format!(
                "release of slot {} beyond capacity {}",
                slot, self.capacity
            )));
        }

        let (word_idx, mask) = Self::locate(slot);
        if self.words[word_idx] & mask == 0 {
            return Err(ContractManagerError::Corruption(format!(
                "release of slot {} which is already free",
                slot
            )));
        }

        self.words[word_idx] &= !mask;
        self.used -= 1;
        Ok(())
    }

    /// Mark a specific slot as used
    pub fn mark_used(&mut self, slot: u32) -> Result<()> {
        if slot >= self.capacity {
            return Err(ContractManagerError::Corruption(format!(
                "slot {} beyond capacity {}",
                slot, self.capacity
            )));
        }

        let (word_idx, mask) = Self::locate(slot);
        if self.words[word_idx] & mask != 0 {
            return Err(ContractManagerError::Corruption(format!(
                "slot {} is already in use",
                slot
            )));
        }

        self.words[word_idx] |= mask;
        self.used += 1;
        Ok(())
    }

    fn locate(slot: u32) -> (usize, u64) {
        ((slot / 64) as usize, 1u64 << (slot % 64))
    }

    /// Check if a specific slot is in use
    pub fn is_allocated(&self, slot: u32) -> bool {
        if slot >= self.capacity {
            return false;
        }
        let (word_idx, mask) = Self::locate(slot);
        self.words[word_idx] & mask != 0
    }

    /// Highest used slot, if any
    pub fn highest_used(&self) -> Option<u32> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, word)| **word != 0)
            .map(|(idx, word)| idx as u32 * 64 + (63 - word.leading_zeros()))
    }

    /// First used slot at or beyond `new_capacity`, which blocks a shrink
    pub fn shrink_blocker(&self, new_capacity: u32) -> Option<u32> {
        self.highest_used().filter(|&slot| slot >= new_capacity)
    }

    /// Change the number of tracked slots
    ///
    /// Growing appends free slots without touching existing bits. Shrinking
    /// is refused if any used slot lies at or beyond the new capacity.
    pub fn resize(&mut self, new_capacity: u32) -> Result<()> {
        if let Some(slot) = self.shrink_blocker(new_capacity) {
            return Err(ContractManagerError::InvalidCapacity(format!(
                "slot {} is in use beyond new capacity {}",
                slot, new_capacity
            )));
        }

        self.words.resize(Self::words_for(new_capacity), 0u64);
        self.capacity = new_capacity;
        Ok(())
    }

    /// Iterate over all used slots in ascending order
    pub fn used_slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros();
                remaining &= remaining - 1;
                Some(idx as u32 * 64 + bit)
            })
        })
    }

    /// Raw words, for persistence
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used_count(&self) -> u32 {
        self.used
    }

    pub fn free_count(&self) -> u32 {
        self.capacity - self.used
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.capacity
    }

    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allocator::DEFAULT_PROBE_LIMIT;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn test_bitmap_creation() {
        let alloc = BitmapAllocator::new(1000);
        assert_eq!(alloc.capacity(), 1000);
        assert_eq!(alloc.free_count(), 1000);
        assert_eq!(alloc.words().len(), 16);
    }

    #[test]
    fn test_fill_64_then_no_space() {
        let mut alloc = BitmapAllocator::new(64);
        let mut rng = rng();

        let slots: HashSet<u32> = (0..64)
            .map(|_| alloc.allocate(&mut rng, DEFAULT_PROBE_LIMIT).unwrap())
            .collect();
        assert_eq!(slots.len(), 64);
        assert!(slots.iter().all(|&s| s < 64));
        assert!(alloc.is_full());

        let result = alloc.allocate(&mut rng, DEFAULT_PROBE_LIMIT);
        assert!(matches!(result, Err(ContractManagerError::NoSpace)));
    }

    #[test]
    fn test_partial_last_word_never_overflows() {
        let mut alloc = BitmapAllocator::new(70);
        let mut rng = rng();

        for _ in 0..70 {
            let slot = alloc.allocate(&mut rng, DEFAULT_PROBE_LIMIT).unwrap();
            assert!(slot < 70);
        }
        assert!(matches!(
            alloc.allocate(&mut rng, DEFAULT_PROBE_LIMIT),
            Err(ContractManagerError::NoSpace)
        ));
    }

    #[test]
    fn test_last_free_slot_found_with_zero_probes() {
        let mut alloc = BitmapAllocator::new(640);
        let mut rng = rng();
        for slot in 0..640 {
            if slot != 517 {
                alloc.mark_used(slot).unwrap();
            }
        }

        // No random probes: the sweep alone must find the only free slot
        assert_eq!(alloc.allocate(&mut rng, 0).unwrap(), 517);
    }

    #[test]
    fn test_allocation_is_spread() {
        let mut alloc = BitmapAllocator::new(64 * 1000);
        let mut rng = rng();

        let slots: Vec<u32> = (0..16)
            .map(|_| alloc.allocate(&mut rng, DEFAULT_PROBE_LIMIT).unwrap())
            .collect();
        assert!(slots.iter().any(|&s| s >= 64), "allocation clustered at the start");
    }

    #[test]
    fn test_release() {
        let mut alloc = BitmapAllocator::new(128);
        let mut rng = rng();

        let slot = alloc.allocate(&mut rng, DEFAULT_PROBE_LIMIT).unwrap();
        assert!(alloc.is_allocated(slot));

        alloc.release(slot).unwrap();
        assert!(!alloc.is_allocated(slot));
        assert_eq!(alloc.free_count(), 128);
    }

    #[test]
    fn test_release_unallocated_is_corruption() {
        let mut alloc = BitmapAllocator::new(128);
        assert!(matches!(
            alloc.release(5),
            Err(ContractManagerError::Corruption(_))
        ));
        assert!(matches!(
            alloc.release(500),
            Err(ContractManagerError::Corruption(_))
        ));
        assert_eq!(alloc.used_count(), 0);
    }

    #[test]
    fn test_double_mark_is_corruption() {
        let mut alloc = BitmapAllocator::new(128);
        alloc.mark_used(9).unwrap();
        assert!(matches!(
            alloc.mark_used(9),
            Err(ContractManagerError::Corruption(_))
        ));
    }

    #[test]
    fn test_grow_keeps_existing_bits() {
        let mut alloc = BitmapAllocator::new(64);
        alloc.mark_used(3).unwrap();
        alloc.mark_used(63).unwrap();

        alloc.resize(200).unwrap();
        assert_eq!(alloc.capacity(), 200);
        assert!(alloc.is_allocated(3));
        assert!(alloc.is_allocated(63));
        assert_eq!(alloc.free_count(), 198);
    }

    #[test]
    fn test_shrink() {
        let mut alloc = BitmapAllocator::new(256);
        alloc.mark_used(10).unwrap();
        alloc.mark_used(150).unwrap();

        assert_eq!(alloc.shrink_blocker(100), Some(150));
        assert!(alloc.resize(100).is_err());
        assert_eq!(alloc.capacity(), 256);

        alloc.resize(151).unwrap();
        assert_eq!(alloc.capacity(), 151);
        assert_eq!(alloc.used_count(), 2);
        assert_eq!(alloc.highest_used(), Some(150));
    }

    #[test]
    fn test_used_slots_iterates_in_order() {
        let mut alloc = BitmapAllocator::new(300);
        for slot in [299, 0, 64, 65, 128] {
            alloc.mark_used(slot).unwrap();
        }
        let used: Vec<u32> = alloc.used_slots().collect();
        assert_eq!(used, vec![0, 64, 65, 128, 299]);
    }

    #[test]
    fn test_from_words() {
        let mut alloc = BitmapAllocator::new(100);
        alloc.mark_used(1).unwrap();
        alloc.mark_used(99).unwrap();

        let reloaded = BitmapAllocator::from_words(alloc.words().to_vec(), 100).unwrap();
        assert_eq!(reloaded.used_count(), 2);
        assert!(reloaded.is_allocated(99));

        // Bit 100 lies past capacity
        let bad = vec![0u64, 1u64 << 36];
        assert!(matches!(
            BitmapAllocator::from_words(bad, 100),
            Err(ContractManagerError::Corruption(_))
        ));
    }

    #[test]
    fn test_fill_ratio() {
        let mut alloc = BitmapAllocator::new(4);
        let mut rng = rng();
        alloc.allocate(&mut rng, DEFAULT_PROBE_LIMIT).unwrap();
        assert!((alloc.fill_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
