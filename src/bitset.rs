//! A small growable bitset indexed by `MachineId`, backing the
//! `locations` field of a `ContentLocationEntry`.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::machine::MachineId;

const WORD_BITS: usize = 64;

/// Growable bitset over dense `MachineId`s.
#[derive(Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct MachineBitSet {
    words: Vec<u64>,
}

impl MachineBitSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    fn ensure_capacity(&mut self, word_index: usize) {
        if word_index >= self.words.len() {
            self.words.resize(word_index + 1, 0);
        }
    }

    pub fn set(&mut self, id: MachineId) {
        let idx: usize = id.into();
        let (word, bit) = (idx / WORD_BITS, idx % WORD_BITS);
        self.ensure_capacity(word);
        self.words[word] |= 1u64 << bit;
    }

    pub fn clear(&mut self, id: MachineId) {
        let idx: usize = id.into();
        let (word, bit) = (idx / WORD_BITS, idx % WORD_BITS);
        if word < self.words.len() {
            self.words[word] &= !(1u64 << bit);
        }
    }

    pub fn contains(&self, id: MachineId) -> bool {
        let idx: usize = id.into();
        let (word, bit) = (idx / WORD_BITS, idx % WORD_BITS);
        self.words
            .get(word)
            .map(|w| w & (1u64 << bit) != 0)
            .unwrap_or(false)
    }

    /// Number of set bits, i.e. the replica count.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Iterates over the set bits, in ascending `MachineId` order.
    pub fn iter(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            (0..WORD_BITS).filter_map(move |bit| {
                if word & (1u64 << bit) != 0 {
                    Some(MachineId((word_idx * WORD_BITS + bit) as u32))
                } else {
                    None
                }
            })
        })
    }

    /// Merges `other` into `self` (set union), used when applying an
    /// Add event.
    pub fn union_with(&mut self, other: &MachineBitSet) {
        self.ensure_capacity(other.words.len().saturating_sub(1));
        for (i, w) in other.words.iter().enumerate() {
            self.words[i] |= w;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_contains_roundtrip() {
        let mut bs = MachineBitSet::new();
        assert!(!bs.contains(MachineId(5)));
        bs.set(MachineId(5));
        assert!(bs.contains(MachineId(5)));
        bs.clear(MachineId(5));
        assert!(!bs.contains(MachineId(5)));
    }

    #[test]
    fn count_matches_number_set_across_words() {
        let mut bs = MachineBitSet::new();
        for id in [0u32, 1, 63, 64, 130] {
            bs.set(MachineId(id));
        }
        assert_eq!(bs.count(), 5);
    }

    #[test]
    fn iter_yields_ascending_ids() {
        let mut bs = MachineBitSet::new();
        for id in [130u32, 1, 64, 0] {
            bs.set(MachineId(id));
        }
        let ids: Vec<u32> = bs.iter().map(u32::from).collect();
        assert_eq!(ids, vec![0, 1, 64, 130]);
    }

    #[test]
    fn union_with_merges_bits() {
        let mut a = MachineBitSet::new();
        a.set(MachineId(1));
        let mut b = MachineBitSet::new();
        b.set(MachineId(200));
        a.union_with(&b);
        assert!(a.contains(MachineId(1)));
        assert!(a.contains(MachineId(200)));
    }
}
