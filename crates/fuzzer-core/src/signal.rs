//! Signal and coverage value types.
//!
//! A signal element is an opaque 32-bit token emitted by the target's
//! coverage instrumentation; each element carries a priority byte so that
//! the same element observed under better circumstances (e.g. from a
//! successful call) can replace a weaker observation.

use std::collections::{HashMap, HashSet};

/// A set of signal elements, each tagged with a priority byte.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signal(HashMap<u32, u8>);

impl Signal {
    /// Build a signal set from a raw element buffer, tagging every element
    /// with the same priority. Duplicate elements collapse.
    pub fn from_raw(raw: &[u32], prio: u8) -> Self {
        Signal(raw.iter().map(|&e| (e, prio)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, elem: u32) -> bool {
        self.0.contains_key(&elem)
    }

    /// Elements present in both sets, kept at the lower of the two
    /// priorities. Used during deflake: an element only survives if every
    /// re-execution reproduced it.
    pub fn intersection(&self, other: &Signal) -> Signal {
        Signal(
            self.0
                .iter()
                .filter_map(|(&e, &p)| other.0.get(&e).map(|&q| (e, p.min(q))))
                .collect(),
        )
    }

    pub(crate) fn insert(&mut self, elem: u32, prio: u8) {
        self.0.insert(elem, prio);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.0.iter().map(|(&e, &p)| (e, p))
    }
}

/// A plain set of program counters, merged across the deflake runs of a
/// triage job and serialized into the corpus input.
#[derive(Clone, Debug, Default)]
pub struct CoverSet(HashSet<u32>);

impl CoverSet {
    pub fn merge(&mut self, pcs: &[u32]) {
        self.0.extend(pcs.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable flat rendering (sorted) for storage.
    pub fn serialize(&self) -> Vec<u32> {
        let mut pcs: Vec<u32> = self.0.iter().copied().collect();
        pcs.sort_unstable();
        pcs
    }
}
