//! Global max-signal bookkeeping.
//!
//! The fuzzer keeps one process-wide set of every signal element ever
//! observed, tagged with the highest priority it was seen under. Inserting
//! raw signal reports back exactly the delta — the elements that were new
//! or had their stored priority raised — which is what drives triage.

use crate::signal::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;

/// The global max-signal set. Every insertion is atomic with respect to
/// the set, so concurrent callers observe a linearized order and their
/// deltas partition the newly added elements.
#[derive(Default)]
pub struct Cover {
    max_signal: Mutex<HashMap<u32, u8>>,
}

/// Snapshot of the tracker for the aggregate stats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoverStats {
    pub max_signal: u64,
}

impl Cover {
    /// Add a raw signal buffer under the given priority and return the
    /// delta: elements that were absent, or stored with a strictly lower
    /// priority.
    pub fn add_raw_max_signal(&self, raw: &[u32], prio: u8) -> Signal {
        let mut delta = Signal::default();
        let mut max_signal = self.max_signal.lock();
        for &elem in raw {
            match max_signal.get(&elem) {
                Some(&stored) if stored >= prio => {}
                _ => {
                    max_signal.insert(elem, prio);
                    delta.insert(elem, prio);
                }
            }
        }
        delta
    }

    pub fn len(&self) -> usize {
        self.max_signal.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CoverStats {
        CoverStats { max_signal: self.len() as u64 }
    }
}
