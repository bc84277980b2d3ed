//! Counter and duration sinks.
//!
//! Two layers of accounting coexist: a named map of u64 counters guarded
//! by the orchestrator's mutex (origin tags, attribution entries, analysis
//! entries), and wait-free atomic counters grouped by operating mode and
//! by mutator kind, with cumulative duration accumulators alongside the
//! mode counters.

use crate::target::MutatorKind;
use crossbeam_utils::CachePadded;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// Origin tags. Every request carries one; `done` bumps the counter with
// the same name.
pub const STAT_GENERATE: &str = "exec gen";
pub const STAT_FUZZ: &str = "exec fuzz";
pub const STAT_CANDIDATE: &str = "exec candidate";
pub const STAT_TRIAGE: &str = "exec triage";
pub const STAT_MINIMIZE: &str = "exec minimize";
pub const STAT_SMASH: &str = "exec smash";
pub const STAT_HINT: &str = "exec hints";
pub const STAT_SEED: &str = "exec seeds";
pub const STAT_COLLIDE: &str = "exec collide";
pub const STAT_FUZZ_FROM_SMASH: &str = "exec fuzz (from smash)";
pub const STAT_SEED_FROM_HINT: &str = "exec seeds (from hint)";

/// The operating modes whose counts and durations are tracked separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Generate,
    Mutate,
    MutateHints,
    Smash,
    MutateFromSmash,
}

impl Mode {
    pub const ALL: [Mode; 5] =
        [Mode::Generate, Mode::Mutate, Mode::MutateHints, Mode::Smash, Mode::MutateFromSmash];

    pub fn name(self) -> &'static str {
        match self {
            Mode::Generate => "mode generate",
            Mode::Mutate => "mode mutate",
            Mode::MutateHints => "mode mutate with hints",
            Mode::Smash => "mode smash",
            Mode::MutateFromSmash => "mode mutate (from smash)",
        }
    }
}

/// Wait-free u64 counter, padded to its own cache line.
#[derive(Default)]
pub struct StatCount(CachePadded<AtomicU64>);

impl StatCount {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }
}

/// Cumulative duration, stored as nanoseconds.
#[derive(Default)]
pub struct StatDuration(CachePadded<AtomicU64>);

impl StatDuration {
    pub fn get(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Relaxed))
    }

    pub fn add(&self, d: Duration) {
        self.0.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Per-mode and per-mutator counters with mode duration accumulators.
#[derive(Default)]
pub struct ModeStats {
    mode_counts: [StatCount; Mode::ALL.len()],
    mode_durations: [StatDuration; Mode::ALL.len()],
    mutator_counts: [StatCount; MutatorKind::ALL.len()],
}

impl ModeStats {
    pub fn inc_mode(&self, mode: Mode) {
        self.mode_counts[mode as usize].inc();
    }

    pub fn add_mode_duration(&self, mode: Mode, d: Duration) {
        self.mode_durations[mode as usize].add(d);
    }

    pub fn mode_count(&self, mode: Mode) -> u64 {
        self.mode_counts[mode as usize].get()
    }

    pub fn mode_duration(&self, mode: Mode) -> Duration {
        self.mode_durations[mode as usize].get()
    }

    pub fn add_mutator(&self, mutator: MutatorKind, v: u64) {
        self.mutator_counts[mutator as usize].add(v);
    }

    pub fn mutator_count(&self, mutator: MutatorKind) -> u64 {
        self.mutator_counts[mutator as usize].get()
    }

    /// All mode and mutator counters by name; ordered for stable output.
    pub fn counts(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for mode in Mode::ALL {
            out.insert(mode.name().to_string(), self.mode_count(mode));
        }
        for mutator in MutatorKind::ALL {
            out.insert(mutator.name().to_string(), self.mutator_count(mutator));
        }
        out
    }

    /// All mode durations in milliseconds, by name.
    pub fn durations_ms(&self) -> BTreeMap<String, u64> {
        Mode::ALL
            .iter()
            .map(|&m| (m.name().to_string(), self.mode_duration(m).as_millis() as u64))
            .collect()
    }
}

/// Attribution entry bumped when a triage job resolves: which mode found
/// the input, and whether the corpus coverage actually grew.
pub fn contribution_stat(requester: &str, cover_changed: bool) -> String {
    let outcome = if cover_changed { "new coverage" } else { "no new coverage" };
    format!("contribution : {requester} > {outcome}")
}

/// Aggregate contribution entry, across all requesters.
pub fn all_contribution_stat(cover_changed: bool) -> String {
    contribution_stat("all", cover_changed)
}

/// Basic-block growth attributed to a requester.
pub fn coverage_blocks_stat(requester: &str) -> String {
    format!("coverage : {requester} > #basic blocks")
}

/// Variant applied when the discovery came out of a minimize re-execution,
/// so the credit stays with the true origin.
pub fn via_minimize(stat: String) -> String {
    format!("{stat} (via {STAT_MINIMIZE})")
}
