//! External contracts consumed by the fuzzing core.
//!
//! The core is generic over the program representation and its algorithmic
//! library (generation, mutation, minimization, collide rewriting), and
//! over the corpus store. Both are opaque behind these traits; the core
//! only moves programs around, never inspects them.

use crate::signal::Signal;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Identifier of a system call in the target's call table.
pub type CallId = u32;

/// Comparison operands captured for one call: each operand observed on the
/// left-hand side of a comparison, mapped to the values it was compared
/// against.
pub type CompMap = HashMap<u64, Vec<u64>>;

/// The individual mutators the mutation engine may apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutatorKind {
    SquashAny,
    Splice,
    InsertCall,
    MutateArg,
    RemoveCall,
    Shuffle,
}

impl MutatorKind {
    pub const ALL: [MutatorKind; 6] = [
        MutatorKind::SquashAny,
        MutatorKind::Splice,
        MutatorKind::InsertCall,
        MutatorKind::MutateArg,
        MutatorKind::RemoveCall,
        MutatorKind::Shuffle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MutatorKind::SquashAny => "mutator squash any",
            MutatorKind::Splice => "mutator splice",
            MutatorKind::InsertCall => "mutator insert call",
            MutatorKind::MutateArg => "mutator mutate arg",
            MutatorKind::RemoveCall => "mutator remove call",
            MutatorKind::Shuffle => "mutator shuffle",
        }
    }
}

/// How many times each mutator fired during one mutation pass.
pub type MutatorUsage = HashMap<MutatorKind, u64>;

/// Outcome accounting for the squash-any path of the mutation engine.
#[derive(Clone, Debug, Default)]
pub struct SquashAnalysis {
    pub successes: u64,
    pub failures: u64,
    pub time_success: Duration,
    pub time_failed: Duration,
}

/// What one mutation pass reported back.
#[derive(Clone, Debug, Default)]
pub struct MutationReport {
    pub usage: MutatorUsage,
    pub squash: SquashAnalysis,
}

/// The program-algorithm library: generation, mutation, minimization and
/// the collide rewriters, all specific to one fuzzed target.
pub trait Target: Send + Sync + 'static {
    type Prog: Clone + fmt::Display + Send + Sync + 'static;
    type ChoiceTable: Send + Sync + 'static;

    /// Generate a fresh program of up to `ncalls` calls, biased by the
    /// choice table.
    fn generate(
        &self,
        rnd: &mut dyn RngCore,
        ncalls: usize,
        ct: &Self::ChoiceTable,
    ) -> Self::Prog;

    /// Build a biasing table from corpus programs and the enabled calls.
    fn build_choice_table(
        &self,
        progs: &[Self::Prog],
        enabled_calls: &HashSet<CallId>,
    ) -> Self::ChoiceTable;

    /// Mutate `p` in place, reporting which mutators fired.
    #[allow(clippy::too_many_arguments)]
    fn mutate(
        &self,
        p: &mut Self::Prog,
        rnd: &mut dyn RngCore,
        ncalls: usize,
        ct: &Self::ChoiceTable,
        no_mutate_calls: &HashSet<CallId>,
        corpus: &[Self::Prog],
    ) -> MutationReport;

    /// For every match between an argument of `call` and a captured
    /// comparison operand, construct a mutant and hand it to `exec`.
    /// Traversal stops when `exec` returns false.
    fn mutate_with_hints(
        &self,
        p: &Self::Prog,
        call: usize,
        comps: &CompMap,
        exec: &mut dyn FnMut(Self::Prog) -> bool,
    );

    /// Minimize `p` while `pred` keeps accepting the shrunk candidate.
    /// Returns the final program and the (possibly shifted) call index.
    fn minimize(
        &self,
        p: Self::Prog,
        call: Option<usize>,
        crash_mode: bool,
        pred: &mut dyn FnMut(&Self::Prog, Option<usize>) -> bool,
    ) -> (Self::Prog, Option<usize>);

    fn call_count(&self, p: &Self::Prog) -> usize;

    /// Human-readable name of one call, for logging.
    fn call_name(&self, p: &Self::Prog, call: usize) -> String;

    /// Whether the call is contained in the target's call-list; feeds the
    /// signal priority byte.
    fn call_contains_any(&self, p: &Self::Prog, call: usize) -> bool;

    /// Mark `call` so that its nth fault site fails when executed.
    fn set_fail_nth(&self, p: &mut Self::Prog, call: usize, nth: usize);

    /// Old-style collide: the program is rewritten for double execution.
    /// An error means the rewrite is not applicable to this program.
    fn double_exec_collide(
        &self,
        p: &Self::Prog,
        rnd: &mut dyn RngCore,
    ) -> anyhow::Result<Self::Prog>;

    /// Collide by duplicating random calls.
    fn dup_call_collide(&self, p: &Self::Prog, rnd: &mut dyn RngCore)
        -> anyhow::Result<Self::Prog>;

    /// Mark random calls as asynchronous.
    fn assign_random_async(&self, p: &Self::Prog, rnd: &mut dyn RngCore) -> Self::Prog;

    /// Mark random calls for rerun, in place.
    fn assign_random_rerun(&self, p: &mut Self::Prog, rnd: &mut dyn RngCore);

    /// Recommended number of calls for generated programs.
    fn recommended_calls(&self) -> usize {
        20
    }
}

/// A new corpus input produced by triage.
#[derive(Clone, Debug)]
pub struct NewInput<P> {
    pub prog: P,
    pub call: Option<usize>,
    pub signal: Signal,
    pub cover: Vec<u32>,
    pub raw_cover: Vec<u32>,
}

/// What the corpus reported back for a save.
#[derive(Clone, Debug, Default)]
pub struct SaveOutcome {
    /// Program counters that were new to the corpus coverage.
    pub new_pcs: Vec<u32>,
    /// How much the corpus coverage grew; 0 means no new coverage.
    pub cover_delta: u64,
}

/// Corpus snapshot for the aggregate stats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CorpusStats {
    pub programs: u64,
    pub signal: u64,
}

/// The corpus store: an opaque "choose a program / save a new input"
/// service.
pub trait Corpus<P>: Send + Sync + 'static {
    /// Pick a program uniformly, or `None` if the corpus is empty.
    fn choose_program(&self, rnd: &mut dyn RngCore) -> Option<P>;

    /// Snapshot of every program currently in the corpus.
    fn programs(&self) -> Vec<P>;

    fn save(&self, input: &NewInput<P>) -> SaveOutcome;

    fn stats(&self) -> CorpusStats;
}
