//! Shared fixture: a deterministic in-memory target, corpus and executor
//! driver for exercising the whole fuzzing loop.
#![allow(dead_code)]

use fuzzer_core::{
    AblationConfig, CallInfo, CompMap, Config, Corpus, CorpusStats, ExecResult, Fuzzer,
    MutationReport, MutatorKind, NewInput, ProgInfo, Request, SaveOutcome, Target,
};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Program id used for externally seeded candidates, far away from the
/// ids the target hands out.
pub const CAND_ID: u64 = 1_000_000;

#[derive(Clone, Debug)]
pub struct TestProg {
    pub id: u64,
    pub ncalls: usize,
    pub fail_nth: Option<(usize, usize)>,
}

impl TestProg {
    pub fn new(id: u64, ncalls: usize) -> Self {
        TestProg { id, ncalls, fail_nth: None }
    }
}

impl fmt::Display for TestProg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prog{}", self.id)
    }
}

pub struct TestChoiceTable {
    pub progs: usize,
}

pub struct TestTarget {
    next_id: AtomicU64,
    builds: AtomicUsize,
    minimize_probe: bool,
}

impl TestTarget {
    pub fn new() -> Self {
        TestTarget { next_id: AtomicU64::new(1), builds: AtomicUsize::new(0), minimize_probe: false }
    }

    /// A target whose minimizer probes the predicate once before giving
    /// the program back unchanged.
    pub fn with_minimize_probe() -> Self {
        TestTarget { minimize_probe: true, ..TestTarget::new() }
    }

    pub fn choice_table_builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Target for TestTarget {
    type Prog = TestProg;
    type ChoiceTable = TestChoiceTable;

    fn generate(
        &self,
        _rnd: &mut dyn RngCore,
        ncalls: usize,
        _ct: &TestChoiceTable,
    ) -> TestProg {
        TestProg::new(self.fresh_id(), ncalls.min(3))
    }

    fn build_choice_table(
        &self,
        progs: &[TestProg],
        _enabled_calls: &HashSet<u32>,
    ) -> TestChoiceTable {
        self.builds.fetch_add(1, Ordering::SeqCst);
        TestChoiceTable { progs: progs.len() }
    }

    fn mutate(
        &self,
        p: &mut TestProg,
        _rnd: &mut dyn RngCore,
        _ncalls: usize,
        _ct: &TestChoiceTable,
        _no_mutate_calls: &HashSet<u32>,
        _corpus: &[TestProg],
    ) -> MutationReport {
        p.id = self.fresh_id();
        let mut report = MutationReport::default();
        report.usage.insert(MutatorKind::MutateArg, 1);
        report
    }

    fn mutate_with_hints(
        &self,
        p: &TestProg,
        _call: usize,
        comps: &CompMap,
        exec: &mut dyn FnMut(TestProg) -> bool,
    ) {
        for vals in comps.values() {
            for _ in vals {
                if !exec(TestProg::new(self.fresh_id(), p.ncalls)) {
                    return;
                }
            }
        }
    }

    fn minimize(
        &self,
        p: TestProg,
        call: Option<usize>,
        _crash_mode: bool,
        pred: &mut dyn FnMut(&TestProg, Option<usize>) -> bool,
    ) -> (TestProg, Option<usize>) {
        if self.minimize_probe {
            let _ = pred(&p, call);
        }
        (p, call)
    }

    fn call_count(&self, p: &TestProg) -> usize {
        p.ncalls
    }

    fn call_name(&self, _p: &TestProg, call: usize) -> String {
        format!("call_{call}")
    }

    fn call_contains_any(&self, _p: &TestProg, _call: usize) -> bool {
        false
    }

    fn set_fail_nth(&self, p: &mut TestProg, call: usize, nth: usize) {
        p.fail_nth = Some((call, nth));
    }

    fn double_exec_collide(
        &self,
        p: &TestProg,
        _rnd: &mut dyn RngCore,
    ) -> anyhow::Result<TestProg> {
        Ok(p.clone())
    }

    fn dup_call_collide(&self, p: &TestProg, _rnd: &mut dyn RngCore) -> anyhow::Result<TestProg> {
        Ok(p.clone())
    }

    fn assign_random_async(&self, p: &TestProg, _rnd: &mut dyn RngCore) -> TestProg {
        p.clone()
    }

    fn assign_random_rerun(&self, _p: &mut TestProg, _rnd: &mut dyn RngCore) {}
}

#[derive(Default)]
pub struct TestCorpus {
    progs: Mutex<Vec<TestProg>>,
    saves: Mutex<Vec<NewInput<TestProg>>>,
}

impl TestCorpus {
    pub fn new() -> Arc<Self> {
        Arc::new(TestCorpus::default())
    }

    pub fn with_programs(progs: Vec<TestProg>) -> Arc<Self> {
        let corpus = TestCorpus::default();
        *corpus.progs.lock() = progs;
        Arc::new(corpus)
    }

    pub fn set_programs(&self, progs: Vec<TestProg>) {
        *self.progs.lock() = progs;
    }

    pub fn saves(&self) -> Vec<NewInput<TestProg>> {
        self.saves.lock().clone()
    }
}

impl Corpus<TestProg> for TestCorpus {
    fn choose_program(&self, rnd: &mut dyn RngCore) -> Option<TestProg> {
        let progs = self.progs.lock();
        if progs.is_empty() {
            return None;
        }
        let idx = (rnd.next_u64() % progs.len() as u64) as usize;
        Some(progs[idx].clone())
    }

    fn programs(&self) -> Vec<TestProg> {
        self.progs.lock().clone()
    }

    fn save(&self, input: &NewInput<TestProg>) -> SaveOutcome {
        let mut saves = self.saves.lock();
        saves.push(input.clone());
        SaveOutcome { new_pcs: input.cover.clone(), cover_delta: input.cover.len() as u64 }
    }

    fn stats(&self) -> CorpusStats {
        CorpusStats { programs: self.progs.lock().len() as u64, signal: 0 }
    }
}

pub fn base_config(corpus: Arc<TestCorpus>) -> Config<TestTarget> {
    Config {
        debug: false,
        corpus,
        coverage: true,
        fault_injection: false,
        comparisons: false,
        collide: false,
        enabled_calls: HashSet::new(),
        no_mutate_calls: HashSet::new(),
        leak_checking: false,
        fetch_raw_cover: false,
        min_candidates: 0,
        log_new_pcs: false,
        new_inputs: None,
        ablation: AblationConfig::default(),
    }
}

/// A default, uninteresting result: every call executed successfully with
/// no signal.
pub fn empty_info(prog: &TestProg) -> ExecResult {
    ExecResult {
        info: Some(ProgInfo {
            calls: vec![CallInfo::default(); prog.ncalls.max(1)],
            extra: CallInfo::default(),
        }),
        stop: false,
    }
}

/// A result carrying signal (and identical cover) on one call.
pub fn signal_info(prog: &TestProg, call: usize, signal: &[u32]) -> ExecResult {
    let mut res = empty_info(prog);
    let info = res.info.as_mut().unwrap();
    info.calls[call].signal = signal.to_vec();
    info.calls[call].cover = signal.to_vec();
    res
}

/// Run the executor loop on the calling thread until the fuzzer has no
/// running jobs and no queued requests left. The `exec` closure plays the
/// executor fleet.
pub fn drive(
    fuzzer: &Arc<Fuzzer<TestTarget>>,
    exec: &dyn Fn(&Request<TestProg>) -> ExecResult,
    max_iters: usize,
) {
    for _ in 0..max_iters {
        let req = fuzzer.next_input();
        let res = exec(&req);
        fuzzer.done(&req, res);
        if fuzzer.running_jobs() == 0 && fuzzer.queue_len() == 0 {
            return;
        }
        if fuzzer.queue_len() == 0 {
            // Give the job threads a moment to submit follow-up work.
            std::thread::sleep(Duration::from_micros(50));
        }
    }
    panic!("fuzzer did not quiesce within {max_iters} iterations");
}
