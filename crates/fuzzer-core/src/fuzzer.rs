//! The fuzzing orchestrator.
//!
//! Executors repeatedly ask [`Fuzzer::next_input`] for work and report
//! back through [`Fuzzer::done`]. The orchestrator either serves a queued
//! job request or synthesises a fresh generate/mutate request, triages any
//! new max-signal found in results by spawning triage jobs, refreshes the
//! cached choice table in the background, and emits a backpressure
//! notification when the candidate queue runs low.

use crate::ablation::AblationConfig;
use crate::cover::{Cover, CoverStats};
use crate::exec::{CallInfo, Candidate, ExecResult, ProgFlags, Request};
use crate::job::{
    candidate_request, gen_prog_request, mutate_prog_request, triage_job_prio, Job, TriageJob,
    CANDIDATE_PRIO,
};
use crate::queue::{Priority, PriorityQueue};
use crate::stats::{ModeStats, STAT_CANDIDATE};
use crate::target::{CallId, Corpus, CorpusStats, NewInput, Target};
use crossbeam::channel::{bounded, tick, Receiver, Sender};
use crossbeam::select;
use log::{debug, error, info};
use parking_lot::Mutex;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// An outstanding request older than this is considered lost; under debug
/// the process aborts.
const EXEC_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// How often the stats reporter renders totals and folds deltas.
const REPORT_PERIOD: Duration = Duration::from_secs(30);

/// Orchestrator configuration. Everything is fixed for the lifetime of
/// the fuzzer.
pub struct Config<T: Target> {
    /// Enables the leak detector and the periodic gauge log.
    pub debug: bool,
    pub corpus: Arc<dyn Corpus<T::Prog>>,
    /// Whether real coverage feedback is available. Without it, mutation
    /// yields weak signal, so the fuzzer generates more.
    pub coverage: bool,
    pub fault_injection: bool,
    /// Enables comparison hints.
    pub comparisons: bool,
    pub collide: bool,
    pub enabled_calls: HashSet<CallId>,
    /// Call ids frozen during mutation.
    pub no_mutate_calls: HashSet<CallId>,
    /// Propagated to the executor fleet; the core itself does not act on
    /// it.
    pub leak_checking: bool,
    pub fetch_raw_cover: bool,
    /// When fewer candidate requests than this are queued, the
    /// `need_candidates` notification fires.
    pub min_candidates: u64,
    /// Log every program counter newly added to the corpus coverage.
    pub log_new_pcs: bool,
    /// Saved corpus inputs are mirrored here, if set.
    pub new_inputs: Option<Sender<NewInput<T::Prog>>>,
    pub ablation: AblationConfig,
}

struct Shared {
    stats: HashMap<String, u64>,
    running: HashMap<u64, Instant>,
    rng: Xoshiro256PlusPlus,
}

struct CtCache<C> {
    table: Arc<C>,
    progs: usize,
}

/// Aggregate live snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct FuzzerStats {
    pub cover: CoverStats,
    pub corpus: CorpusStats,
    pub candidates: i64,
    pub running_jobs: i64,
}

pub struct Fuzzer<T: Target> {
    pub config: Config<T>,
    pub cover: Cover,

    // Back-reference for handing job threads an owning handle.
    handle: Weak<Fuzzer<T>>,
    target: T,
    mode_stats: ModeStats,
    shared: Mutex<Shared>,

    ct: Mutex<CtCache<T::ChoiceTable>>,
    ct_regenerate: Sender<()>,

    next_exec: PriorityQueue<Arc<Request<T::Prog>>>,
    next_job_id: AtomicI64,
    next_exec_id: AtomicU64,

    running_jobs: AtomicI64,
    queued_candidates: AtomicI64,
    // If the source of candidates runs out of them, we risk emitting one
    // notification per next_input call below the threshold; the flag
    // limits it to one outstanding request.
    candidates_requested: AtomicBool,
    need_candidates_tx: Sender<()>,
    need_candidates_rx: Receiver<()>,

    stop_guard: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl<T: Target> Fuzzer<T> {
    pub fn new(config: Config<T>, target: T, seed: u64) -> Arc<Self> {
        let (need_candidates_tx, need_candidates_rx) = bounded(1);
        // Zero capacity: a nudge is delivered only while the regenerator
        // is idle, so at most one regeneration is ever in flight.
        let (ct_regenerate, regen_rx) = bounded(0);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let initial_table = Arc::new(target.build_choice_table(&[], &config.enabled_calls));
        let debug_services = config.debug;
        let fuzzer = Arc::new_cyclic(|handle| Fuzzer {
            config,
            cover: Cover::default(),
            handle: handle.clone(),
            target,
            mode_stats: ModeStats::default(),
            shared: Mutex::new(Shared {
                stats: HashMap::new(),
                running: HashMap::new(),
                rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            }),
            ct: Mutex::new(CtCache { table: initial_table, progs: 0 }),
            ct_regenerate,
            next_exec: PriorityQueue::new(),
            next_job_id: AtomicI64::new(0),
            next_exec_id: AtomicU64::new(0),
            running_jobs: AtomicI64::new(0),
            queued_candidates: AtomicI64::new(0),
            candidates_requested: AtomicBool::new(false),
            need_candidates_tx,
            need_candidates_rx,
            stop_guard: Mutex::new(Some(stop_tx)),
            stop_rx,
        });

        let updater = fuzzer.clone();
        thread::spawn(move || updater.choice_table_updater(regen_rx));
        if debug_services {
            let detector = fuzzer.clone();
            thread::spawn(move || detector.leak_detector());
            let gauges = fuzzer.clone();
            thread::spawn(move || gauges.log_current_stats());
        }
        fuzzer
    }

    fn arc(&self) -> Arc<Self> {
        // The orchestrator always lives in an Arc (see `new`).
        self.handle.upgrade().expect("orchestrator dropped while in use")
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn mode_stats(&self) -> &ModeStats {
        &self.mode_stats
    }

    /// Receiver of the candidate backpressure notification: one message
    /// means "produce more candidates".
    pub fn need_candidates(&self) -> Receiver<()> {
        self.need_candidates_rx.clone()
    }

    /// Cancel the fuzzer: blocked jobs observe `stop` results and unwind,
    /// background services exit.
    pub fn stop(&self) {
        self.stop_guard.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_guard.lock().is_none()
    }

    /// Hot path called by every executor: the next request to run.
    pub fn next_input(&self) -> Arc<Request<T::Prog>> {
        let req = self.next_request();
        self.shared.lock().running.insert(req.id, Instant::now());
        if req.stat == STAT_CANDIDATE
            && self.queued_candidates.fetch_sub(1, Ordering::SeqCst) - 1 < 0
        {
            panic!("queued candidates counter is out of sync");
        }
        if self.need_candidates_now()
            && self
                .candidates_requested
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // A full channel means a request is already pending.
            let _ = self.need_candidates_tx.try_send(());
        }
        req
    }

    fn next_request(&self) -> Arc<Request<T::Prog>> {
        if let Some(req) = self.next_exec.try_pop() {
            return req;
        }
        // Either generate a new input or mutate an existing one. Without
        // real coverage the fallback signal is weak, so generate more.
        let mutate_rate = if self.config.coverage { 0.95 } else { 0.5 };
        let mut rnd = self.fresh_rng();
        if rnd.random_bool(mutate_rate) {
            if let Some(req) = mutate_prog_request(self, &mut rnd) {
                return self.prepare(req);
            }
        }
        let req = gen_prog_request(self, &mut rnd);
        self.prepare(req)
    }

    pub fn need_candidates_now(&self) -> bool {
        self.queued_candidates.load(Ordering::SeqCst) < self.config.min_candidates as i64
    }

    /// Seed externally supplied programs at candidate priority.
    pub fn add_candidates(&self, candidates: Vec<Candidate<T::Prog>>) {
        self.queued_candidates.fetch_add(candidates.len() as i64, Ordering::SeqCst);
        for candidate in candidates {
            self.push_exec(candidate_request(candidate), Priority::base(CANDIDATE_PRIO));
        }
        self.candidates_requested.store(false, Ordering::SeqCst);
    }

    /// Deliver the result of one execution. Triage of individual calls
    /// happens before the waiting job is unblocked, because the waiter may
    /// mutate its program right away.
    pub fn done(&self, req: &Arc<Request<T::Prog>>, res: ExecResult) {
        if req.need_signal {
            if let Some(info) = &res.info {
                for (call, call_info) in info.calls.iter().enumerate() {
                    self.triage_prog_call(req, call_info, Some(call));
                }
                self.triage_prog_call(req, &info.extra, None);
            }
        }
        // Unblock the job waiting for the result.
        let _ = req.result.set(res.clone());
        if let Some(tx) = &req.result_tx {
            let _ = tx.send(res);
        }
        let mut shared = self.shared.lock();
        *shared.stats.entry(req.stat.to_string()).or_default() += 1;
        shared.running.remove(&req.id);
    }

    fn triage_prog_call(&self, req: &Arc<Request<T::Prog>>, info: &CallInfo, call: Option<usize>) {
        let prio = signal_prio(&self.target, &req.prog, info, call);
        let new_max_signal = self.cover.add_raw_max_signal(&info.signal, prio);
        if new_max_signal.is_empty() {
            return;
        }
        if req.flags.contains(ProgFlags::IN_TRIAGE) {
            // We are already triaging this exact program; everything found
            // now is flaky.
            debug!("found new flaky signal in call {call:?} in {}", req.prog);
            return;
        }
        debug!("found new signal in call {call:?} in {}", req.prog);
        self.start_job(Box::new(TriageJob::new(
            req.prog.clone(),
            call,
            info.clone(),
            new_max_signal,
            req.flags,
            triage_job_prio(req.flags),
            req.stat,
            req.requester_stat,
        )));
    }

    pub(crate) fn start_job(&self, mut job: Box<dyn Job<T>>) {
        debug!("started {} job", job.kind());
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        job.save_id(id);
        let fuzzer = self.arc();
        self.running_jobs.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            job.run(&fuzzer);
            fuzzer.running_jobs.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn prepare(&self, mut req: Request<T::Prog>) -> Arc<Request<T::Prog>> {
        req.validate();
        req.id = self.next_exec_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(req)
    }

    pub(crate) fn push_exec(&self, req: Request<T::Prog>, prio: Priority) {
        let req = self.prepare(req);
        self.next_exec.push(req, prio);
    }

    /// Submit a request on behalf of a job and block until its result
    /// arrives or the fuzzer is cancelled. This is the only way jobs
    /// retrieve execution feedback.
    pub(crate) fn exec(&self, prio: Priority, mut req: Request<T::Prog>) -> ExecResult {
        let (tx, rx) = bounded(1);
        req.result_tx = Some(tx);
        self.push_exec(req, prio);
        let stop_rx = &self.stop_rx;
        select! {
            recv(stop_rx) -> _ => ExecResult::stopped(),
            recv(rx) -> res => res.unwrap_or_else(|_| ExecResult::stopped()),
        }
    }

    /// Mirror a saved input to the configured channel, unless cancelled.
    pub(crate) fn send_new_input(&self, input: NewInput<T::Prog>) {
        let Some(tx) = &self.config.new_inputs else { return };
        let stop_rx = &self.stop_rx;
        select! {
            recv(stop_rx) -> _ => {}
            send(tx, input) -> _ => {}
        }
    }

    pub(crate) fn log_new_pcs(&self, new_pcs: &[u32], stat: &str, requester_stat: &str) {
        if !self.config.log_new_pcs {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        for &pc in new_pcs {
            let record = json!({
                "pc_uint32": pc.to_string(),
                "pc_uint64_hex_padded": format!("0xffffffff{pc:08x}"),
                "stat": stat,
                "requester_stat": requester_stat,
            });
            info!("{now};new corpus pc;{record}");
        }
    }

    /// Derive an independent generator; the master generator is only ever
    /// touched under the shared mutex, so no generator crosses tasks.
    pub(crate) fn fresh_rng(&self) -> Xoshiro256PlusPlus {
        let seed = self.shared.lock().rng.next_u64();
        Xoshiro256PlusPlus::seed_from_u64(seed)
    }

    pub(crate) fn with_stats<R>(&self, f: impl FnOnce(&mut HashMap<String, u64>) -> R) -> R {
        f(&mut self.shared.lock().stats)
    }

    /// The current choice table; nudges the background regenerator when
    /// the corpus has outgrown the cached table.
    pub fn choice_table(&self) -> Arc<T::ChoiceTable> {
        let progs = self.config.corpus.programs();

        let ct = self.ct.lock();
        // There were no deep ideas nor any calculations behind these
        // numbers.
        let regenerate_every = if progs.len() < 100 { 33 } else { 333 };
        if ct.progs + regenerate_every < progs.len() {
            // Losing the message is fine; it means the table is already
            // being regenerated.
            let _ = self.ct_regenerate.try_send(());
        }
        ct.table.clone()
    }

    fn update_choice_table(&self, progs: &[T::Prog]) {
        let table = Arc::new(self.target.build_choice_table(progs, &self.config.enabled_calls));

        let mut ct = self.ct.lock();
        // Never replace the table with one built from fewer programs.
        if progs.len() >= ct.progs {
            ct.progs = progs.len();
            ct.table = table;
        }
    }

    fn choice_table_updater(self: Arc<Self>, regen_rx: Receiver<()>) {
        loop {
            let stop_rx = &self.stop_rx;
            let regen_rx = &regen_rx;
            select! {
                recv(stop_rx) -> _ => return,
                recv(regen_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                }
            }
            self.update_choice_table(&self.config.corpus.programs());
        }
    }

    /// Abort when a request has been outstanding for longer than the
    /// executor layer could possibly need: the request was lost.
    fn leak_detector(self: Arc<Self>) {
        let ticker = tick(EXEC_TIMEOUT);
        loop {
            let stop_rx = &self.stop_rx;
            let ticker = &ticker;
            select! {
                recv(stop_rx) -> _ => return,
                recv(ticker) -> _ => {
                    let shared = self.shared.lock();
                    for (id, started) in &shared.running {
                        if started.elapsed() > EXEC_TIMEOUT {
                            panic!("execution of request {id} timed out");
                        }
                    }
                }
            }
        }
    }

    fn log_current_stats(self: Arc<Self>) {
        let ticker = tick(Duration::from_secs(60));
        loop {
            let stop_rx = &self.stop_rx;
            let ticker = &ticker;
            select! {
                recv(stop_rx) -> _ => return,
                recv(ticker) -> _ => {
                    let running = self.shared.lock().running.len();
                    info!(
                        "exec queue size: {}, running execs: {}",
                        self.next_exec.len(),
                        running
                    );
                }
            }
        }
    }

    /// Start the periodic reporter: logs the total mode/mutator counts and
    /// mode durations as JSON, and folds the per-interval deltas into the
    /// named stats map.
    pub fn start_stats_reporter(&self) {
        let fuzzer = self.arc();
        thread::spawn(move || {
            let ticker = tick(REPORT_PERIOD);
            let mut prev_counts: HashMap<String, u64> = HashMap::new();
            loop {
                let stop_rx = &fuzzer.stop_rx;
                let ticker = &ticker;
                select! {
                    recv(stop_rx) -> _ => return,
                    recv(ticker) -> _ => {}
                }

                let counts = fuzzer.mode_stats.counts();
                match serde_json::to_string(&counts) {
                    Ok(rendered) => info!("total counts: {rendered}"),
                    Err(err) => error!("failed to encode counts: {err}"),
                }
                let durations = fuzzer.mode_stats.durations_ms();
                match serde_json::to_string(&durations) {
                    Ok(rendered) => info!("total durations (ms): {rendered}"),
                    Err(err) => error!("failed to encode durations: {err}"),
                }

                fuzzer.with_stats(|stats| {
                    for (name, &current) in &counts {
                        let prev = prev_counts.get(name).copied().unwrap_or(0);
                        stats.insert(name.clone(), current - prev);
                        prev_counts.insert(name.clone(), current);
                    }
                });
            }
        });
    }

    /// Swap the named stats map for a fresh one and return the snapshot.
    pub fn grab_stats(&self) -> HashMap<String, u64> {
        std::mem::take(&mut self.shared.lock().stats)
    }

    /// Like [`Fuzzer::grab_stats`], plus the live gauges.
    pub fn grab_all_stats(&self) -> HashMap<String, u64> {
        let mut r = self.grab_stats();
        let running_execs = self.shared.lock().running.len() as u64;
        r.insert(
            "running jobs".to_string(),
            self.running_jobs.load(Ordering::SeqCst).max(0) as u64,
        );
        r.insert(
            "queued candidates".to_string(),
            self.queued_candidates.load(Ordering::SeqCst).max(0) as u64,
        );
        r.insert("exec queue size".to_string(), self.next_exec.len() as u64);
        r.insert("running execs".to_string(), running_execs);
        r
    }

    pub fn stats(&self) -> FuzzerStats {
        FuzzerStats {
            cover: self.cover.stats(),
            corpus: self.config.corpus.stats(),
            candidates: self.queued_candidates.load(Ordering::SeqCst),
            running_jobs: self.running_jobs.load(Ordering::SeqCst),
        }
    }

    pub fn running_jobs(&self) -> i64 {
        self.running_jobs.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.next_exec.len()
    }

    pub fn running_execs(&self) -> usize {
        self.shared.lock().running.len()
    }
}

/// Priority byte of one call's signal: bit 1 for a successful call, bit 0
/// for a call not contained in the target's call-list. The extra bucket
/// always has priority 0.
pub(crate) fn signal_prio<T: Target>(
    target: &T,
    p: &T::Prog,
    info: &CallInfo,
    call: Option<usize>,
) -> u8 {
    let Some(call) = call else { return 0 };
    let mut prio = 0;
    if info.errno == 0 {
        prio |= 1 << 1;
    }
    if !target.call_contains_any(p, call) {
        prio |= 1 << 0;
    }
    prio
}
