//! Job taxonomy: the per-candidate pipeline behind the fuzzing loop.
//!
//! Programs for which an execution claimed new max-signal are handed to a
//! triage job, which deflakes the signal, minimizes the program and saves
//! it to the corpus. Every saved input is then smashed (an aggressive
//! mutation burst), which in turn can spawn a hints job matching call
//! arguments against captured comparison operands. Jobs are self-contained
//! tasks; they call back into the orchestrator only to submit follow-up
//! work.

use crate::exec::{CallInfo, Candidate, ProgFlags, ProgInfo, Request};
use crate::fuzzer::{signal_prio, Fuzzer};
use crate::queue::Priority;
use crate::signal::{CoverSet, Signal};
use crate::stats::{
    all_contribution_stat, contribution_stat, coverage_blocks_stat, via_minimize, Mode,
    STAT_CANDIDATE, STAT_COLLIDE, STAT_FUZZ, STAT_FUZZ_FROM_SMASH, STAT_GENERATE, STAT_HINT,
    STAT_MINIMIZE, STAT_SEED, STAT_SEED_FROM_HINT, STAT_SMASH, STAT_TRIAGE,
};
use crate::target::{MutationReport, Target};
use log::{debug, trace};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::Instant;

// Base priorities, best first. A job's requests inherit its full vector.
// Generated requests are synthesised on demand and never queued, so their
// slot in the order is documentation only.
pub(crate) const CANDIDATE_TRIAGE_PRIO: i64 = 1;
pub(crate) const CANDIDATE_PRIO: i64 = 2;
pub(crate) const TRIAGE_PRIO: i64 = 3;
#[allow(dead_code)]
pub(crate) const GEN_PRIO: i64 = 4;
pub(crate) const SMASH_PRIO: i64 = 5;

pub(crate) trait Job<T: Target>: Send {
    fn kind(&self) -> &'static str;
    fn save_id(&mut self, id: i64);
    fn priority(&self) -> Priority;
    fn run(self: Box<Self>, fuzzer: &Fuzzer<T>);
}

/// Priority vector shared by a job and every request it submits.
///
/// If requests were ordered by base priority alone, thousands of
/// simultaneous jobs would slowly progress in parallel; appending the job
/// id lets same-priority jobs that started earlier finish first. The
/// orchestrator attaches the id at the moment of job creation.
#[derive(Clone, Debug)]
pub(crate) struct JobPriority(Priority);

impl JobPriority {
    pub(crate) fn new(base: i64) -> Self {
        JobPriority(Priority::base(base))
    }

    pub(crate) fn save_id(&mut self, id: i64) {
        self.0.save_id(id);
    }

    pub(crate) fn get(&self) -> Priority {
        self.0.clone()
    }
}

pub(crate) fn triage_job_prio(flags: ProgFlags) -> JobPriority {
    if flags.contains(ProgFlags::CANDIDATE) {
        JobPriority::new(CANDIDATE_TRIAGE_PRIO)
    } else {
        JobPriority::new(TRIAGE_PRIO)
    }
}

pub(crate) fn gen_prog_request<T: Target>(
    fuzzer: &Fuzzer<T>,
    rnd: &mut Xoshiro256PlusPlus,
) -> Request<T::Prog> {
    let ct = fuzzer.choice_table();
    let p = if fuzzer.config.ablation.disable_mode_generate {
        // Generation is ablated: keep the executors fed with empty
        // programs so the rest of the accounting stays comparable.
        fuzzer.target().generate(rnd, 0, &ct)
    } else {
        fuzzer.mode_stats().inc_mode(Mode::Generate);
        let start = Instant::now();
        let p = fuzzer.target().generate(rnd, fuzzer.target().recommended_calls(), &ct);
        fuzzer.mode_stats().add_mode_duration(Mode::Generate, start.elapsed());
        p
    };
    let mut req = Request::new(p, STAT_GENERATE, STAT_GENERATE);
    req.need_signal = true;
    req
}

pub(crate) fn mutate_prog_request<T: Target>(
    fuzzer: &Fuzzer<T>,
    rnd: &mut Xoshiro256PlusPlus,
) -> Option<Request<T::Prog>> {
    let mut p = fuzzer.config.corpus.choose_program(rnd)?;
    let ablation = &fuzzer.config.ablation;
    if !ablation.disable_mode_mutate && ablation.any_mutator_enabled() {
        fuzzer.mode_stats().inc_mode(Mode::Mutate);
        let ct = fuzzer.choice_table();
        let corpus_progs = fuzzer.config.corpus.programs();
        let start = Instant::now();
        let report = fuzzer.target().mutate(
            &mut p,
            rnd,
            fuzzer.target().recommended_calls(),
            &ct,
            &fuzzer.config.no_mutate_calls,
            &corpus_progs,
        );
        fuzzer.mode_stats().add_mode_duration(Mode::Mutate, start.elapsed());
        record_mutation_report(fuzzer, &report);
    }
    let mut req = Request::new(p, STAT_FUZZ, STAT_FUZZ);
    req.need_signal = true;
    Some(req)
}

pub(crate) fn candidate_request<P>(input: Candidate<P>) -> Request<P> {
    let mut flags = ProgFlags::CANDIDATE;
    if input.minimized {
        flags = flags | ProgFlags::MINIMIZED;
    }
    if input.smashed {
        flags = flags | ProgFlags::SMASHED;
    }
    let mut req = Request::new(input.prog, STAT_CANDIDATE, STAT_CANDIDATE);
    req.need_signal = true;
    req.flags = flags;
    req
}

/// Feed the mutator usage and the squash analysis into the sinks.
fn record_mutation_report<T: Target>(fuzzer: &Fuzzer<T>, report: &MutationReport) {
    for (&kind, &count) in &report.usage {
        fuzzer.mode_stats().add_mutator(kind, count);
    }
    let squash = &report.squash;
    fuzzer.with_stats(|stats| {
        *stats.entry("analysis : squash any > #successes".to_string()).or_default() +=
            squash.successes;
        *stats.entry("analysis : squash any > #fails".to_string()).or_default() +=
            squash.failures;
        *stats.entry("analysis : squash any > time spent (successes)".to_string()).or_default() +=
            squash.time_success.as_nanos() as u64;
        *stats.entry("analysis : squash any > time spent (fails)".to_string()).or_default() +=
            squash.time_failed.as_nanos() as u64;
    });
}

/// Programs that produced potential new coverage on first execution.
/// Triage decides whether the coverage is real, and if so minimizes the
/// program and adds it to the corpus.
pub(crate) struct TriageJob<T: Target> {
    p: T::Prog,
    call: Option<usize>,
    info: CallInfo,
    new_signal: Signal,
    flags: ProgFlags,
    prio: JobPriority,
    // The origin of the request that started this job; coverage found
    // here is credited back to it.
    stat: &'static str,
    requester_stat: &'static str,
}

impl<T: Target> TriageJob<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        p: T::Prog,
        call: Option<usize>,
        info: CallInfo,
        new_signal: Signal,
        flags: ProgFlags,
        prio: JobPriority,
        stat: &'static str,
        requester_stat: &'static str,
    ) -> Self {
        TriageJob { p, call, info, new_signal, flags, prio, stat, requester_stat }
    }

    fn call_desc(&self, fuzzer: &Fuzzer<T>) -> String {
        match self.call {
            Some(call) => format!("call #{call} {}", fuzzer.target().call_name(&self.p, call)),
            None => "extra".to_string(),
        }
    }

    fn deflake(&self, fuzzer: &Fuzzer<T>) -> (DeflakedCover, bool) {
        const SIGNAL_RUNS: usize = 3;

        let mut info = DeflakedCover::default();
        let mut not_executed = 0;
        for run in 0..SIGNAL_RUNS {
            let mut req = Request::new(self.p.clone(), STAT_TRIAGE, self.requester_stat);
            req.need_signal = true;
            req.need_cover = true;
            req.need_raw_cover = fuzzer.config.fetch_raw_cover;
            req.flags = ProgFlags::IN_TRIAGE;
            let result = fuzzer.exec(self.prio.get(), req);
            if result.stop {
                return (info, true);
            }
            let prog_info = result
                .info
                .as_ref()
                .filter(|pi| reexecution_success(pi, &self.info, self.call));
            let Some(prog_info) = prog_info else {
                // The call was not executed or failed.
                not_executed += 1;
                if not_executed >= SIGNAL_RUNS / 2 + 1 {
                    // Happens too often; give up.
                    return (info, true);
                }
                continue;
            };
            let (this_signal, this_cover) =
                get_signal_and_cover(fuzzer.target(), &self.p, prog_info, self.call);
            if info.raw_cover.is_empty() && fuzzer.config.fetch_raw_cover {
                info.raw_cover = this_cover.clone();
            }
            if run == 0 {
                info.new_stable_signal = self.new_signal.intersection(&this_signal);
                info.stable_signal = this_signal;
            } else {
                info.stable_signal = info.stable_signal.intersection(&this_signal);
                info.new_stable_signal = info.new_stable_signal.intersection(&this_signal);
            }
            if info.new_stable_signal.is_empty() {
                // Flaky elements must not reach minimization or the corpus.
                return (info, false);
            }
            info.cover.merge(&this_cover);
        }
        (info, false)
    }

    fn minimize(&mut self, fuzzer: &Fuzzer<T>, new_signal: &Signal) -> bool {
        const MINIMIZE_ATTEMPTS: usize = 3;

        let mut stop = false;
        let prio = self.prio.get();
        let old_info = self.info.clone();
        let requester_stat = self.requester_stat;
        let (p, call) = fuzzer.target().minimize(
            self.p.clone(),
            self.call,
            false,
            &mut |p1, call1| {
                if fuzzer.config.ablation.disable_stage_minimize {
                    return false;
                }
                if stop {
                    return false;
                }
                for _ in 0..MINIMIZE_ATTEMPTS {
                    let mut req = Request::new(p1.clone(), STAT_MINIMIZE, requester_stat);
                    req.need_signal = true;
                    let result = fuzzer.exec(prio.clone(), req);
                    if result.stop {
                        stop = true;
                        return false;
                    }
                    let prog_info = result
                        .info
                        .as_ref()
                        .filter(|pi| reexecution_success(pi, &old_info, call1));
                    let Some(prog_info) = prog_info else { continue };
                    let (this_signal, _) =
                        get_signal_and_cover(fuzzer.target(), p1, prog_info, call1);
                    if new_signal.intersection(&this_signal).len() == new_signal.len() {
                        return true;
                    }
                }
                false
            },
        );
        self.p = p;
        self.call = call;
        stop
    }
}

impl<T: Target> Job<T> for TriageJob<T> {
    fn kind(&self) -> &'static str {
        "triage"
    }

    fn save_id(&mut self, id: i64) {
        self.prio.save_id(id);
    }

    fn priority(&self) -> Priority {
        self.prio.get()
    }

    fn run(mut self: Box<Self>, fuzzer: &Fuzzer<T>) {
        let call_desc = self.call_desc(fuzzer);
        trace!("triaging input for {call_desc} (new signal={})", self.new_signal.len());

        // Compute input coverage and non-flaky signal for minimization.
        let (info, stop) = self.deflake(fuzzer);
        if stop || info.new_stable_signal.is_empty() {
            return;
        }

        if !self.flags.contains(ProgFlags::MINIMIZED)
            && self.minimize(fuzzer, &info.new_stable_signal)
        {
            return;
        }

        debug!("added new input for {call_desc} to the corpus: {}", self.p);
        let input = crate::target::NewInput {
            prog: self.p.clone(),
            call: self.call,
            signal: info.stable_signal,
            cover: info.cover.serialize(),
            raw_cover: info.raw_cover,
        };
        let outcome = fuzzer.config.corpus.save(&input);
        let cover_changed = outcome.cover_delta > 0;

        // Credit the discovery to the mode of the request that started
        // this job; coverage surfaced by a minimize re-execution is
        // recorded as a "via minimize" variant of the true origin.
        let (contrib, blocks) = if self.stat == STAT_MINIMIZE {
            (
                via_minimize(contribution_stat(self.requester_stat, cover_changed)),
                via_minimize(coverage_blocks_stat(self.requester_stat)),
            )
        } else {
            (
                contribution_stat(self.requester_stat, cover_changed),
                coverage_blocks_stat(self.requester_stat),
            )
        };
        fuzzer.with_stats(|stats| {
            *stats.entry(contrib).or_default() += 1;
            *stats.entry(blocks).or_default() += outcome.cover_delta;
            *stats.entry(all_contribution_stat(cover_changed)).or_default() += 1;
        });
        fuzzer.log_new_pcs(&outcome.new_pcs, self.stat, self.requester_stat);

        if !self.flags.contains(ProgFlags::SMASHED) {
            fuzzer.start_job(Box::new(SmashJob {
                p: self.p.clone(),
                call: self.call,
                prio: JobPriority::new(SMASH_PRIO),
            }));
        }
        fuzzer.send_new_input(input);
    }
}

#[derive(Default)]
struct DeflakedCover {
    stable_signal: Signal,
    new_stable_signal: Signal,
    cover: CoverSet,
    raw_cover: Vec<u32>,
}

fn reexecution_success(
    info: &ProgInfo,
    old_info: &CallInfo,
    call: Option<usize>,
) -> bool {
    match call {
        Some(call) => {
            let Some(call_info) = info.calls.get(call) else { return false };
            // Don't turn calls from successful into failing; successful
            // calls are much more valuable.
            if old_info.errno == 0 && call_info.errno != 0 {
                return false;
            }
            !call_info.signal.is_empty()
        }
        None => !info.extra.signal.is_empty(),
    }
}

fn get_signal_and_cover<T: Target>(
    target: &T,
    p: &T::Prog,
    info: &ProgInfo,
    call: Option<usize>,
) -> (Signal, Vec<u32>) {
    let call_info = match call {
        Some(call) => match info.calls.get(call) {
            Some(call_info) => call_info,
            None => return (Signal::default(), Vec::new()),
        },
        None => &info.extra,
    };
    (
        Signal::from_raw(&call_info.signal, signal_prio(target, p, call_info, call)),
        call_info.cover.clone(),
    )
}

#[derive(Default)]
struct SmashStats {
    hints_jobs: u64,
    fault_injections: u64,
    dur_mutations: std::time::Duration,
    dur_fault_injection: std::time::Duration,
    dur_full_smash: std::time::Duration,
}

/// Aggressive exploration of the neighbourhood of a just-saved corpus
/// program: 100 mutate-and-run iterations, optional collide variants,
/// optional fault injection, and a hints job when comparisons are on.
pub(crate) struct SmashJob<T: Target> {
    p: T::Prog,
    call: Option<usize>,
    prio: JobPriority,
}

impl<T: Target> SmashJob<T> {
    fn fault_injection(&self, fuzzer: &Fuzzer<T>, call: usize) -> u64 {
        let mut count = 0;
        for nth in 1..=100 {
            debug!("injecting fault into call {call}, step {nth}");
            let mut p = self.p.clone();
            fuzzer.target().set_fail_nth(&mut p, call, nth);
            let result = fuzzer.exec(self.prio.get(), Request::new(p, STAT_SMASH, STAT_SMASH));
            count += 1;
            if result.stop {
                return count;
            }
            if let Some(info) = &result.info {
                // The target has run out of fault sites.
                if info.calls.len() > call && !info.calls[call].fault_injected {
                    break;
                }
            }
        }
        count
    }
}

impl<T: Target> Job<T> for SmashJob<T> {
    fn kind(&self) -> &'static str {
        "smash"
    }

    fn save_id(&mut self, id: i64) {
        self.prio.save_id(id);
    }

    fn priority(&self) -> Priority {
        self.prio.get()
    }

    fn run(self: Box<Self>, fuzzer: &Fuzzer<T>) {
        let ablation = &fuzzer.config.ablation;
        if ablation.disable_mode_smash {
            return;
        }
        let mut smash_stats = SmashStats::default();

        debug!("smashing the program {} (call={:?})", self.p, self.call);
        if fuzzer.config.comparisons {
            if let Some(call) = self.call {
                smash_stats.hints_jobs += 1;
                fuzzer.start_job(Box::new(HintsJob {
                    p: self.p.clone(),
                    call,
                    prio: JobPriority::new(SMASH_PRIO),
                    from_smash: true,
                }));
            }
        }

        fuzzer.mode_stats().inc_mode(Mode::Smash);
        let start = Instant::now();

        const ITERS: usize = 100;
        let mut rnd = fuzzer.fresh_rng();
        for _ in 0..ITERS {
            let mut p = self.p.clone();
            if !ablation.disable_mode_mutate && ablation.any_mutator_enabled() {
                fuzzer.mode_stats().inc_mode(Mode::MutateFromSmash);
                let ct = fuzzer.choice_table();
                let corpus_progs = fuzzer.config.corpus.programs();
                let mutate_start = Instant::now();
                let report = fuzzer.target().mutate(
                    &mut p,
                    &mut rnd,
                    fuzzer.target().recommended_calls(),
                    &ct,
                    &fuzzer.config.no_mutate_calls,
                    &corpus_progs,
                );
                let delta = mutate_start.elapsed();
                fuzzer.mode_stats().add_mode_duration(Mode::MutateFromSmash, delta);
                smash_stats.dur_mutations += delta;
                record_mutation_report(fuzzer, &report);
            }

            let mut req = Request::new(p.clone(), STAT_SMASH, STAT_FUZZ_FROM_SMASH);
            req.need_signal = true;
            if fuzzer.exec(self.prio.get(), req).stop {
                return;
            }

            if !ablation.disable_stage_collide && fuzzer.config.collide {
                let collided = random_collide(fuzzer.target(), &p, &mut rnd);
                let req = Request::new(collided, STAT_COLLIDE, STAT_COLLIDE);
                if fuzzer.exec(self.prio.get(), req).stop {
                    return;
                }
            }
        }

        if fuzzer.config.fault_injection {
            if let Some(call) = self.call {
                let fault_start = Instant::now();
                smash_stats.fault_injections += self.fault_injection(fuzzer, call);
                smash_stats.dur_fault_injection += fault_start.elapsed();
            }
        }

        let delta = start.elapsed();
        fuzzer.mode_stats().add_mode_duration(Mode::Smash, delta);
        smash_stats.dur_full_smash += delta;

        fuzzer.with_stats(|stats| {
            *stats.entry("analysis : smash > #hints jobs started".to_string()).or_default() +=
                smash_stats.hints_jobs;
            *stats.entry("analysis : smash > #fault injections".to_string()).or_default() +=
                smash_stats.fault_injections;
            *stats
                .entry("analysis : smash > time spent (fault injection)".to_string())
                .or_default() += smash_stats.dur_fault_injection.as_nanos() as u64;
            *stats.entry("analysis : smash > time spent (full smash)".to_string()).or_default() +=
                smash_stats.dur_full_smash.as_nanos() as u64;
            *stats.entry("analysis : smash > time spent (mutations)".to_string()).or_default() +=
                smash_stats.dur_mutations.as_nanos() as u64;
        });
    }
}

/// Rewrite a program to stress concurrency, picking one of the collide
/// strategies at random. Constructors that are not applicable fall
/// through to the next branch.
pub(crate) fn random_collide<T: Target>(
    target: &T,
    orig: &T::Prog,
    rnd: &mut Xoshiro256PlusPlus,
) -> T::Prog {
    if rnd.random_range(0..5) == 0 {
        // Old-style collide with a 20% probability.
        if let Ok(p) = target.double_exec_collide(orig, rnd) {
            return p;
        }
    }
    if rnd.random_range(0..4) == 0 {
        // Duplicate random calls with a 20% probability (25% * 80%).
        if let Ok(p) = target.dup_call_collide(orig, rnd) {
            return p;
        }
    }
    let mut p = target.assign_random_async(orig, rnd);
    if rnd.random_bool(0.5) {
        target.assign_random_rerun(&mut p, rnd);
    }
    p
}

/// Match the arguments of one call against the comparison operands the
/// target captured for it, and execute every resulting mutant.
pub(crate) struct HintsJob<T: Target> {
    p: T::Prog,
    call: usize,
    prio: JobPriority,
    from_smash: bool,
}

impl<T: Target> Job<T> for HintsJob<T> {
    fn kind(&self) -> &'static str {
        "hints"
    }

    fn save_id(&mut self, id: i64) {
        self.prio.save_id(id);
    }

    fn priority(&self) -> Priority {
        self.prio.get()
    }

    fn run(self: Box<Self>, fuzzer: &Fuzzer<T>) {
        if fuzzer.config.ablation.disable_mode_hints {
            return;
        }

        // First execute the original program to capture the comparison
        // operands for the chosen call.
        let job_start = Instant::now();
        let mut req = Request::new(self.p.clone(), STAT_SEED, STAT_SEED_FROM_HINT);
        req.need_hints = true;
        let result = fuzzer.exec(self.prio.get(), req);
        if result.stop {
            return;
        }
        let Some(info) = result.info else { return };
        let Some(call_info) = info.calls.get(self.call) else { return };

        // Then mutate the program for every match between an argument and
        // an operand, executing each mutant to check for new coverage.
        fuzzer.mode_stats().inc_mode(Mode::MutateHints);
        let start = Instant::now();
        let prio = self.prio.get();
        fuzzer.target().mutate_with_hints(&self.p, self.call, &call_info.comps, &mut |mutant| {
            let mut req = Request::new(mutant, STAT_HINT, STAT_HINT);
            req.need_signal = true;
            !fuzzer.exec(prio.clone(), req).stop
        });
        fuzzer.mode_stats().add_mode_duration(Mode::MutateHints, start.elapsed());

        if self.from_smash {
            fuzzer.with_stats(|stats| {
                *stats
                    .entry("analysis : smash > time spent (hints job)".to_string())
                    .or_default() += job_start.elapsed().as_nanos() as u64;
            });
        }
    }
}
