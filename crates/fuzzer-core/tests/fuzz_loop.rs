//! End-to-end scenarios for the fuzzing loop: candidate intake, triage,
//! smash, hints and the candidate backpressure signal, all driven by a
//! synchronous executor loop.

mod common;

use common::*;
use crossbeam::channel::unbounded;
use fuzzer_core::stats::{
    STAT_CANDIDATE, STAT_GENERATE, STAT_HINT, STAT_MINIMIZE, STAT_SEED, STAT_SMASH, STAT_TRIAGE,
};
use fuzzer_core::{Candidate, Fuzzer};
use std::collections::HashMap;

const MAX_ITERS: usize = 200_000;

#[test]
fn empty_corpus_generates_and_requests_candidates() {
    let corpus = TestCorpus::new();
    let mut config = base_config(corpus);
    config.min_candidates = 8;
    let fuzzer = Fuzzer::new(config, TestTarget::new(), 0);
    let need_candidates = fuzzer.need_candidates();

    let req = fuzzer.next_input();
    assert_eq!(req.stat(), STAT_GENERATE);
    assert!(req.need_signal);
    assert!(
        need_candidates.try_recv().is_ok(),
        "low candidate queue must notify the candidate source"
    );

    // The notification is one-shot until candidates arrive.
    let req = fuzzer.next_input();
    assert_eq!(req.stat(), STAT_GENERATE);
    assert!(need_candidates.try_recv().is_err());

    // An empty batch still re-arms the notification.
    fuzzer.add_candidates(Vec::new());
    fuzzer.next_input();
    assert!(need_candidates.try_recv().is_ok());

    fuzzer.stop();
}

#[test]
fn minimized_candidate_is_saved_and_smashed() {
    let corpus = TestCorpus::new();
    let (new_inputs_tx, new_inputs_rx) = unbounded();
    let mut config = base_config(corpus.clone());
    config.new_inputs = Some(new_inputs_tx);
    let fuzzer = Fuzzer::new(config, TestTarget::with_minimize_probe(), 1);

    fuzzer.add_candidates(vec![Candidate {
        prog: TestProg::new(CAND_ID, 1),
        minimized: true,
        smashed: false,
    }]);

    drive(
        &fuzzer,
        &|req| {
            if req.prog.id == CAND_ID {
                signal_info(&req.prog, 0, &[7, 8])
            } else {
                empty_info(&req.prog)
            }
        },
        MAX_ITERS,
    );

    let saves = corpus.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].cover, vec![7, 8]);
    assert_eq!(saves[0].signal.len(), 2);
    assert!(saves[0].signal.contains(7) && saves[0].signal.contains(8));
    assert_eq!(saves[0].call, Some(0));

    let stats = fuzzer.grab_stats();
    // Exactly one smash job ran its 100 mutate iterations.
    assert_eq!(stats.get(STAT_SMASH).copied(), Some(100));
    // The already-minimized flag skips minimization entirely.
    assert!(!stats.contains_key(STAT_MINIMIZE));
    // Three deflake runs for the single triage job.
    assert_eq!(stats.get(STAT_TRIAGE).copied(), Some(3));
    assert_eq!(stats.get(STAT_CANDIDATE).copied(), Some(1));
    assert_eq!(
        stats.get("contribution : exec candidate > new coverage").copied(),
        Some(1)
    );

    // The saved input was mirrored to the new-inputs channel.
    let mirrored = new_inputs_rx.try_recv().expect("saved input mirrored");
    assert_eq!(mirrored.prog.id, CAND_ID);

    fuzzer.stop();
}

#[test]
fn fully_processed_candidate_skips_minimize_and_smash() {
    let corpus = TestCorpus::new();
    let config = base_config(corpus.clone());
    let fuzzer = Fuzzer::new(config, TestTarget::with_minimize_probe(), 2);

    fuzzer.add_candidates(vec![Candidate {
        prog: TestProg::new(CAND_ID, 1),
        minimized: true,
        smashed: true,
    }]);

    drive(
        &fuzzer,
        &|req| {
            if req.prog.id == CAND_ID {
                signal_info(&req.prog, 0, &[11])
            } else {
                empty_info(&req.prog)
            }
        },
        MAX_ITERS,
    );

    assert_eq!(corpus.saves().len(), 1);
    let stats = fuzzer.grab_stats();
    assert!(!stats.contains_key(STAT_SMASH));
    assert!(!stats.contains_key(STAT_MINIMIZE));

    fuzzer.stop();
}

#[test]
fn unstable_candidate_leaves_no_trace() {
    let corpus = TestCorpus::new();
    let config = base_config(corpus.clone());
    let fuzzer = Fuzzer::new(config, TestTarget::new(), 3);

    // 42 is already known at full priority; the candidate's claimed new
    // signal {9} never shows up again.
    fuzzer.cover.add_raw_max_signal(&[42], 3);

    fuzzer.add_candidates(vec![Candidate {
        prog: TestProg::new(CAND_ID, 1),
        minimized: false,
        smashed: false,
    }]);

    drive(
        &fuzzer,
        &|req| {
            if req.prog.id != CAND_ID {
                return empty_info(&req.prog);
            }
            if req.stat() == STAT_TRIAGE {
                signal_info(&req.prog, 0, &[42])
            } else {
                signal_info(&req.prog, 0, &[9])
            }
        },
        MAX_ITERS,
    );

    assert_eq!(corpus.saves().len(), 0, "flaky signal must not reach the corpus");
    assert_eq!(fuzzer.cover.len(), 2, "max-signal only holds {{42, 9}}");
    let stats = fuzzer.grab_stats();
    assert!(!stats.contains_key(STAT_SMASH));
    // Deflake gave up after the first re-execution.
    assert_eq!(stats.get(STAT_TRIAGE).copied(), Some(1));

    fuzzer.stop();
}

#[test]
fn hints_job_submits_one_request_per_match() {
    let corpus = TestCorpus::new();
    let mut config = base_config(corpus.clone());
    config.comparisons = true;
    let fuzzer = Fuzzer::new(config, TestTarget::new(), 4);

    fuzzer.add_candidates(vec![Candidate {
        prog: TestProg::new(CAND_ID, 1),
        minimized: true,
        smashed: false,
    }]);

    drive(
        &fuzzer,
        &|req| {
            if req.need_hints {
                assert_eq!(req.stat(), STAT_SEED);
                assert!(!req.need_signal && !req.need_cover);
                let mut res = signal_info(&req.prog, 0, &[]);
                let comps = &mut res.info.as_mut().unwrap().calls[0].comps;
                comps.insert(1, vec![10, 20, 30]);
                comps.insert(2, vec![40]);
                comps.insert(3, vec![50, 60, 70]);
                return res;
            }
            if req.stat() == STAT_HINT {
                assert!(req.need_signal);
                assert!(!req.need_cover && !req.need_hints);
            }
            if req.prog.id == CAND_ID {
                signal_info(&req.prog, 0, &[21, 22])
            } else {
                empty_info(&req.prog)
            }
        },
        MAX_ITERS,
    );

    let stats = fuzzer.grab_stats();
    // Seven argument/operand matches, one hints request per match.
    assert_eq!(stats.get(STAT_HINT).copied(), Some(7));
    assert_eq!(stats.get(STAT_SEED).copied(), Some(1));
    assert_eq!(
        stats.get("analysis : smash > #hints jobs started").copied(),
        Some(1)
    );

    fuzzer.stop();
}

#[test]
fn ablated_smash_mode_still_saves_to_corpus() {
    let corpus = TestCorpus::new();
    let mut config = base_config(corpus.clone());
    config.ablation.disable_mode_smash = true;
    let fuzzer = Fuzzer::new(config, TestTarget::new(), 5);

    fuzzer.add_candidates(vec![Candidate {
        prog: TestProg::new(CAND_ID, 1),
        minimized: true,
        smashed: false,
    }]);

    let seen: parking_lot::Mutex<HashMap<String, u64>> = parking_lot::Mutex::new(HashMap::new());
    drive(
        &fuzzer,
        &|req| {
            *seen.lock().entry(req.stat().to_string()).or_default() += 1;
            if req.prog.id == CAND_ID {
                signal_info(&req.prog, 0, &[33])
            } else {
                empty_info(&req.prog)
            }
        },
        MAX_ITERS,
    );

    assert_eq!(corpus.saves().len(), 1);
    assert!(
        !seen.lock().contains_key(STAT_SMASH),
        "no smash-originated request may reach the queue when the mode is ablated"
    );

    fuzzer.stop();
}

#[test]
fn candidate_gauge_tracks_the_queue() {
    let corpus = TestCorpus::new();
    let config = base_config(corpus);
    let fuzzer = Fuzzer::new(config, TestTarget::new(), 6);

    fuzzer.add_candidates(vec![
        Candidate { prog: TestProg::new(CAND_ID, 1), minimized: true, smashed: true },
        Candidate { prog: TestProg::new(CAND_ID + 1, 1), minimized: true, smashed: true },
    ]);
    assert_eq!(fuzzer.stats().candidates, 2);

    let first = fuzzer.next_input();
    assert_eq!(first.stat(), STAT_CANDIDATE);
    assert_eq!(fuzzer.stats().candidates, 1);

    let second = fuzzer.next_input();
    assert_eq!(second.stat(), STAT_CANDIDATE);
    assert_eq!(fuzzer.stats().candidates, 0);

    fuzzer.stop();
}
