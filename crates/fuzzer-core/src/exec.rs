//! Execution requests and results.
//!
//! A [`Request`] is the unit of work handed to an executor; an
//! [`ExecResult`] is what comes back. Requests are created by the
//! orchestrator or by jobs, owned by the queue while waiting, by the
//! executor while running, and dropped once `done` has delivered the
//! result.

use crate::target::CompMap;
use crossbeam::channel::Sender;
use once_cell::sync::OnceCell;
use std::ops::BitOr;

/// Classification bits of the program carried by a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgFlags(u8);

impl ProgFlags {
    pub const CANDIDATE: ProgFlags = ProgFlags(1 << 0);
    pub const MINIMIZED: ProgFlags = ProgFlags(1 << 1);
    pub const SMASHED: ProgFlags = ProgFlags(1 << 2);
    pub const IN_TRIAGE: ProgFlags = ProgFlags(1 << 3);

    pub fn contains(self, other: ProgFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProgFlags {
    type Output = ProgFlags;

    fn bitor(self, rhs: ProgFlags) -> ProgFlags {
        ProgFlags(self.0 | rhs.0)
    }
}

/// Per-call execution feedback filled in by the executor.
#[derive(Clone, Debug, Default)]
pub struct CallInfo {
    pub errno: i32,
    /// Raw signal elements emitted while the call ran.
    pub signal: Vec<u32>,
    /// Program counters covered by the call.
    pub cover: Vec<u32>,
    /// Comparison operands, only filled for hints requests.
    pub comps: CompMap,
    /// Whether the requested fault was actually injected.
    pub fault_injected: bool,
}

/// Whole-program execution feedback: one entry per call plus the extra
/// bucket for signal not attributable to any single call.
#[derive(Clone, Debug, Default)]
pub struct ProgInfo {
    pub calls: Vec<CallInfo>,
    pub extra: CallInfo,
}

/// Result of one execution. `info == None` means the executor failed;
/// `stop` means the fuzzer is shutting down and the receiving job must
/// unwind.
#[derive(Clone, Debug, Default)]
pub struct ExecResult {
    pub info: Option<ProgInfo>,
    pub stop: bool,
}

impl ExecResult {
    pub(crate) fn stopped() -> Self {
        ExecResult { info: None, stop: true }
    }
}

/// A unit of executor work.
pub struct Request<P> {
    pub prog: P,
    pub need_signal: bool,
    pub need_cover: bool,
    pub need_raw_cover: bool,
    /// Mutually exclusive with `need_signal`/`need_cover`.
    pub need_hints: bool,

    /// Origin tag, also the stats counter bumped when the result lands.
    pub(crate) stat: &'static str,
    /// The operating mode the request is ultimately attributed to.
    pub(crate) requester_stat: &'static str,
    pub(crate) flags: ProgFlags,
    /// Assigned when the request enters the queue; keys the running-execs
    /// map.
    pub(crate) id: u64,
    pub(crate) result: OnceCell<ExecResult>,
    /// One-shot channel towards the job blocked on this request.
    pub(crate) result_tx: Option<Sender<ExecResult>>,
}

impl<P> Request<P> {
    pub(crate) fn new(prog: P, stat: &'static str, requester_stat: &'static str) -> Self {
        Request {
            prog,
            need_signal: false,
            need_cover: false,
            need_raw_cover: false,
            need_hints: false,
            stat,
            requester_stat,
            flags: ProgFlags::default(),
            id: 0,
            result: OnceCell::new(),
            result_tx: None,
        }
    }

    /// Origin tag of the request ("gen", "fuzz", "candidate", ...).
    pub fn stat(&self) -> &'static str {
        self.stat
    }

    /// The stored result, once `done` has been called.
    pub fn result(&self) -> Option<&ExecResult> {
        self.result.get()
    }

    pub(crate) fn validate(&self) {
        if self.stat.is_empty() {
            panic!("request origin tag must be set");
        }
        if self.need_hints && (self.need_signal || self.need_cover) {
            panic!("need_hints is mutually exclusive with need_signal/need_cover");
        }
    }
}

/// An externally seeded program, queued at candidate priority.
#[derive(Clone, Debug)]
pub struct Candidate<P> {
    pub prog: P,
    pub minimized: bool,
    pub smashed: bool,
}
