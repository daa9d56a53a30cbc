//! Values shared between decoded requests and encoded replies

use std::fmt;

/// Signal numbers that appear in stop replies
pub mod signals {
    pub const SIGINT: i32 = 2;
    pub const SIGTRAP: i32 = 5;
    pub const SIGKILL: i32 = 9;
}

/// A thread as named on the wire (`p<pid>.<tid>`)
///
/// gdb uses `-1` to mean "all" and `0` to mean "any" for either component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub pid: i64,
    pub tid: i64,
}

impl ThreadId {
    pub const ANY: ThreadId = ThreadId { pid: 0, tid: 0 };
    pub const ALL: ThreadId = ThreadId { pid: -1, tid: -1 };

    pub fn new(pid: i64, tid: i64) -> Self {
        Self { pid, tid }
    }

    /// Whether this id names one concrete thread rather than a wildcard
    pub fn is_specific(&self) -> bool {
        self.tid > 0
    }

    /// Whether an action naming this id applies to `tid`
    pub fn matches(&self, tid: i64) -> bool {
        !self.is_specific() || self.tid == tid
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}.{}", format_id(self.pid), format_id(self.tid))
    }
}

fn format_id(id: i64) -> String {
    if id < 0 {
        "-1".to_string()
    } else {
        format!("{id:x}")
    }
}

/// gdb register number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GdbRegister(pub u32);

/// The contents of one register
///
/// Registers the target cannot provide are sent as `xx` bytes of the
/// register's size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    pub register: GdbRegister,
    pub value: Vec<u8>,
    pub defined: bool,
}

impl RegisterValue {
    pub fn new(register: GdbRegister, value: Vec<u8>) -> Self {
        Self {
            register,
            value,
            defined: true,
        }
    }

    pub fn undefined(register: GdbRegister, size: usize) -> Self {
        Self {
            register,
            value: vec![0; size],
            defined: false,
        }
    }

    /// Interpret the value as a little-endian integer, if it fits in 8 bytes
    pub fn as_u64(&self) -> Option<u64> {
        if !self.defined || self.value.len() > 8 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes[..self.value.len()].copy_from_slice(&self.value);
        Some(u64::from_le_bytes(bytes))
    }
}

/// Breakpoint and watchpoint kinds, numbered as in `Z`/`z` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchKind {
    Software,
    Hardware,
    Write,
    Read,
    Access,
}

impl WatchKind {
    pub(crate) fn from_wire(kind: u8) -> Option<Self> {
        Some(match kind {
            0 => WatchKind::Software,
            1 => WatchKind::Hardware,
            2 => WatchKind::Write,
            3 => WatchKind::Read,
            4 => WatchKind::Access,
            _ => return None,
        })
    }

    pub(crate) fn stop_reason_name(&self) -> &'static str {
        match self {
            WatchKind::Read => "rwatch",
            WatchKind::Access => "awatch",
            _ => "watch",
        }
    }
}

/// A breakpoint or watchpoint request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watch {
    pub kind: WatchKind,
    pub addr: u64,
    pub len: usize,
}

impl Watch {
    /// Whether `[addr, addr + len)` overlaps this watch
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let end = self.addr.saturating_add(self.len.max(1) as u64);
        let other_end = addr.saturating_add(len.max(1) as u64);
        self.addr < other_end && addr < end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    Continue,
    Step,
}

/// One `vCont` action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeAction {
    pub kind: ResumeKind,
    pub target: ThreadId,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub direction: RunDirection,
    pub actions: Vec<ResumeAction>,
}

impl ResumeRequest {
    pub fn forward(kind: ResumeKind) -> Self {
        Self::single(RunDirection::Forward, kind)
    }

    pub fn backward(kind: ResumeKind) -> Self {
        Self::single(RunDirection::Backward, kind)
    }

    fn single(direction: RunDirection, kind: ResumeKind) -> Self {
        Self {
            direction,
            actions: vec![ResumeAction {
                kind,
                target: ThreadId::ALL,
                signal: None,
            }],
        }
    }

    /// The action that applies to thread `tid`, if any
    pub fn action_for(&self, tid: i64) -> Option<&ResumeAction> {
        self.actions
            .iter()
            .find(|action| action.target.is_specific() && action.target.tid == tid)
            .or_else(|| self.actions.iter().find(|action| !action.target.is_specific()))
    }
}

/// Where to restart a replay session (`vRun` argument)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// The restart checkpoint of the last run
    Previous,
    Checkpoint(u32),
    Event(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    Detach,
    Kill,
    ConnectionLost,
}

/// Reasons reported in `T` stop replies beyond the signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SoftwareBreakpoint,
    Watch { kind: WatchKind, addr: u64 },
    ReplayLogBegin,
}
