//! The execution contexts the server drives
//!
//! A [`Session`] is anything whose registers and memory the debugger can
//! inspect. A [`LiveSession`] can additionally be resumed freely, and backs
//! both diversions and emergency debugging. A [`Timeline`] wraps the replay
//! of a recording: it can only move along the recorded execution, but in both
//! directions.

use std::path::PathBuf;

use eyre::Result;
use transport::types::{GdbRegister, RegisterValue, Watch};

use crate::types::{EventTime, Mark, ReplayResult, RunCommand, TaskInfo, TaskUid};

pub trait Session {
    /// Tasks alive at the current position
    fn tasks(&self) -> Vec<TaskInfo>;

    fn task(&self, tuid: TaskUid) -> Option<TaskInfo> {
        self.tasks().into_iter().find(|t| t.tuid == tuid)
    }

    fn find_task(&self, tid: i32) -> Option<TaskInfo> {
        self.tasks().into_iter().find(|t| t.tid == tid)
    }

    /// The task that will run next, if any task is alive
    fn current_task(&self) -> Option<TaskInfo>;

    fn current_event(&self) -> EventTime;

    fn registers(&self, task: TaskUid) -> Result<Vec<RegisterValue>>;

    fn register(&self, task: TaskUid, register: GdbRegister) -> Result<RegisterValue> {
        self.registers(task)?
            .into_iter()
            .find(|value| value.register == register)
            .ok_or_else(|| eyre::eyre!("no register {}", register.0))
    }

    fn write_register(&mut self, task: TaskUid, value: &RegisterValue) -> Result<()>;

    /// Read memory with breakpoint instructions hidden
    fn read_memory(&self, task: TaskUid, addr: u64, len: usize) -> Result<Vec<u8>>;

    fn write_memory(&mut self, task: TaskUid, addr: u64, data: &[u8]) -> Result<()>;

    fn auxv(&self, task: TaskUid) -> Result<Vec<u8>>;

    /// Path of the executable the task is running
    fn exe_image(&self, _task: TaskUid) -> Option<PathBuf> {
        None
    }

    fn add_breakpoint(&mut self, task: TaskUid, watch: &Watch) -> Result<()>;

    fn remove_breakpoint(&mut self, task: TaskUid, watch: &Watch) -> Result<()>;
}

/// A session that executes for real
pub trait LiveSession: Session {
    fn as_session(&self) -> &dyn Session;

    fn as_session_mut(&mut self) -> &mut dyn Session;

    /// Resume `task` until it stops or exits
    fn resume(&mut self, task: TaskUid, command: RunCommand) -> Result<ReplayResult>;
}

/// Navigation over a replayed recording
pub trait Timeline {
    /// The replay session at the current position
    fn session(&self) -> &dyn Session;

    fn session_mut(&mut self) -> &mut dyn Session;

    fn current_mark(&self) -> Mark;

    fn seek(&mut self, mark: &Mark) -> Result<()>;

    /// Move to a position just before event `event` is replayed
    fn seek_to_before_event(&mut self, event: EventTime) -> Result<()>;

    /// Replay forward one step
    ///
    /// A single call stops at the next event boundary even when nothing
    /// interesting happened; callers loop until [`BreakStatus::any_break`].
    ///
    /// [`BreakStatus::any_break`]: crate::types::BreakStatus::any_break
    fn run_forward(&mut self, command: RunCommand) -> Result<ReplayResult>;

    /// Execute backward until a breakpoint, a step of `task`, or the start
    fn run_backward(&mut self, command: RunCommand, task: TaskUid) -> Result<ReplayResult>;

    /// A cached mark for the state one singlestep of `task` before `from`
    fn lazy_reverse_singlestep(&mut self, from: &Mark, task: TaskUid) -> Option<Mark>;

    /// Whether the replay is currently positioned inside the recording
    fn is_running(&self) -> bool;

    /// Fork a disposable live session from the current position
    ///
    /// The fork carries this timeline's breakpoints and watchpoints.
    fn fork_diversion(&mut self) -> Result<Box<dyn LiveSession>>;

    /// Take a reference on the current mark so it stays seekable
    fn add_explicit_checkpoint(&mut self) -> Mark;

    /// Drop a reference taken by [`Timeline::add_explicit_checkpoint`]
    fn remove_explicit_checkpoint(&mut self, mark: &Mark);

    fn can_add_checkpoint(&self) -> bool;

    /// Returns `false` if the breakpoint could not be set
    fn add_breakpoint(&mut self, task: TaskUid, watch: &Watch) -> bool;

    fn remove_breakpoint(&mut self, task: TaskUid, watch: &Watch);

    fn remove_breakpoints_and_watchpoints(&mut self);
}
