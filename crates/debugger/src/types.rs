use serde::{Deserialize, Serialize};
use transport::types::{ThreadId, Watch};

/// Number of events replayed so far
pub type EventTime = u64;

/// User-visible checkpoint handle
pub type CheckpointId = u32;

/// Identity of a task that stays valid across seeks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskUid {
    pub tid: i32,
    pub serial: u32,
}

/// Identity of a thread group that stays valid across seeks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadGroupUid {
    pub tgid: i32,
    pub serial: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub tuid: TaskUid,
    pub tguid: ThreadGroupUid,
    pub tid: i32,
    pub tgid: i32,
    pub name: String,
    /// Whether the thread group has completed an exec
    pub execed: bool,
}

impl TaskInfo {
    pub fn thread_id(&self) -> ThreadId {
        ThreadId::new(i64::from(self.tgid), i64::from(self.tid))
    }
}

/// An opaque, totally ordered position in the timeline
///
/// Marks order first by event, then by progress within the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mark {
    event: EventTime,
    ticks: u64,
}

impl Mark {
    pub fn new(event: EventTime, ticks: u64) -> Self {
        Self { event, ticks }
    }

    pub fn event(&self) -> EventTime {
        self.event
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    Continue,
    Singlestep,
}

/// Why execution stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakStatus {
    /// The task that stopped
    pub task: Option<TaskUid>,
    pub breakpoint_hit: bool,
    pub singlestep_complete: bool,
    /// The watchpoint that triggered, if any
    pub watch_hit: Option<Watch>,
    /// A signal delivered to the task
    pub signal: Option<i32>,
    /// The last thread of the task's group exited
    pub task_exit: bool,
    /// Backward execution reached the start of the recording
    pub at_recording_start: bool,
}

impl BreakStatus {
    /// Whether the stop is interesting to the debugger
    pub fn any_break(&self) -> bool {
        self.breakpoint_hit
            || self.singlestep_complete
            || self.watch_hit.is_some()
            || self.signal.is_some()
            || self.task_exit
            || self.at_recording_start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Continue,
    Exited { code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    pub status: ReplayStatus,
    pub break_status: BreakStatus,
}

impl ReplayResult {
    pub fn stopped(break_status: BreakStatus) -> Self {
        Self {
            status: ReplayStatus::Continue,
            break_status,
        }
    }

    pub fn exited(code: i32) -> Self {
        Self {
            status: ReplayStatus::Exited { code },
            break_status: BreakStatus::default(),
        }
    }
}

/// Where in the recording the debugger first attaches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    /// Thread group to attach to, 0 for the first one reached
    pub pid: i32,
    /// Only attach once the thread group has exec'd
    pub require_exec: bool,
    /// Only attach once at least this many events have been replayed
    pub event: EventTime,
}

/// How the debugger connects
pub struct ConnectionFlags {
    /// Port to listen on, any free port when `None`
    pub dbg_port: Option<u16>,
    pub dbg_host: String,
    /// If set, connection parameters are written here for a launcher
    pub debugger_params_write: Option<Box<dyn std::io::Write + Send>>,
}

impl Default for ConnectionFlags {
    fn default() -> Self {
        Self {
            dbg_port: None,
            dbg_host: "127.0.0.1".to_string(),
            debugger_params_write: None,
        }
    }
}

impl std::fmt::Debug for ConnectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFlags")
            .field("dbg_port", &self.dbg_port)
            .field("dbg_host", &self.dbg_host)
            .field(
                "debugger_params_write",
                &self.debugger_params_write.is_some(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_order_by_event_then_ticks() {
        assert!(Mark::new(1, 100) < Mark::new(2, 0));
        assert!(Mark::new(2, 1) < Mark::new(2, 5));
        assert_eq!(Mark::new(3, 3), Mark::new(3, 3));
    }

    #[test]
    fn target_from_json() {
        let target: Target = serde_json::from_str(r#"{"pid": 42, "require_exec": true}"#).unwrap();
        assert_eq!(
            target,
            Target {
                pid: 42,
                require_exec: true,
                event: 0
            }
        );
    }
}
