//! gdb server over a record/replay timeline
//!
//! [`GdbServer`] terminates a gdb remote connection and drives a
//! [`Timeline`]: replaying forward and backward, answering register and
//! memory queries, keeping checkpoints, and diverting debugger writes into a
//! disposable [`LiveSession`] so the recording itself is never changed.
mod checkpoints;
mod dispatch;
mod diversion;
mod emergency;
mod init_script;
mod interrupt;
pub mod magic;
mod reverse;
mod server;
pub mod session;
mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use checkpoints::{Checkpoint, CheckpointRegistry};
pub use emergency::{emergency_debug, emergency_debug_with_connection};
pub use init_script::gdb_init_script;
pub use interrupt::{InterruptFlag, InterruptHandle};
pub use server::GdbServer;
pub use session::{LiveSession, Session, Timeline};
pub use state::{ReportState, ServerState};
pub use types::{
    BreakStatus, CheckpointId, ConnectionFlags, EventTime, Mark, ReplayResult, ReplayStatus,
    RunCommand, Target, TaskInfo, TaskUid, ThreadGroupUid,
};
