use eyre::{Result, WrapErr};

use crate::session::{LiveSession, Session, Timeline};
use crate::types::{ReplayResult, RunCommand, TaskUid};

/// A disposable session forked from the timeline
///
/// Writes the debugger makes while stopped land here instead of in the
/// replay. An unpinned diversion lives until the next resume. gdb reads the
/// siginfo of the stopped thread before it calls a function in the
/// debuggee; that read pins the diversion so the call can run inside it,
/// and writing the siginfo back afterwards unpins it.
pub(crate) struct Diversion {
    session: Box<dyn LiveSession>,
    refcount: u32,
}

impl Diversion {
    pub(crate) fn begin(timeline: &mut dyn Timeline) -> Result<Self> {
        let session = timeline
            .fork_diversion()
            .wrap_err("forking diversion from timeline")?;
        tracing::debug!(event = session.current_event(), "diversion started");
        Ok(Self {
            session,
            refcount: 0,
        })
    }

    pub(crate) fn pin(&mut self) {
        self.refcount += 1;
        tracing::trace!(refcount = self.refcount, "diversion pinned");
    }

    pub(crate) fn unpin(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
        tracing::trace!(refcount = self.refcount, "diversion unpinned");
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.refcount > 0
    }

    pub(crate) fn session(&self) -> &dyn Session {
        self.session.as_session()
    }

    pub(crate) fn session_mut(&mut self) -> &mut dyn Session {
        self.session.as_session_mut()
    }

    pub(crate) fn resume(&mut self, task: TaskUid, command: RunCommand) -> Result<ReplayResult> {
        self.session
            .resume(task, command)
            .wrap_err("resuming inside diversion")
    }

    pub(crate) fn end(self) {
        tracing::debug!(
            pinned = self.is_pinned(),
            "diversion ended, discarding its state"
        );
    }
}
