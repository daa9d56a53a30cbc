use eyre::{Result, WrapErr};
use transport::{
    DebuggerConnection, Request,
    types::{ResumeKind, ResumeRequest, RunDirection},
};

use crate::{
    server::{Backend, GdbServer},
    state::ServerState,
    types::{BreakStatus, ReplayResult, TaskUid},
};

impl GdbServer<'_> {
    /// Satisfy reverse singlesteps from marks the timeline already has
    ///
    /// gdb implements `reverse-next` as long runs of reverse singlesteps,
    /// each followed by register reads. While the timeline can hand us the
    /// mark one step back we seek straight to it and keep answering register
    /// reads here. Returns the request to run for real when no cached mark
    /// exists, or `None` once another kind of request arrives (it is left
    /// pending for the main loop).
    pub(crate) fn try_lazy_reverse_singlesteps(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        mut resume: ResumeRequest,
    ) -> Result<Option<ResumeRequest>> {
        loop {
            let Some(task) = self.lazy_step_task(&resume) else {
                return Ok(Some(resume));
            };
            let Backend::Replay(timeline) = &mut self.backend else {
                return Ok(Some(resume));
            };
            let now = timeline.current_mark();
            let Some(previous) = timeline.lazy_reverse_singlestep(&now, task) else {
                return Ok(Some(resume));
            };
            tracing::debug!(?now, ?previous, "lazy reverse singlestep");
            timeline
                .seek(&previous)
                .wrap_err("seeking to previous singlestep")?;

            let result = ReplayResult::stopped(BreakStatus {
                task: Some(task),
                singlestep_complete: true,
                ..BreakStatus::default()
            });
            self.maybe_notify_stop(connection, &result, RunDirection::Backward)?;

            loop {
                let request = connection.receive_request()?;
                self.state.transition(ServerState::Dispatching);
                match request {
                    Request::GetRegs | Request::GetReg(_) => {
                        self.dispatch_debugger_request(connection, request)?;
                    }
                    Request::Resume(next) if next.direction == RunDirection::Backward => {
                        resume = next;
                        break;
                    }
                    other => {
                        self.pending_request = Some(other);
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// The task a reverse request singlesteps, if it qualifies
    fn lazy_step_task(&self, resume: &ResumeRequest) -> Option<TaskUid> {
        let [action] = resume.actions.as_slice() else {
            return None;
        };
        if action.kind != ResumeKind::Step || action.signal.is_some() {
            return None;
        }
        let current = self.current_session().current_task()?;
        if Some(current.tuid) != self.last_continue_tuid
            || !action.target.matches(i64::from(current.tid))
        {
            return None;
        }
        Some(current.tuid)
    }
}
