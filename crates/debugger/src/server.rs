use std::path::PathBuf;

use eyre::{Context, Result};
use launcher::DebuggerParams;
use transport::{
    DebuggerConnection, Features, GdbListener, Reply, Request, StopNotification,
    types::{
        DetachReason, RestartKind, ResumeKind, ResumeRequest, RunDirection, StopReason, ThreadId,
        signals,
    },
};

use crate::{
    checkpoints::{Checkpoint, CheckpointRegistry},
    diversion::Diversion,
    interrupt::{InterruptFlag, InterruptHandle},
    session::{LiveSession, Session, Timeline},
    state::{ReportState, ServerState},
    types::{
        ConnectionFlags, Mark, ReplayResult, ReplayStatus, RunCommand, Target, TaskInfo, TaskUid,
        ThreadGroupUid,
    },
};

/// The execution the server was started on
pub(crate) enum Backend<'a> {
    Replay(Box<dyn Timeline + 'a>),
    /// A live session with no recording behind it
    Emergency(&'a mut dyn LiveSession),
}

/// Whether the main loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Serves one gdb connection over a replay timeline
///
/// The server owns the timeline, the checkpoint registry and at most one
/// diversion. It is single threaded: the only state shared with other
/// threads is the [`InterruptFlag`].
pub struct GdbServer<'a> {
    pub(crate) backend: Backend<'a>,
    pub(crate) diversion: Option<Diversion>,
    pub(crate) checkpoints: CheckpointRegistry,
    target: Target,
    interrupt: InterruptFlag,
    /// The thread group being debugged, fixed once attached
    pub(crate) debuggee_tguid: Option<ThreadGroupUid>,
    pub(crate) last_continue_tuid: Option<TaskUid>,
    pub(crate) last_query_tuid: Option<TaskUid>,
    pub(crate) last_stop: Option<StopNotification>,
    pub(crate) report: ReportState,
    /// Stopped at the exit of the debuggee's last thread
    in_debuggee_end_state: bool,
    pub(crate) exit_code: i32,
    /// A request read ahead by the lazy reverse-step loop
    pub(crate) pending_request: Option<Request>,
    pub(crate) state: ServerState,
}

impl<'a> GdbServer<'a> {
    pub fn new(timeline: impl Timeline + 'a, target: Target) -> Self {
        Self::with_backend(Backend::Replay(Box::new(timeline)), target)
    }

    pub(crate) fn with_backend(backend: Backend<'a>, target: Target) -> Self {
        Self {
            backend,
            diversion: None,
            checkpoints: CheckpointRegistry::new(),
            target,
            interrupt: InterruptFlag::new(),
            debuggee_tguid: None,
            last_continue_tuid: None,
            last_query_tuid: None,
            last_stop: None,
            report: ReportState::Normal,
            in_debuggee_end_state: false,
            exit_code: 0,
            pending_request: None,
            state: ServerState::Idle,
        }
    }

    /// Use an externally owned interrupt flag
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// A handle that stops the run to the attach point early
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.handle()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn report_state(&self) -> ReportState {
        self.report
    }

    pub fn checkpoints(&self) -> &CheckpointRegistry {
        &self.checkpoints
    }

    /// Position of the replay, `None` when debugging a live session
    pub fn current_mark(&self) -> Option<Mark> {
        match &self.backend {
            Backend::Replay(timeline) => Some(timeline.current_mark()),
            Backend::Emergency(_) => None,
        }
    }

    pub fn has_diversion(&self) -> bool {
        self.diversion.is_some()
    }

    /// Replay to the target, then accept one debugger over TCP and serve it
    ///
    /// Connection parameters go to `flags.debugger_params_write` when set so
    /// a launcher can start gdb; otherwise a gdb command line is printed.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn serve_replay(&mut self, mut flags: ConnectionFlags) -> Result<()> {
        self.replay_to_target()?;
        self.activate_debugger()?;

        let listener = GdbListener::bind(&flags.dbg_host, flags.dbg_port)
            .wrap_err("opening debugger listener")?;
        let port = listener.port()?;
        let task = self
            .current_session()
            .current_task()
            .ok_or_else(|| eyre::eyre!("no task at the attach point"))?;
        let exe = self.current_session().exe_image(task.tuid);
        publish_connection(&mut flags, port, exe, task.tgid)?;

        let stream = listener.accept()?;
        let mut connection = transport::connect(
            stream,
            Features {
                reverse_execution: true,
            },
        )?;
        self.serve_connection(&mut connection)
    }

    /// Replay to the target and serve an already established connection
    #[tracing::instrument(skip(self, connection), level = "debug")]
    pub fn serve_replay_with_connection(
        &mut self,
        connection: &mut dyn DebuggerConnection,
    ) -> Result<()> {
        self.replay_to_target()?;
        self.activate_debugger()?;
        self.serve_connection(connection)
    }

    pub(crate) fn serve_connection(&mut self, connection: &mut dyn DebuggerConnection) -> Result<()> {
        tracing::info!(debuggee = ?self.debuggee_tguid, "debugger attached");
        while self.debug_one_step(connection)? == Flow::Continue {}
        self.end_diversion();
        self.state.transition(ServerState::Detached);
        tracing::info!("debugger detached");
        Ok(())
    }

    pub(crate) fn at_target(&self, target: &Target) -> bool {
        let Backend::Replay(timeline) = &self.backend else {
            return true;
        };
        let Some(task) = timeline.session().current_task() else {
            return false;
        };
        if !timeline.can_add_checkpoint() {
            return false;
        }
        if self.interrupt.is_set() {
            tracing::info!("interrupted, attaching early");
            return true;
        }
        timeline.session().current_event() >= target.event
            && (target.pid == 0 || task.tgid == target.pid)
            && (!target.require_exec || task.execed)
    }

    /// Replay forward one step at a time until `target` is reached
    fn run_to(&mut self, target: &Target) -> Result<()> {
        while !self.at_target(target) {
            let Backend::Replay(timeline) = &mut self.backend else {
                return Ok(());
            };
            if !timeline.is_running() {
                eyre::bail!("recording has no execution left before debugger target {target:?}");
            }
            let result = timeline
                .run_forward(RunCommand::Continue)
                .wrap_err("replaying to debugger target")?;
            if let ReplayStatus::Exited { .. } = result.status {
                eyre::bail!("recording ended before reaching debugger target {target:?}");
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub(crate) fn replay_to_target(&mut self) -> Result<()> {
        let target = self.target;
        self.run_to(&target)?;
        tracing::debug!(
            event = self.current_session().current_event(),
            "reached debugger target"
        );
        Ok(())
    }

    /// Fix the debuggee to the current task and take the restart checkpoint
    pub(crate) fn activate_debugger(&mut self) -> Result<()> {
        let task = self
            .current_session()
            .current_task()
            .ok_or_else(|| eyre::eyre!("no task to attach the debugger to"))?;
        self.activate_on(task);
        Ok(())
    }

    pub(crate) fn activate_on(&mut self, task: TaskInfo) {
        self.debuggee_tguid = Some(task.tguid);
        self.last_continue_tuid = Some(task.tuid);
        self.last_query_tuid = Some(task.tuid);
        self.last_stop = Some(StopNotification::Stopped {
            thread: task.thread_id(),
            signal: signals::SIGTRAP,
            reason: None,
        });

        if let Backend::Replay(timeline) = &mut self.backend {
            let mark = timeline.add_explicit_checkpoint();
            let restart = Checkpoint {
                mark,
                last_continue_tuid: task.tuid,
            };
            if let Some(old) = self.checkpoints.replace_restart(restart) {
                timeline.remove_explicit_checkpoint(&old.mark);
            }
            tracing::debug!(?mark, tid = task.tid, "debugger activated");
        }
    }

    /// The session requests currently apply to
    pub(crate) fn current_session(&self) -> &dyn Session {
        if let Some(diversion) = &self.diversion {
            return diversion.session();
        }
        match &self.backend {
            Backend::Replay(timeline) => timeline.session(),
            Backend::Emergency(session) => session.as_session(),
        }
    }

    pub(crate) fn end_diversion(&mut self) {
        if let Some(diversion) = self.diversion.take() {
            diversion.end();
        }
    }

    /// Read and dispatch requests until one needs the main loop
    fn process_debugger_requests(
        &mut self,
        connection: &mut dyn DebuggerConnection,
    ) -> Result<Request> {
        loop {
            let request = match self.pending_request.take() {
                Some(request) => request,
                None => connection.receive_request()?,
            };
            self.state.transition(ServerState::Dispatching);

            match request {
                Request::Resume(_)
                | Request::Restart(_)
                | Request::Detach(_)
                | Request::Interrupt => return Ok(request),
                request => {
                    if let Some(command) = crate::magic::decode(&request) {
                        self.handle_magic(connection, command)?;
                    } else {
                        self.dispatch_debugger_request(connection, request)?;
                    }
                }
            }
        }
    }

    pub(crate) fn debug_one_step(&mut self, connection: &mut dyn DebuggerConnection) -> Result<Flow> {
        match self.process_debugger_requests(connection)? {
            Request::Detach(reason) => {
                tracing::debug!(?reason, "detach requested");
                if reason != DetachReason::ConnectionLost {
                    connection.send_reply(Reply::Ok)?;
                }
                self.end_diversion();
                if let Backend::Replay(timeline) = &mut self.backend {
                    timeline.remove_breakpoints_and_watchpoints();
                }
                Ok(Flow::Stop)
            }
            Request::Restart(kind) => {
                self.restart_session(connection, kind)?;
                Ok(Flow::Continue)
            }
            Request::Interrupt => {
                let thread = self.stop_thread(self.last_continue_tuid);
                self.notify(
                    connection,
                    StopNotification::Stopped {
                        thread,
                        signal: signals::SIGINT,
                        reason: None,
                    },
                )?;
                Ok(Flow::Continue)
            }
            Request::Resume(resume) => {
                self.resume(connection, resume)?;
                Ok(Flow::Continue)
            }
            other => {
                tracing::warn!(request = ?other, "unexpected request in main loop");
                connection.send_reply(Reply::error())?;
                Ok(Flow::Continue)
            }
        }
    }

    pub(crate) fn notify(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        stop: StopNotification,
    ) -> Result<()> {
        self.last_stop = Some(stop.clone());
        connection.notify_stop(stop)?;
        self.state.transition(ServerState::Stopped);
        Ok(())
    }

    fn stop_thread(&self, task: Option<TaskUid>) -> ThreadId {
        let tgid = self.debuggee_tguid.map_or(0, |tguid| tguid.tgid);
        task.map_or(ThreadId::ANY, |tuid| {
            ThreadId::new(i64::from(tgid), i64::from(tuid.tid))
        })
    }

    fn run_command(resume: &ResumeRequest, task: Option<&TaskInfo>) -> RunCommand {
        let action = match task {
            Some(task) => resume.action_for(i64::from(task.tid)),
            None => resume.actions.first(),
        };
        match action.map(|action| action.kind) {
            Some(ResumeKind::Step) => RunCommand::Singlestep,
            _ => RunCommand::Continue,
        }
    }

    fn resume(&mut self, connection: &mut dyn DebuggerConnection, resume: ResumeRequest) -> Result<()> {
        match resume.direction {
            RunDirection::Backward => self.resume_backward(connection, resume),
            RunDirection::Forward => self.resume_forward(connection, resume),
        }
    }

    fn resume_forward(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        resume: ResumeRequest,
    ) -> Result<()> {
        if self.report == ReportState::ThreadsDead || self.in_debuggee_end_state {
            return self.handle_exited_state(connection, self.exit_code);
        }

        // Only an inferior call keeps the diversion alive across a resume
        if self.diversion.as_ref().is_some_and(|d| !d.is_pinned()) {
            self.end_diversion();
        }

        let task = self
            .last_continue_tuid
            .and_then(|tuid| self.current_session().task(tuid))
            .or_else(|| self.current_session().current_task());
        let command = Self::run_command(&resume, task.as_ref());
        tracing::debug!(?command, tid = task.as_ref().map(|t| t.tid), "resuming forward");
        self.state.transition(ServerState::Resuming);

        loop {
            let result = if let Some(diversion) = &mut self.diversion {
                let task = task
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("no task to resume in diversion"))?;
                diversion.resume(task.tuid, command)?
            } else {
                match &mut self.backend {
                    Backend::Replay(timeline) => timeline.run_forward(command)?,
                    Backend::Emergency(session) => {
                        let task = task
                            .as_ref()
                            .ok_or_else(|| eyre::eyre!("no task to resume"))?;
                        session.resume(task.tuid, command)?
                    }
                }
            };

            if let ReplayStatus::Exited { code } = result.status {
                if self.diversion.is_some() {
                    tracing::debug!(code, "diversion exited");
                    self.end_diversion();
                    return self.notify(connection, StopNotification::Exited { code });
                }
                return self.handle_exited_state(connection, code);
            }
            if self.maybe_notify_stop(connection, &result, RunDirection::Forward)? {
                return Ok(());
            }
        }
    }

    fn resume_backward(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        resume: ResumeRequest,
    ) -> Result<()> {
        if matches!(self.backend, Backend::Emergency(_)) {
            tracing::warn!("reverse execution requested without a recording");
            connection.send_reply(Reply::error())?;
            return Ok(());
        }

        self.end_diversion();
        self.report = ReportState::Normal;
        self.in_debuggee_end_state = false;

        let Some(resume) = self.try_lazy_reverse_singlesteps(connection, resume)? else {
            return Ok(());
        };

        let Some(task) = self
            .last_continue_tuid
            .and_then(|tuid| self.current_session().task(tuid))
            .or_else(|| self.current_session().current_task())
        else {
            connection.send_reply(Reply::error())?;
            return Ok(());
        };
        let command = Self::run_command(&resume, Some(&task));
        tracing::debug!(?command, tid = task.tid, "resuming backward");
        self.state.transition(ServerState::Resuming);

        loop {
            let Backend::Replay(timeline) = &mut self.backend else {
                return Ok(());
            };
            let result = timeline
                .run_backward(command, task.tuid)
                .wrap_err("executing backward")?;
            if self.maybe_notify_stop(connection, &result, RunDirection::Backward)? {
                return Ok(());
            }
        }
    }

    /// Report the stop described by `result` if the debugger cares about it
    pub(crate) fn maybe_notify_stop(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        result: &ReplayResult,
        direction: RunDirection,
    ) -> Result<bool> {
        let status = &result.break_status;
        let mut signal = None;
        let mut reason = None;

        if let Some(watch) = status.watch_hit {
            signal = Some(signals::SIGTRAP);
            reason = Some(StopReason::Watch {
                kind: watch.kind,
                addr: watch.addr,
            });
        }
        if status.breakpoint_hit {
            signal = Some(signals::SIGTRAP);
            reason = reason.or(Some(StopReason::SoftwareBreakpoint));
        }
        if status.singlestep_complete {
            signal = Some(signals::SIGTRAP);
        }
        if let Some(sig) = status.signal {
            signal = Some(sig);
        }
        if status.task_exit {
            if direction == RunDirection::Forward {
                signal = Some(signals::SIGKILL);
                self.in_debuggee_end_state = true;
            } else {
                signal = Some(0);
            }
        }
        if status.at_recording_start {
            signal = Some(signals::SIGTRAP);
            reason = Some(StopReason::ReplayLogBegin);
        }

        let Some(signal) = signal else {
            return Ok(false);
        };

        // Nothing runs before the recording start, so that stop always
        // belongs to the debugger's thread
        let task = if status.at_recording_start {
            self.last_continue_tuid.or(status.task)
        } else {
            status.task.or(self.last_continue_tuid)
        };
        if !status.at_recording_start {
            if let Some(info) = task.and_then(|tuid| self.current_session().task(tuid)) {
                if Some(info.tguid) != self.debuggee_tguid {
                    tracing::trace!(tid = info.tid, "ignoring stop outside the debuggee");
                    return Ok(false);
                }
            }
        }
        if let Some(tuid) = task {
            self.last_continue_tuid = Some(tuid);
            self.last_query_tuid = Some(tuid);
        }

        let thread = self.stop_thread(task);
        self.notify(
            connection,
            StopNotification::Stopped {
                thread,
                signal,
                reason,
            },
        )?;
        Ok(true)
    }

    /// The recording has no more execution in it
    fn handle_exited_state(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        code: i32,
    ) -> Result<()> {
        tracing::debug!(code, "debuggee exited");
        self.exit_code = code;
        self.report = ReportState::ThreadsDead;
        self.notify(connection, StopNotification::Exited { code })
    }

    #[tracing::instrument(skip(self, connection), level = "debug")]
    fn restart_session(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        kind: RestartKind,
    ) -> Result<()> {
        if matches!(self.backend, Backend::Emergency(_)) {
            tracing::warn!("restart requested without a recording");
            return connection.send_reply(Reply::error());
        }
        self.end_diversion();

        match kind {
            RestartKind::Checkpoint(id) => {
                let Some(checkpoint) = self.checkpoints.get(id).copied() else {
                    tracing::warn!(id, "no such checkpoint");
                    return connection.send_reply(Reply::error());
                };
                self.restart_at(checkpoint)?;
            }
            RestartKind::Previous => {
                let Some(checkpoint) = self.checkpoints.restart_checkpoint().copied() else {
                    return connection.send_reply(Reply::error());
                };
                self.restart_at(checkpoint)?;
            }
            RestartKind::Event(event) => {
                let Backend::Replay(timeline) = &mut self.backend else {
                    return connection.send_reply(Reply::error());
                };
                let before = timeline.current_mark();
                if let Err(e) = timeline.seek_to_before_event(event) {
                    tracing::warn!(error = %e, event, "cannot seek to restart event");
                    self.return_to(&before)?;
                    return connection.send_reply(Reply::error());
                }
                self.interrupt.clear();
                let target = Target {
                    pid: self.debuggee_tguid.map_or(0, |tguid| tguid.tgid),
                    require_exec: false,
                    event,
                };
                if let Err(e) = self.run_to(&target) {
                    tracing::warn!(error = %e, event, "could not restart at event");
                    self.return_to(&before)?;
                    return connection.send_reply(Reply::error());
                }
                self.activate_debugger()?;
            }
        }

        self.report = ReportState::Normal;
        self.in_debuggee_end_state = false;
        let thread = self.stop_thread(self.last_continue_tuid);
        self.notify(
            connection,
            StopNotification::Stopped {
                thread,
                signal: signals::SIGTRAP,
                reason: None,
            },
        )
    }

    /// Undo the movement of a restart that could not complete
    fn return_to(&mut self, mark: &Mark) -> Result<()> {
        let Backend::Replay(timeline) = &mut self.backend else {
            return Ok(());
        };
        timeline
            .seek(mark)
            .wrap_err("returning to the position before a failed restart")
    }

    fn restart_at(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let Backend::Replay(timeline) = &mut self.backend else {
            return Ok(());
        };
        timeline
            .seek(&checkpoint.mark)
            .wrap_err("seeking to restart checkpoint")?;
        let mark = timeline.add_explicit_checkpoint();
        let restart = Checkpoint {
            mark,
            last_continue_tuid: checkpoint.last_continue_tuid,
        };
        if let Some(old) = self.checkpoints.replace_restart(restart) {
            timeline.remove_explicit_checkpoint(&old.mark);
        }
        self.last_continue_tuid = Some(checkpoint.last_continue_tuid);
        self.last_query_tuid = Some(checkpoint.last_continue_tuid);
        tracing::debug!(?mark, "restarted");
        Ok(())
    }
}

impl Drop for GdbServer<'_> {
    fn drop(&mut self) {
        self.end_diversion();
        let checkpoints = self.checkpoints.drain();
        if let Backend::Replay(timeline) = &mut self.backend {
            for checkpoint in checkpoints {
                timeline.remove_explicit_checkpoint(&checkpoint.mark);
            }
        }
    }
}

/// Tell a launcher (or the user) how to connect gdb
pub(crate) fn publish_connection(
    flags: &mut ConnectionFlags,
    port: u16,
    exe_image: Option<PathBuf>,
    pid: i32,
) -> Result<()> {
    let params = DebuggerParams {
        exe_image: exe_image.unwrap_or_default(),
        host: flags.dbg_host.clone(),
        port,
        pid,
    };
    match flags.debugger_params_write.take() {
        Some(mut channel) => {
            launcher::write_params(&mut channel, &params)
                .wrap_err("writing debugger connection parameters")?;
        }
        None => {
            tracing::info!(?params, "waiting for debugger connection");
            eprintln!("Launch gdb with\n  {}", params.command_line(None));
        }
    }
    Ok(())
}
