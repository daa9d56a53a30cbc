use std::fmt::Write as _;

use eyre::Result;
use transport::{
    DebuggerConnection, Reply, Request, StopNotification,
    types::{RegisterValue, ThreadId, Watch},
};

use crate::{
    checkpoints::Checkpoint,
    diversion::Diversion,
    magic::MagicCommand,
    server::{Backend, GdbServer},
    session::Session,
    state::ReportState,
    types::{CheckpointId, Mark, TaskInfo, TaskUid},
};

/// Size of the siginfo object gdb reads before an inferior call
const SIGINFO_SIZE: usize = 128;

impl GdbServer<'_> {
    /// Answer a request that does not resume execution
    pub(crate) fn dispatch_debugger_request(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        request: Request,
    ) -> Result<()> {
        tracing::debug!(?request, report = ?self.report, "dispatching request");

        // Requests that make sense even with no live threads
        match request {
            Request::GetCurrentThread => {
                let thread = self
                    .last_continue_tuid
                    .and_then(|tuid| self.current_session().task(tuid))
                    .map_or(ThreadId::ANY, |task| task.thread_id());
                return connection.send_reply(Reply::CurrentThread(thread));
            }
            Request::GetOffsets => return connection.send_reply(Reply::Unsupported),
            Request::GetThreadList => {
                let threads = if self.report == ReportState::ThreadsDead {
                    Vec::new()
                } else {
                    self.debuggee_tasks()
                        .iter()
                        .map(TaskInfo::thread_id)
                        .collect()
                };
                return connection.send_reply(Reply::ThreadList(threads));
            }
            Request::GetStopReason => {
                let stop = match (&self.report, &self.last_stop) {
                    (ReportState::ThreadsDead, _) | (_, None) => StopNotification::Exited {
                        code: self.exit_code,
                    },
                    (ReportState::Normal, Some(stop)) => stop.clone(),
                };
                return connection.notify_stop(stop);
            }
            Request::Monitor(command) => return self.handle_monitor(connection, &command),
            _ => {}
        }

        if self.report == ReportState::ThreadsDead {
            tracing::debug!(?request, "no live threads to answer request");
            return connection.send_reply(Reply::error());
        }

        match request {
            Request::IsThreadAlive(thread) => {
                let alive = if thread.is_specific() {
                    self.debuggee_tasks()
                        .iter()
                        .any(|task| i64::from(task.tid) == thread.tid)
                } else {
                    !self.debuggee_tasks().is_empty()
                };
                let reply = if alive { Reply::Ok } else { Reply::error() };
                return connection.send_reply(reply);
            }
            Request::GetThreadExtraInfo(thread) => {
                let reply = match self.resolve_task(thread, true) {
                    Some(task) => Reply::ThreadExtraInfo(task.name),
                    None => Reply::error(),
                };
                return connection.send_reply(reply);
            }
            Request::SetContinueThread(thread) => {
                let reply = match self.resolve_task(thread, false) {
                    Some(task) => {
                        self.last_continue_tuid = Some(task.tuid);
                        Reply::Ok
                    }
                    None => Reply::error(),
                };
                return connection.send_reply(reply);
            }
            Request::SetQueryThread(thread) => {
                let reply = match self.resolve_task(thread, true) {
                    Some(task) => {
                        self.last_query_tuid = Some(task.tuid);
                        Reply::Ok
                    }
                    None => Reply::error(),
                };
                return connection.send_reply(reply);
            }
            _ => {}
        }

        let Some(task) = self.resolve_task(ThreadId::ANY, true) else {
            tracing::warn!(?request, "no task to apply request to");
            return connection.send_reply(Reply::error());
        };
        let reply = self.dispatch_task_request(task.tuid, request);
        connection.send_reply(reply)
    }

    fn dispatch_task_request(&mut self, task: TaskUid, request: Request) -> Reply {
        match request {
            Request::GetRegs => match self.current_session().registers(task) {
                Ok(values) => Reply::Registers(values),
                Err(e) => error_reply("reading registers", e),
            },
            Request::GetReg(register) => match self.current_session().register(task, register) {
                Ok(value) => Reply::Register(value),
                Err(e) => error_reply("reading register", e),
            },
            Request::GetMem { len: 0, .. } => Reply::Memory(Vec::new()),
            Request::GetMem { addr, len } => {
                match self.current_session().read_memory(task, addr, len) {
                    Ok(bytes) => Reply::Memory(bytes),
                    Err(e) => error_reply("reading memory", e),
                }
            }
            Request::GetAuxv { offset, len } => match self.current_session().auxv(task) {
                Ok(auxv) => Reply::xfer(&auxv, offset, len),
                Err(e) => error_reply("reading auxv", e),
            },
            Request::SetReg(value) => self.with_mutable_session(|session| {
                session.write_register(task, &value)
            }),
            Request::SetRegs(bytes) => {
                let current = match self.current_session().registers(task) {
                    Ok(values) => values,
                    Err(e) => return error_reply("reading registers", e),
                };
                let values = match split_registers(&current, &bytes) {
                    Some(values) => values,
                    None => {
                        tracing::warn!(len = bytes.len(), "register block has the wrong size");
                        return Reply::error();
                    }
                };
                self.with_mutable_session(|session| {
                    values
                        .iter()
                        .try_for_each(|value| session.write_register(task, value))
                })
            }
            // gdb tests for write support with empty data
            Request::SetMem { data, .. } if data.is_empty() => Reply::Ok,
            Request::SetMem { addr, data } => {
                self.with_mutable_session(|session| session.write_memory(task, addr, &data))
            }
            Request::ReadSiginfo { offset, len } => {
                if let Err(e) = self.ensure_mutable_session() {
                    return error_reply("starting diversion", e);
                }
                if let Some(diversion) = &mut self.diversion {
                    diversion.pin();
                }
                Reply::xfer(&[0; SIGINFO_SIZE], offset, len)
            }
            Request::WriteSiginfo { .. } => {
                if let Some(diversion) = &mut self.diversion {
                    diversion.unpin();
                }
                Reply::Ok
            }
            Request::SetBreakpoint(watch) => {
                if self.set_breakpoint(task, &watch) {
                    Reply::Ok
                } else {
                    Reply::error()
                }
            }
            Request::RemoveBreakpoint(watch) => {
                self.remove_breakpoint(task, &watch);
                Reply::Ok
            }
            other => {
                tracing::warn!(request = ?other, "request not handled by dispatch");
                Reply::Unsupported
            }
        }
    }

    /// Tasks of the debugged thread group in the current session
    fn debuggee_tasks(&self) -> Vec<TaskInfo> {
        self.current_session()
            .tasks()
            .into_iter()
            .filter(|task| Some(task.tguid) == self.debuggee_tguid)
            .collect()
    }

    /// Find the debuggee task a request names, falling back to the last valid one
    ///
    /// Threads of other processes in the recording never resolve.
    pub(crate) fn resolve_task(&self, thread: ThreadId, is_query: bool) -> Option<TaskInfo> {
        let tasks = self.debuggee_tasks();
        if thread.is_specific() {
            if let Some(task) = tasks.iter().find(|task| i64::from(task.tid) == thread.tid) {
                return Some(task.clone());
            }
            tracing::debug!(%thread, "thread no longer exists, using last known thread");
        }
        let last = if is_query {
            self.last_query_tuid
        } else {
            self.last_continue_tuid
        };
        last.and_then(|tuid| tasks.iter().find(|task| task.tuid == tuid))
            .or_else(|| tasks.first())
            .cloned()
    }

    /// The session writes go to, starting a diversion on the replay
    fn ensure_mutable_session(&mut self) -> Result<&mut dyn Session> {
        match &mut self.backend {
            Backend::Emergency(session) => Ok(session.as_session_mut()),
            Backend::Replay(timeline) => {
                let diversion = match self.diversion.take() {
                    Some(diversion) => diversion,
                    None => Diversion::begin(timeline.as_mut())?,
                };
                Ok(self.diversion.insert(diversion).session_mut())
            }
        }
    }

    fn with_mutable_session(
        &mut self,
        write: impl FnOnce(&mut dyn Session) -> Result<()>,
    ) -> Reply {
        let session = match self.ensure_mutable_session() {
            Ok(session) => session,
            Err(e) => return error_reply("starting diversion", e),
        };
        match write(session) {
            Ok(()) => Reply::Ok,
            Err(e) => error_reply("writing to session", e),
        }
    }

    fn set_breakpoint(&mut self, task: TaskUid, watch: &Watch) -> bool {
        match &mut self.backend {
            Backend::Replay(timeline) => {
                if !timeline.add_breakpoint(task, watch) {
                    return false;
                }
                if let Some(diversion) = &mut self.diversion {
                    if let Err(e) = diversion.session_mut().add_breakpoint(task, watch) {
                        tracing::warn!(error = %e, ?watch, "could not mirror breakpoint into diversion");
                    }
                }
                true
            }
            Backend::Emergency(session) => match session.add_breakpoint(task, watch) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, ?watch, "could not set breakpoint");
                    false
                }
            },
        }
    }

    fn remove_breakpoint(&mut self, task: TaskUid, watch: &Watch) {
        match &mut self.backend {
            Backend::Replay(timeline) => {
                timeline.remove_breakpoint(task, watch);
                if let Some(diversion) = &mut self.diversion {
                    if let Err(e) = diversion.session_mut().remove_breakpoint(task, watch) {
                        tracing::debug!(error = %e, ?watch, "breakpoint was not set in diversion");
                    }
                }
            }
            Backend::Emergency(session) => {
                if let Err(e) = session.remove_breakpoint(task, watch) {
                    tracing::debug!(error = %e, ?watch, "could not remove breakpoint");
                }
            }
        }
    }

    /// Save the current position under `requested`, or a fresh handle if 0
    pub(crate) fn create_checkpoint(
        &mut self,
        requested: CheckpointId,
    ) -> Option<(CheckpointId, Mark)> {
        if self.diversion.is_some() {
            tracing::warn!("cannot checkpoint inside a diversion");
            return None;
        }
        let Backend::Replay(timeline) = &mut self.backend else {
            return None;
        };
        if !timeline.can_add_checkpoint() {
            return None;
        }
        let last_continue_tuid = self.last_continue_tuid?;
        let id = if requested == 0 {
            self.checkpoints.next_id()
        } else {
            requested
        };
        let mark = timeline.add_explicit_checkpoint();
        let checkpoint = Checkpoint {
            mark,
            last_continue_tuid,
        };
        if let Some(old) = self.checkpoints.insert(id, checkpoint) {
            timeline.remove_explicit_checkpoint(&old.mark);
        }
        tracing::debug!(id, ?mark, "created checkpoint");
        Some((id, mark))
    }

    pub(crate) fn delete_checkpoint(&mut self, id: CheckpointId) -> bool {
        let Backend::Replay(timeline) = &mut self.backend else {
            return false;
        };
        match self.checkpoints.remove(id) {
            Some(checkpoint) => {
                timeline.remove_explicit_checkpoint(&checkpoint.mark);
                tracing::debug!(id, "deleted checkpoint");
                true
            }
            None => {
                tracing::debug!(id, "no checkpoint to delete");
                false
            }
        }
    }

    pub(crate) fn handle_magic(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        command: MagicCommand,
    ) -> Result<()> {
        tracing::debug!(?command, "magic command");
        let reply = match command {
            MagicCommand::CreateCheckpoint(id) => match self.create_checkpoint(id) {
                Some(_) => Reply::Ok,
                None => Reply::error(),
            },
            MagicCommand::DeleteCheckpoint(id) => {
                if self.delete_checkpoint(id) {
                    Reply::Ok
                } else {
                    Reply::error()
                }
            }
            MagicCommand::When => {
                let event = self.current_session().current_event();
                Reply::Memory(event.to_le_bytes().to_vec())
            }
        };
        connection.send_reply(reply)
    }

    fn handle_monitor(
        &mut self,
        connection: &mut dyn DebuggerConnection,
        command: &str,
    ) -> Result<()> {
        let words: Vec<&str> = command.split_whitespace().collect();
        let reply = match words.as_slice() {
            ["when"] => Reply::MonitorOutput(format!(
                "Current event: {}\n",
                self.current_session().current_event()
            )),
            ["when-tid"] => match self.current_session().current_task() {
                Some(task) => Reply::MonitorOutput(format!("Current tid: {}\n", task.tid)),
                None => Reply::MonitorOutput("No current task\n".to_string()),
            },
            ["checkpoint"] => match self.create_checkpoint(0) {
                Some((id, mark)) => Reply::MonitorOutput(format!(
                    "Checkpoint {id} at event {}\n",
                    mark.event()
                )),
                None => Reply::error(),
            },
            ["delete", "checkpoint", id] => match id.parse() {
                Ok(id) if self.delete_checkpoint(id) => {
                    Reply::MonitorOutput(format!("Deleted checkpoint {id}\n"))
                }
                _ => Reply::error(),
            },
            ["info", "checkpoints"] => {
                if self.checkpoints.is_empty() {
                    Reply::MonitorOutput("No checkpoints.\n".to_string())
                } else {
                    let mut out = String::from("ID\tWhen\n");
                    for (id, checkpoint) in self.checkpoints.iter() {
                        let _ = writeln!(out, "{id}\t{}", checkpoint.mark.event());
                    }
                    Reply::MonitorOutput(out)
                }
            }
            _ => {
                tracing::debug!(command, "unknown monitor command");
                Reply::Unsupported
            }
        };
        connection.send_reply(reply)
    }
}

fn error_reply(what: &str, error: eyre::Report) -> Reply {
    tracing::warn!(error = %error, "{what} failed");
    Reply::error()
}

/// Cut a `G` packet into values shaped like `current`
fn split_registers(current: &[RegisterValue], bytes: &[u8]) -> Option<Vec<RegisterValue>> {
    let total: usize = current.iter().map(|value| value.value.len()).sum();
    if total != bytes.len() {
        return None;
    }
    let mut offset = 0;
    let values = current
        .iter()
        .map(|value| {
            let size = value.value.len();
            let chunk = bytes[offset..offset + size].to_vec();
            offset += size;
            RegisterValue::new(value.register, chunk)
        })
        .collect();
    Some(values)
}

#[cfg(test)]
mod tests {
    use transport::types::GdbRegister;

    use super::*;

    #[test]
    fn register_block_split_follows_current_layout() {
        let current = vec![
            RegisterValue::new(GdbRegister(0), vec![0; 8]),
            RegisterValue::undefined(GdbRegister(1), 4),
        ];
        let bytes: Vec<u8> = (0..12).collect();
        let values = split_registers(&current, &bytes).unwrap();
        assert_eq!(values[0].value, (0..8).collect::<Vec<u8>>());
        assert_eq!(values[1].value, vec![8, 9, 10, 11]);
        assert!(values[1].defined);
        assert!(split_registers(&current, &bytes[..11]).is_none());
    }
}
