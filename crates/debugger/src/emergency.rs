//! Debugging a live task when no replay is available

use eyre::{Result, WrapErr};
use transport::{DebuggerConnection, Features, GdbListener};

use crate::{
    server::{Backend, GdbServer, publish_connection},
    session::LiveSession,
    types::{ConnectionFlags, Target, TaskUid},
};

/// Accept one debugger over TCP and let it inspect `task` in `session`
///
/// Blocks until the debugger detaches. Reverse execution is not offered.
#[tracing::instrument(skip(session), level = "debug")]
pub fn emergency_debug(
    session: &mut dyn LiveSession,
    task: TaskUid,
    mut flags: ConnectionFlags,
) -> Result<()> {
    let listener = GdbListener::bind(&flags.dbg_host, flags.dbg_port)
        .wrap_err("opening emergency debugger listener")?;
    let port = listener.port()?;
    let info = session
        .task(task)
        .ok_or_else(|| eyre::eyre!("task {task:?} is not alive"))?;
    publish_connection(&mut flags, port, session.exe_image(task), info.tgid)?;

    let stream = listener.accept()?;
    let mut connection = transport::connect(
        stream,
        Features {
            reverse_execution: false,
        },
    )?;
    emergency_debug_with_connection(session, task, &mut connection)
}

/// Run the dispatch loop for `task` over an established connection
pub fn emergency_debug_with_connection(
    session: &mut dyn LiveSession,
    task: TaskUid,
    connection: &mut dyn DebuggerConnection,
) -> Result<()> {
    let info = session
        .task(task)
        .ok_or_else(|| eyre::eyre!("task {task:?} is not alive"))?;
    tracing::warn!(tid = info.tid, name = %info.name, "entering emergency debugging");

    let mut server = GdbServer::with_backend(Backend::Emergency(session), Target::default());
    server.activate_on(info);
    server.serve_connection(connection)
}
