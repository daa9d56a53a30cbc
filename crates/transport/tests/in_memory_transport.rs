//! Integration tests for a connection over the in-memory transport
//!
//! One thread plays gdb, writing raw packets and reading raw replies, while
//! the test drives the server side through [`DebuggerConnection`].

use std::io::{IsTerminal, Read, Write};
use std::thread;

use eyre::Result;
use tracing_subscriber::EnvFilter;
use transport::{
    DebuggerConnection, Features, InMemoryTransport, Reply, Request, StopNotification, connect,
    io::GdbTransport,
    packet,
    types::{DetachReason, ThreadId, signals},
};

#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    let _ = color_eyre::install();
}

#[test]
fn test_request_reply_exchange() -> Result<()> {
    let (debugger, server) = InMemoryTransport::pair();
    let mut connection = connect(
        server,
        Features {
            reverse_execution: true,
        },
    )?;

    let gdb = thread::spawn(move || -> Result<Vec<u8>> {
        let (mut reader, mut writer) = debugger.split()?;
        writer.write_all(&packet::encode(b"qSupported:swbreak+"))?;
        writer.write_all(&packet::encode(b"?"))?;
        writer.write_all(&packet::encode(b"qC"))?;
        writer.write_all(&packet::encode(b"D"))?;
        drop(writer);
        let mut received = Vec::new();
        reader.read_to_end(&mut received)?;
        Ok(received)
    });

    // qSupported is answered inside the connection
    assert_eq!(connection.receive_request()?, Request::GetStopReason);
    connection.notify_stop(StopNotification::Stopped {
        thread: ThreadId::new(10, 10),
        signal: signals::SIGTRAP,
        reason: None,
    })?;

    assert_eq!(connection.receive_request()?, Request::GetCurrentThread);
    connection.send_reply(Reply::CurrentThread(ThreadId::new(10, 11)))?;

    assert_eq!(
        connection.receive_request()?,
        Request::Detach(DetachReason::Detach)
    );
    connection.send_reply(Reply::Ok)?;
    assert_eq!(
        connection.receive_request()?,
        Request::Detach(DetachReason::ConnectionLost)
    );
    drop(connection);

    let received = String::from_utf8(gdb.join().expect("gdb thread panicked")?)?;
    assert!(received.contains("ReverseStep+"));
    assert!(received.contains("$T05thread:pa.a;#"));
    assert!(received.contains("$QCpa.b#"));
    assert!(received.ends_with(&String::from_utf8(packet::encode(b"OK"))?));

    Ok(())
}
