//! A real gdb-side socket talking to a served replay
use std::{
    io::{IsTerminal, Read, Write},
    net::TcpStream,
    thread,
};

use crossbeam_channel::{Receiver, Sender};
use debugger::{
    ConnectionFlags, GdbServer, Target, gdb_init_script,
    testing::{RecordedStep, Recording},
};
use eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;
use transport::packet;

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

/// Params channel end handed to the server
struct ChannelWriter(Sender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn receive_line(rx: &Receiver<Vec<u8>>) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    while !line.ends_with(b"\n") {
        line.extend(rx.recv().wrap_err("server dropped the params channel")?);
    }
    Ok(line)
}

#[test]
fn test_gdb_connects_with_published_params() -> Result<()> {
    let (tx, rx) = crossbeam_channel::unbounded();

    let server = thread::spawn(move || -> Result<()> {
        let recording = Recording::new()
            .task(100, 100, "main")
            .steps((0..6).map(|i| RecordedStep::new(100, 0x40_1000 + 4 * i).event()));
        let mut server = GdbServer::new(recording.timeline(), Target::default());
        server.serve_replay(ConnectionFlags {
            debugger_params_write: Some(Box::new(ChannelWriter(tx))),
            ..ConnectionFlags::default()
        })
    });

    let params = launcher::read_params(receive_line(&rx)?.as_slice())?;
    assert_eq!(params.pid, 100);
    assert_ne!(params.port, 0);

    let mut stream = TcpStream::connect((params.host.as_str(), params.port))
        .wrap_err("connecting to server")?;
    stream.write_all(&packet::encode(b"qSupported:swbreak+"))?;
    stream.write_all(&packet::encode(b"?"))?;
    stream.write_all(&packet::encode(b"vCont;s"))?;
    stream.write_all(&packet::encode(b"D"))?;
    let mut received = Vec::new();
    stream.read_to_end(&mut received)?;

    server.join().expect("server thread panicked")?;

    let received = String::from_utf8(received)?;
    assert!(received.contains("ReverseContinue+"), "got: {received}");
    assert!(received.contains("$T05thread:p64.64;#"), "got: {received}");
    assert!(received.ends_with(&String::from_utf8(packet::encode(b"OK"))?));
    Ok(())
}

#[test]
fn test_script_file_is_passed_to_gdb() -> Result<()> {
    let mut script = tempfile::NamedTempFile::new()?;
    script.write_all(gdb_init_script().as_bytes())?;

    let params = launcher::DebuggerParams {
        exe_image: "/usr/bin/debuggee".into(),
        host: "127.0.0.1".to_string(),
        port: 1234,
        pid: 100,
    };
    let args = params.gdb_args(Some(script.path()));
    let x = args
        .iter()
        .position(|arg| arg == "-x")
        .ok_or_else(|| eyre::eyre!("no -x in {args:?}"))?;
    assert_eq!(args[x + 1], script.path().display().to_string());

    let written = std::fs::read_to_string(script.path())?;
    assert!(written.contains("define checkpoint"));
    Ok(())
}
