//! Starting gdb against a waiting replay server
//!
//! The server publishes [`DebuggerParams`] once it is listening. A launcher
//! process reads them and replaces itself with gdb, pointed at the server and
//! loaded with the startup script.
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use eyre::WrapErr;
use serde::{Deserialize, Serialize};

mod gdb;

pub use gdb::{launch_gdb, resolve_gdb};

/// Everything gdb needs to connect to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerParams {
    /// Executable gdb loads symbols from
    pub exe_image: PathBuf,
    pub host: String,
    pub port: u16,
    /// Process the debugger attaches to
    pub pid: i32,
}

impl DebuggerParams {
    /// Arguments to pass to gdb, not including the program name
    pub fn gdb_args(&self, command_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            // Replay can take a while to answer
            "-l".to_string(),
            "10000".to_string(),
            "-ex".to_string(),
            "set sysroot /".to_string(),
            "-ex".to_string(),
            format!("target extended-remote {}:{}", self.host, self.port),
        ];
        if let Some(file) = command_file {
            args.push("-x".to_string());
            args.push(file.display().to_string());
        }
        if !self.exe_image.as_os_str().is_empty() {
            args.push(self.exe_image.display().to_string());
        }
        args
    }

    /// A shell command line a user can paste to connect by hand
    pub fn command_line(&self, command_file: Option<&Path>) -> String {
        std::iter::once("gdb".to_string())
            .chain(self.gdb_args(command_file).iter().map(|arg| quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(arg: &str) -> String {
    if arg.contains([' ', '\'', '"', '$']) {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

/// Send `params` to a launcher as one line of JSON
pub fn write_params(writer: &mut impl Write, params: &DebuggerParams) -> eyre::Result<()> {
    serde_json::to_writer(&mut *writer, params).context("serializing debugger parameters")?;
    writer.write_all(b"\n").context("writing debugger parameters")?;
    writer.flush().context("flushing debugger parameters")?;
    tracing::debug!(?params, "published debugger parameters");
    Ok(())
}

/// Receive parameters written by [`write_params`]
pub fn read_params(reader: impl Read) -> eyre::Result<DebuggerParams> {
    let mut lines = serde_json::Deserializer::from_reader(reader).into_iter::<DebuggerParams>();
    match lines.next() {
        Some(params) => params.context("parsing debugger parameters"),
        None => eyre::bail!("server closed the channel without sending debugger parameters"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DebuggerParams {
        DebuggerParams {
            exe_image: PathBuf::from("/usr/bin/true"),
            host: "127.0.0.1".to_string(),
            port: 1234,
            pid: 42,
        }
    }

    #[test]
    fn test_command_line() {
        assert_eq!(
            params().command_line(Some(Path::new("/tmp/init.gdb"))),
            "gdb -l 10000 -ex 'set sysroot /' -ex 'target extended-remote 127.0.0.1:1234' -x /tmp/init.gdb /usr/bin/true"
        );
    }

    #[test]
    fn test_missing_exe_is_left_out() {
        let params = DebuggerParams {
            exe_image: PathBuf::new(),
            ..params()
        };
        let args = params.gdb_args(None);
        assert_eq!(args.last().map(String::as_str), Some("target extended-remote 127.0.0.1:1234"));
    }

    #[test]
    fn test_params_through_pipe() -> eyre::Result<()> {
        let mut buf = Vec::new();
        write_params(&mut buf, &params())?;
        assert_eq!(buf.last(), Some(&b'\n'));
        assert_eq!(read_params(buf.as_slice())?, params());
        Ok(())
    }

    #[test]
    fn test_closed_channel() {
        let err = read_params(&b""[..]).unwrap_err();
        assert!(err.to_string().contains("without sending"), "got: {err}");
    }
}
