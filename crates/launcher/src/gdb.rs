use std::{
    convert::Infallible,
    ffi::{CString, OsStr},
    io::Read,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use eyre::WrapErr;

use crate::read_params;

/// Find the gdb binary to run
pub fn resolve_gdb(explicit: Option<&Path>) -> eyre::Result<PathBuf> {
    match explicit {
        Some(path) => {
            if !path.is_file() {
                eyre::bail!("gdb binary {} does not exist", path.display());
            }
            Ok(path.to_path_buf())
        }
        None => which::which("gdb")
            .map_err(|_| eyre::eyre!("gdb not found in PATH. Install gdb or pass its path")),
    }
}

fn c_string(arg: impl AsRef<OsStr>) -> eyre::Result<CString> {
    CString::new(arg.as_ref().as_bytes()).context("argument contains a NUL byte")
}

/// Wait for the server's parameters, then replace this process with gdb
///
/// Only returns on failure.
#[tracing::instrument(skip(params_reader))]
pub fn launch_gdb(
    params_reader: impl Read,
    command_file: &Path,
    gdb: Option<&Path>,
) -> eyre::Result<Infallible> {
    let params = read_params(params_reader).context("waiting for the server to listen")?;
    let gdb = resolve_gdb(gdb)?;

    let mut argv = vec![c_string(&gdb)?];
    for arg in params.gdb_args(Some(command_file)) {
        argv.push(c_string(arg)?);
    }
    tracing::info!(gdb = %gdb.display(), port = params.port, "starting gdb");

    let program = c_string(&gdb)?;
    let errno = match nix::unistd::execvp(&program, &argv) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    Err(errno).with_context(|| format!("executing {}", gdb.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_gdb_must_exist() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("gdb");
        assert!(resolve_gdb(Some(&missing)).is_err());

        std::fs::write(&missing, b"")?;
        assert_eq!(resolve_gdb(Some(&missing))?, missing);
        Ok(())
    }

    #[test]
    fn test_launch_without_params_fails_before_exec() {
        let err = launch_gdb(&b""[..], Path::new("/nonexistent"), None).unwrap_err();
        assert!(
            format!("{err:?}").contains("waiting for the server"),
            "got: {err:?}"
        );
    }
}
