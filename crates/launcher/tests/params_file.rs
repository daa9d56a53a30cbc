use std::{
    io::{IsTerminal, Seek},
    path::PathBuf,
};

use launcher::{DebuggerParams, read_params, write_params};
use tracing_subscriber::EnvFilter;

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
fn test_params_survive_a_file() -> eyre::Result<()> {
    let params = DebuggerParams {
        exe_image: PathBuf::from("/opt/app/bin/server with spaces"),
        host: "localhost".to_string(),
        port: 40123,
        pid: 9001,
    };

    let mut file = tempfile::tempfile()?;
    write_params(&mut file, &params)?;
    file.rewind()?;

    let read = read_params(&file)?;
    assert_eq!(read, params);
    assert!(
        read.command_line(None)
            .ends_with("'/opt/app/bin/server with spaces'")
    );
    Ok(())
}
