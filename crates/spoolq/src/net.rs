//! Client-side connection setup, including first-use server auto-start.

use std::process::Stdio;
use std::time::Duration;

use tokio::net::UnixStream;

use spoolq_core::paths;

/// Connect to the server socket. When nothing is listening and auto-start is
/// allowed, spawn a detached `spoolq daemon` and retry briefly.
pub async fn connect(auto_start: bool) -> anyhow::Result<UnixStream> {
    let path = paths::socket_path();
    match UnixStream::connect(&path).await {
        Ok(stream) => return Ok(stream),
        Err(err) => {
            if !auto_start || std::env::var_os("SPOOLQ_NO_SPAWN").is_some() {
                anyhow::bail!("cannot reach the spoolq server at {}: {err}", path.display());
            }
        }
    }

    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(stream) = UnixStream::connect(&path).await {
            return Ok(stream);
        }
    }
    anyhow::bail!("server did not come up on {}", path.display())
}
