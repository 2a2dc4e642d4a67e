//! Resolution of the socket, state, and config locations from the
//! environment.

use std::path::PathBuf;

fn xdg_dir(var: &str, home_suffix: &[&str]) -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os(var) {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("{var} is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    let mut dir = home;
    for part in home_suffix {
        dir.push(part);
    }
    Ok(dir)
}

fn xdg_state_home() -> anyhow::Result<PathBuf> {
    xdg_dir("XDG_STATE_HOME", &[".local", "state"])
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

/// Uid of the calling process, read from procfs (avoids a libc dependency
/// here; the server is Linux-bound through procfs anyway).
pub fn own_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|m| m.uid())
        .unwrap_or(0)
}

/// Unix socket the server listens on: `$SPOOLQ_SOCKET`, else
/// `$XDG_RUNTIME_DIR/spoolq.sock`, else `/tmp/spoolq-<uid>.sock`.
pub fn socket_path() -> PathBuf {
    if let Some(p) = std::env::var_os("SPOOLQ_SOCKET") {
        return PathBuf::from(p);
    }
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("spoolq.sock");
        }
    }
    PathBuf::from(format!("/tmp/spoolq-{}.sock", own_uid()))
}

/// Persisted job tables: `$SPOOLQ_STATE` or
/// `$XDG_STATE_HOME/spoolq/state.json`.
pub fn state_path() -> anyhow::Result<PathBuf> {
    if let Some(p) = std::env::var_os("SPOOLQ_STATE") {
        return Ok(PathBuf::from(p));
    }
    Ok(xdg_state_home()?.join("spoolq").join("state.json"))
}

/// User table config: `$SPOOLQ_USERS` or
/// `$XDG_CONFIG_HOME/spoolq/users.json`.
pub fn users_path() -> anyhow::Result<PathBuf> {
    if let Some(p) = std::env::var_os("SPOOLQ_USERS") {
        return Ok(PathBuf::from(p));
    }
    Ok(xdg_config_home()?.join("spoolq").join("users.json"))
}

/// Default directory for captured job output.
pub fn default_logdir() -> PathBuf {
    std::env::var_os("SPOOLQ_LOGDIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// Bound on the finished list: `$SPOOLQ_MAXFINISHED`, default 1000.
pub fn max_finished() -> usize {
    std::env::var("SPOOLQ_MAXFINISHED")
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.unsigned_abs() as usize)
        .unwrap_or(1000)
}
