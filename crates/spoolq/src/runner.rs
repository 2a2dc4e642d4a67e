//! The runner: the client-side process that holds a job's connection,
//! spawns (or attaches to) the child when the server says run, and reports
//! the reaped result back.
//!
//! A plain submission is two-staged so the shell gets its prompt back: the
//! foreground process forks a detached copy of itself (`--runner`), which
//! submits and stays connected for the job's whole life; the foreground
//! reads the allocated job id from it, prints it, and exits.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;

use spoolq_core::protocol::{JobResult, NewJob, Reply, Request, read_frame, write_frame};

use crate::cli::Cli;
use crate::net::connect;
use crate::procs::children_cpu_ms;

const RUNNER_PAYLOAD_ENV: &str = "SPOOLQ_RUNNER_JOB";

/// Build the submission payload from the CLI surface.
fn payload_from_cli(cli: &Cli, argv: &[String]) -> NewJob {
    let mut depend_on = cli.depend_on.clone();
    if cli.depend {
        depend_on.push(-1);
    }
    let work_dir = cli
        .workdir
        .clone()
        .or_else(|| std::env::current_dir().ok());
    let env_dump = cli.record_env.then(|| {
        std::env::vars()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect::<String>()
    });
    NewJob {
        supplied_id: None,
        taskpid: None,
        num_slots: cli.slots.max(1),
        store_output: !cli.no_output,
        should_keep_finished: cli.keep,
        depend_on,
        command: shell_join(argv),
        command_strip: 0,
        work_dir,
        label: cli.label.clone(),
        email: cli.email.clone(),
        env_dump,
        taskset: cli.taskset,
    }
}

/// Quote argv back into one `sh -c` line.
fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty()
                || arg
                    .chars()
                    .any(|c| c.is_whitespace() || "\"'\\$`!*?[]{}()<>;&|~#".contains(c))
            {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Foreground half of a plain submission.
pub async fn submit_detached(cli: &Cli, argv: &[String]) -> anyhow::Result<()> {
    let payload = payload_from_cli(cli, argv);
    detach_and_announce(&payload).await
}

/// Foreground half of `--relink <pid>`: record the target's cmdline behind
/// an invisible prefix so listings show the real command.
pub async fn relink_detached(cli: &Cli, pid: i32) -> anyhow::Result<()> {
    let cmdline = std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
        .map(|raw| {
            raw.split('\0')
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_else(|_| format!("pid {pid}"));
    let prefix = format!("--relink {pid} ");
    let mut payload = payload_from_cli(cli, &[]);
    payload.taskpid = Some(pid);
    payload.command_strip = prefix.len();
    payload.command = format!("{prefix}{cmdline}");
    detach_and_announce(&payload).await
}

async fn detach_and_announce(payload: &NewJob) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let mut child = tokio::process::Command::new(exe)
        .arg("--runner")
        .env(RUNNER_PAYLOAD_ENV, serde_json::to_string(payload)?)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("spawning the detached runner")?;

    let stdout = child.stdout.take().context("runner stdout missing")?;
    let mut lines = BufReader::new(stdout).lines();
    match lines.next_line().await? {
        Some(line) if line.starts_with("error:") => {
            anyhow::bail!("{}", line.trim_start_matches("error:").trim());
        }
        Some(line) => {
            println!("{line}");
            Ok(())
        }
        None => anyhow::bail!("the runner exited before the job was accepted"),
    }
}

/// Detached stage: submit the payload from the environment and see the job
/// through. The first stdout line is the job id the foreground is waiting
/// for.
pub async fn runner_stage() -> anyhow::Result<()> {
    let raw = std::env::var(RUNNER_PAYLOAD_ENV).context("runner payload missing")?;
    let payload: NewJob = serde_json::from_str(&raw)?;
    let stream = connect(true).await?;
    match runner_loop(stream, payload, true).await {
        Ok(_) => Ok(()),
        Err(err) => {
            // The foreground may already be gone; never panic on a dead pipe.
            use std::io::Write as _;
            let _ = writeln!(std::io::stdout(), "error: {err:#}");
            Err(err)
        }
    }
}

/// Recovery rejoin, spawned by the server: re-attach to a stored job id.
pub async fn rejoin(jobid: u64, relink: Option<i32>) -> anyhow::Result<()> {
    let payload = NewJob {
        supplied_id: Some(jobid),
        taskpid: relink,
        num_slots: 1,
        store_output: false,
        should_keep_finished: false,
        command: String::new(),
        ..NewJob::default()
    };
    let stream = connect(false).await?;
    runner_loop(stream, payload, false).await?;
    Ok(())
}

/// Hold the connection for the job's whole life: submit, wait for the run
/// order, spawn or poll, report.
async fn runner_loop(mut stream: UnixStream, payload: NewJob, announce: bool) -> anyhow::Result<i32> {
    let relink_pid = payload.taskpid;
    let store_output = payload.store_output;
    let (mut reader, mut writer) = stream.split();
    write_frame(&mut writer, &Request::Submit(payload)).await?;

    loop {
        let Some(reply): Option<Reply> = read_frame(&mut reader).await? else {
            anyhow::bail!("server closed the connection");
        };
        match reply {
            Reply::NewJobOk { jobid } => {
                if announce {
                    use std::io::Write as _;
                    println!("{jobid}");
                    let _ = std::io::stdout().flush();
                }
            }
            Reply::Error(msg) => anyhow::bail!("{msg}"),
            Reply::RunJob {
                jobid,
                dependency_errorlevel,
                command,
                work_dir,
                logdir,
            } => {
                // A failed parent means the command never runs; the skip
                // carries the accumulated errorlevel to waiters.
                if dependency_errorlevel != 0 {
                    let result = JobResult {
                        errorlevel: dependency_errorlevel,
                        skipped: true,
                        ..JobResult::default()
                    };
                    write_frame(&mut writer, &Request::EndJob { jobid, result }).await?;
                    return Ok(dependency_errorlevel);
                }

                if let Some(pid) = relink_pid {
                    return relink_watch(&mut writer, jobid, pid).await;
                }

                let started = Instant::now();
                let (ofilename, out_file) = if store_output {
                    let path = logdir.join(format!("spoolq-{jobid}.out"));
                    match std::fs::File::create(&path) {
                        Ok(f) => (Some(path), Some(f)),
                        Err(_) => (None, None),
                    }
                } else {
                    (None, None)
                };

                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(&command).stdin(Stdio::null());
                match out_file {
                    Some(f) => {
                        let err_file = f.try_clone()?;
                        cmd.stdout(Stdio::from(f)).stderr(Stdio::from(err_file));
                    }
                    None => {
                        cmd.stdout(Stdio::null()).stderr(Stdio::null());
                    }
                }
                if let Some(dir) = &work_dir {
                    if dir.is_dir() {
                        cmd.current_dir(dir);
                    }
                }

                let mut child = match cmd.spawn() {
                    Ok(child) => child,
                    Err(err) => {
                        let result = JobResult {
                            errorlevel: 127,
                            real_ms: started.elapsed().as_millis() as u64,
                            ..JobResult::default()
                        };
                        write_frame(&mut writer, &Request::EndJob { jobid, result }).await?;
                        anyhow::bail!("cannot spawn {command:?}: {err}");
                    }
                };
                let pid = child.id().unwrap_or(0) as i32;
                write_frame(&mut writer, &Request::RunJobOk { jobid, ofilename, pid }).await?;

                let status = child.wait().await?;
                let (user_ms, system_ms) = children_cpu_ms();
                let real_ms = started.elapsed().as_millis() as u64;
                let result = match status.code() {
                    Some(code) => JobResult {
                        errorlevel: code,
                        real_ms,
                        user_ms,
                        system_ms,
                        ..JobResult::default()
                    },
                    None => {
                        use std::os::unix::process::ExitStatusExt;
                        JobResult {
                            errorlevel: -1,
                            died_by_signal: true,
                            signal: status.signal().unwrap_or(0),
                            real_ms,
                            user_ms,
                            system_ms,
                            ..JobResult::default()
                        }
                    }
                };
                write_frame(&mut writer, &Request::EndJob { jobid, result }).await?;
                return Ok(result.errorlevel);
            }
            _ => {}
        }
    }
}

/// We cannot `waitpid` a process we did not fork: poll its procfs entry and
/// report the end when it disappears.
async fn relink_watch<W>(writer: &mut W, jobid: u64, pid: i32) -> anyhow::Result<i32>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_frame(writer, &Request::RunJobOk { jobid, ofilename: None, pid }).await?;
    let started = Instant::now();
    let proc_dir = format!("/proc/{pid}");
    while Path::new(&proc_dir).exists() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let result = JobResult {
        errorlevel: 0,
        real_ms: started.elapsed().as_millis() as u64,
        ..JobResult::default()
    };
    write_frame(writer, &Request::EndJob { jobid, result }).await?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::shell_join;

    #[test]
    fn shell_join_quotes_what_needs_quoting() {
        assert_eq!(shell_join(&["make".into(), "-j8".into()]), "make -j8");
        assert_eq!(
            shell_join(&["echo".into(), "two words".into()]),
            "echo 'two words'"
        );
        assert_eq!(
            shell_join(&["echo".into(), "it's".into()]),
            r"echo 'it'\''s'"
        );
    }
}
