//! Wire protocol between clients/runners and the server.
//!
//! Every message is a frame: a `u32` little-endian byte length followed by a
//! `serde_json`-encoded [`Request`] or [`Reply`]. The unix peer uid is read
//! from `SO_PEERCRED` on the server side and never travels in-band.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame, to fail fast on a corrupt length prefix.
pub const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Admitted, waiting to be dispatched.
    Queued,
    /// Admitted but the active list is full; the submitting client is held.
    HoldingClient,
    /// A queued job the owner explicitly put on hold; the scheduler skips it.
    Locked,
    /// Dispatched, owns slots.
    Running,
    /// Was running, stopped by SIGSTOP; its slots have been released.
    Paused,
    /// Not run because a dependency finished with a non-zero errorlevel.
    Skipped,
    /// Process exited and was reaped.
    Finished,
    /// Submitted with `--relink`; being attached to an external process.
    Relink,
    /// Restored from disk; waiting for a fresh runner to re-register.
    Wait,
    /// Restored from disk with a live pid; a relink runner is on its way.
    Delink,
}

impl JobState {
    /// True for states that will never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::HoldingClient => "holding",
            JobState::Locked => "locked",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Skipped => "skipped",
            JobState::Finished => "finished",
            JobState::Relink => "relink",
            JobState::Wait => "wait",
            JobState::Delink => "delink",
        };
        f.write_str(s)
    }
}

/// Outcome of a job, as reported by its runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Exit code, or `-1` for abnormal endings.
    pub errorlevel: i32,
    /// True when the child died by signal.
    pub died_by_signal: bool,
    /// Terminating signal number, when `died_by_signal`.
    pub signal: i32,
    /// Wall-clock run time in milliseconds.
    pub real_ms: u64,
    /// User CPU time in milliseconds.
    pub user_ms: u64,
    /// System CPU time in milliseconds.
    pub system_ms: u64,
    /// True when the runner skipped the command because a dependency failed.
    pub skipped: bool,
}

/// Submission payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    /// Re-attach to this stored job id (recovery rejoin) instead of
    /// allocating a fresh one.
    #[serde(default)]
    pub supplied_id: Option<u64>,
    /// Attach to an already-running process instead of spawning one.
    #[serde(default)]
    pub taskpid: Option<i32>,
    /// Slots required to run (≥ 1).
    pub num_slots: u32,
    /// Capture stdout/stderr into an output file.
    pub store_output: bool,
    /// Keep the job in the finished list after completion.
    pub should_keep_finished: bool,
    /// Parent job ids; `-1` means "the last job queued before this one".
    #[serde(default)]
    pub depend_on: Vec<i64>,
    /// Full command string as recorded by the server.
    pub command: String,
    /// Byte prefix of `command` to hide when echoing (server-injected flags).
    #[serde(default)]
    pub command_strip: usize,
    /// Working directory for the command.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Free-form label shown in listings.
    #[serde(default)]
    pub label: Option<String>,
    /// Notification address recorded with the job.
    #[serde(default)]
    pub email: Option<String>,
    /// Environment dump recorded into the job info.
    #[serde(default)]
    pub env_dump: Option<String>,
    /// Bind the job to dedicated CPU cores when the server runs with a
    /// core bank.
    #[serde(default)]
    pub taskset: bool,
}

/// Names a job in a request; replaces the C-era `-1` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobSelector {
    /// The most recently added job (active list first, then finished).
    Last,
    /// A specific job id.
    Id(u64),
}

/// Which jobs a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListScope {
    /// The requester's active jobs plus everyone's finished jobs.
    Mine,
    /// Every job.
    All,
}

/// Listing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListFormat {
    /// Aligned human-readable table.
    Table,
    /// One id per line.
    Plain,
    /// JSON array of records.
    Json,
}

/// Client/runner → server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Submit a job (fresh, rejoin, or relink).
    Submit(NewJob),
    /// Runner callback: the child is spawned, here are its output file and pid.
    RunJobOk {
        /// Job id the callback is for.
        jobid: u64,
        /// Output file the runner created, if any.
        ofilename: Option<PathBuf>,
        /// Child (or relink target) pid.
        pid: i32,
    },
    /// Runner callback: the child was reaped.
    EndJob {
        /// Job id the result is for.
        jobid: u64,
        /// The reaped outcome.
        result: JobResult,
    },
    /// List jobs.
    List {
        /// Scope of the listing.
        scope: ListScope,
        /// Output format.
        format: ListFormat,
    },
    /// Multi-line info dump for one job.
    Info(JobSelector),
    /// Output file location of one job.
    Output(JobSelector),
    /// Current state of one job.
    State(JobSelector),
    /// Label of one job.
    GetLabel(JobSelector),
    /// Command string of one job.
    GetCommand(JobSelector),
    /// Highest job id handed out so far.
    LastId,
    /// Block until the job reaches a terminal state.
    Wait(JobSelector),
    /// Remove a non-running job.
    Remove(JobSelector),
    /// Move a job to the head of the queue.
    Urgent(JobSelector),
    /// Exchange two queue positions.
    Swap {
        /// First job id.
        a: u64,
        /// Second job id.
        b: u64,
    },
    /// Hold a job: queued → locked, running → paused (safe pause).
    Hold(JobSelector),
    /// Undo a hold: locked → queued, paused → running.
    Cont(JobSelector),
    /// Count of running jobs, then the requester's running pids.
    KillAll,
    /// Count of running jobs.
    CountRunning,
    /// Drop the requester's (root: everyone's) finished jobs.
    ClearFinished,
    /// Stop a user's running jobs and bar new dispatch for them.
    SuspendUser {
        /// Real uid of the user.
        uid: u32,
    },
    /// Undo `SuspendUser`.
    ResumeUser {
        /// Real uid of the user.
        uid: u32,
    },
    /// Suspend every configured user.
    SuspendAll,
    /// Resume every configured user.
    ResumeAll,
    /// Take the server mutation lock.
    LockServer,
    /// Release the server mutation lock.
    UnlockServer,
    /// Re-read the user table file.
    RefreshUsers,
    /// Change the global slot bound.
    SetMaxSlots {
        /// New bound; must be positive.
        max_slots: i32,
    },
    /// Read the global slot bound.
    GetMaxSlots,
    /// Read a server environment variable.
    GetEnv {
        /// Variable name.
        name: String,
    },
    /// Set a server environment variable (`NAME=value`).
    SetEnv {
        /// The `NAME=value` assignment.
        assignment: String,
    },
    /// Unset a server environment variable.
    UnsetEnv {
        /// Variable name.
        name: String,
    },
    /// Read the directory runners place output files in.
    GetLogdir,
    /// Change the directory runners place output files in.
    SetLogdir {
        /// New directory.
        path: PathBuf,
    },
}

/// Server → client/runner messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// A line (or block) of human-readable text.
    ListLine(String),
    /// Submission accepted under this id.
    NewJobOk {
        /// The allocated (or re-attached) job id.
        jobid: u64,
    },
    /// Dispatch order to the runner holding this job.
    RunJob {
        /// Job id to run.
        jobid: u64,
        /// Accumulated |errorlevel| of finished parents; non-zero ⇒ skip.
        dependency_errorlevel: i32,
        /// Command to execute (strip prefix already removed).
        command: String,
        /// Working directory, if one was recorded.
        work_dir: Option<PathBuf>,
        /// Directory to place the output file in.
        logdir: PathBuf,
    },
    /// The urgent move was applied.
    UrgentOk,
    /// The swap was applied.
    SwapJobsOk,
    /// Number of running jobs.
    CountRunning(u32),
    /// Multi-line job info text.
    InfoData(String),
    /// Where a job's output lives.
    AnswerOutput {
        /// Whether output capture was requested.
        store_output: bool,
        /// The job's pid (0 if not yet dispatched).
        pid: i32,
        /// Output file path, when captured.
        ofilename: Option<PathBuf>,
    },
    /// A job's current state.
    AnswerState(JobState),
    /// The awaited job reached a terminal state.
    WaitJobOk {
        /// Final errorlevel (skip propagates the dependency errorlevel).
        errorlevel: i32,
    },
    /// The removal was applied.
    RemoveJobOk,
    /// Highest job id handed out so far.
    LastId(u64),
    /// Current global slot bound.
    GetMaxSlotsOk(i32),
    /// Pids of the requester's running jobs, for client-side signalling.
    RunningPids(Vec<i32>),
    /// Machine-readable job listing.
    JsonList(serde_json::Value),
    /// Value of a server environment variable, if set.
    EnvValue(Option<String>),
    /// Refusal or failure, with a human-readable reason.
    Error(String),
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        anyhow::bail!("frame too large: {} bytes", body.len());
    }
    w.write_all(&(body.len() as u32).to_le_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly between frames.
pub async fn read_frame<R, T>(r: &mut R) -> anyhow::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("oversized frame: {len} bytes");
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let req = Request::Submit(NewJob {
            num_slots: 2,
            store_output: true,
            should_keep_finished: true,
            depend_on: vec![-1, 1003],
            command: "-J 1007 sleep 5".to_string(),
            command_strip: 8,
            label: Some("nightly".to_string()),
            ..NewJob::default()
        });

        let mut cursor = std::io::Cursor::new(Vec::new());
        write_frame(&mut cursor, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(cursor.into_inner());
        let back: Request = read_frame(&mut cursor).await.unwrap().unwrap();
        match back {
            Request::Submit(j) => {
                assert_eq!(j.num_slots, 2);
                assert_eq!(j.depend_on, vec![-1, 1003]);
                assert_eq!(j.command_strip, 8);
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let empty: Option<Request> = {
            let mut cursor = std::io::Cursor::new(Vec::new());
            read_frame(&mut cursor).await.unwrap()
        };
        assert!(empty.is_none());
    }

    #[test]
    fn state_labels() {
        assert_eq!(JobState::Queued.to_string(), "queued");
        assert_eq!(JobState::HoldingClient.to_string(), "holding");
        assert!(JobState::Skipped.is_terminal());
        assert!(!JobState::Paused.is_terminal());
    }
}
