use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use spoolq_core::protocol::{JobResult, JobState, NewJob};

use crate::api::ClientId;

/// Wall-clock milestones of a job, plus the free-form environment dump
/// recorded at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTiming {
    /// When the job was admitted.
    pub enqueue: Option<DateTime<Utc>>,
    /// When the runner reported the child spawned.
    pub start: Option<DateTime<Utc>>,
    /// When the result arrived.
    pub end: Option<DateTime<Utc>>,
    /// Environment dump, when the submitter asked for one.
    pub env_dump: Option<String>,
}

/// One spooled job. Owned exclusively by the engine; everything else refers
/// to jobs by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id, ≥ 1000, never reused within a server lifetime.
    pub id: u64,
    /// Current lifecycle state.
    pub state: JobState,
    /// Real uid of the owner.
    pub owner_uid: u32,
    /// Connection of the runner holding this job. Not persisted.
    #[serde(skip)]
    pub runner: Option<ClientId>,
    /// Full command string as submitted (including server-injected flags).
    pub command: String,
    /// Leading bytes of `command` to hide when echoing.
    pub command_strip: usize,
    /// Working directory for the command.
    pub work_dir: Option<PathBuf>,
    /// Display label.
    pub label: Option<String>,
    /// Notification address recorded with the job.
    pub email: Option<String>,
    /// Slots required to run.
    pub num_slots: u32,
    /// Slots currently charged to the global account; non-zero only while
    /// running.
    pub num_allocated: u32,
    /// Resolved parent job ids, all smaller than `id`.
    pub depend_on: Vec<u64>,
    /// Accumulated |errorlevel| of finished parents.
    pub dependency_errorlevel: i32,
    /// Children to bump when this job finishes.
    pub notify_errorlevel_to: Vec<u64>,
    /// Child (or relink target) pid; 0 until dispatched.
    pub pid: i32,
    /// Captured output file.
    pub output_filename: Option<PathBuf>,
    /// Whether output capture was requested.
    pub store_output: bool,
    /// Keep in the finished list after completion.
    pub should_keep_finished: bool,
    /// Pin to dedicated cores when the server runs a core bank.
    pub taskset: bool,
    /// Cores currently held for this job.
    pub cores: Vec<u32>,
    /// Timing record.
    pub info: JobTiming,
    /// Final outcome, present once terminal.
    pub result: Option<JobResult>,
}

impl Job {
    /// Build a job from a submission payload. State, dependencies, and
    /// relink fields are the engine's business and start empty.
    pub(crate) fn from_submission(id: u64, owner_uid: u32, msg: &NewJob) -> Self {
        Self {
            id,
            state: JobState::Queued,
            owner_uid,
            runner: None,
            command: msg.command.clone(),
            command_strip: msg.command_strip,
            work_dir: msg.work_dir.clone(),
            label: msg.label.clone(),
            email: msg.email.clone(),
            num_slots: msg.num_slots.max(1),
            num_allocated: 0,
            depend_on: Vec::new(),
            dependency_errorlevel: 0,
            notify_errorlevel_to: Vec::new(),
            pid: 0,
            output_filename: None,
            store_output: msg.store_output,
            should_keep_finished: msg.should_keep_finished,
            taskset: msg.taskset,
            cores: Vec::new(),
            info: JobTiming {
                env_dump: msg.env_dump.clone(),
                ..JobTiming::default()
            },
            result: None,
        }
    }

    /// The command with the server-injected prefix stripped, for display and
    /// execution.
    pub fn shown_command(&self) -> &str {
        let strip = self.command_strip.min(self.command.len());
        self.command[strip..].trim_start()
    }

    /// Errorlevel a waiter should see for this job.
    pub(crate) fn wait_errorlevel(&self) -> i32 {
        self.result.map(|r| r.errorlevel).unwrap_or(0)
    }
}
