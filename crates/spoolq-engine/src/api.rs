//! Public API types for the engine: configuration, the reply outbox, and
//! the recovery directives handed back to the server loop.

use std::path::PathBuf;

use spoolq_core::protocol::Reply;

/// Opaque handle for one client connection. The server loop allocates these
/// and owns the mapping to socket writers; the engine only routes replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global slot bound.
    pub max_slots: i32,
    /// Active-list bound; submissions beyond it hold their client.
    pub max_jobs: usize,
    /// Finished-list bound (FIFO-evicted).
    pub max_finished: usize,
    /// Directory runners place output files in.
    pub logdir: PathBuf,
    /// Path of the user table file, for `RefreshUsers`.
    pub users_path: Option<PathBuf>,
    /// Seed for the scheduler's user rotation; `None` seeds from entropy.
    pub sched_seed: Option<u64>,
    /// Run a core bank over this many CPUs and pin flagged jobs.
    pub bind_cores: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_slots: 1,
            max_jobs: 10_000,
            max_finished: 1000,
            logdir: std::env::temp_dir(),
            users_path: None,
            sched_seed: None,
            bind_cores: None,
        }
    }
}

/// Replies queued during one engine call, flushed to sockets by the server
/// loop afterwards.
#[derive(Debug, Default)]
pub struct Outbox {
    queued: Vec<(ClientId, Reply)>,
}

impl Outbox {
    /// An empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for `to`.
    pub fn send(&mut self, to: ClientId, reply: Reply) {
        self.queued.push((to, reply));
    }

    /// Queue an informational line.
    pub(crate) fn line(&mut self, to: ClientId, text: impl Into<String>) {
        self.send(to, Reply::ListLine(text.into()));
    }

    /// Queue a refusal.
    pub(crate) fn refuse(&mut self, to: ClientId, text: impl Into<String>) {
        self.send(to, Reply::Error(text.into()));
    }

    /// Everything queued so far, in order.
    pub fn messages(&self) -> &[(ClientId, Reply)] {
        &self.queued
    }

    /// Take the queued replies, leaving the outbox empty.
    pub fn drain(&mut self) -> Vec<(ClientId, Reply)> {
        std::mem::take(&mut self.queued)
    }
}

/// How a recovered job gets its runner back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnMode {
    /// Spawn a fresh runner that will re-submit and queue the job.
    Fresh,
    /// Spawn a relink runner that re-attaches to the still-running pid.
    Relink {
        /// The surviving pid.
        pid: i32,
    },
}

/// One runner the server loop must spawn after recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Respawn {
    /// The recovered job.
    pub jobid: u64,
    /// How to re-attach it.
    pub mode: RespawnMode,
}
