use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn default_slots() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1)
}

#[derive(Debug, Parser)]
#[command(
    name = "spoolq",
    version,
    about = "per-host multi-user task spooler",
    after_help = "Anything that is not a subcommand is spooled as a shell command:\n    spoolq -n2 -L build make -j8"
)]
pub struct Cli {
    /// Slots the submitted command occupies while running.
    #[arg(short = 'n', long = "slots", default_value_t = 1)]
    pub slots: u32,

    /// Depend on the last job queued before this one.
    #[arg(short = 'd', long)]
    pub depend: bool,

    /// Depend on specific job ids (comma separated).
    #[arg(short = 'D', long = "depend-on", value_delimiter = ',', allow_negative_numbers = true)]
    pub depend_on: Vec<i64>,

    /// Label shown in listings.
    #[arg(short = 'L', long)]
    pub label: Option<String>,

    /// Keep the job in the finished list after completion.
    #[arg(short = 'k', long)]
    pub keep: bool,

    /// Discard the command's output instead of capturing it.
    #[arg(short = 'z', long)]
    pub no_output: bool,

    /// Record the submitting environment into the job info.
    #[arg(short = 'E', long)]
    pub record_env: bool,

    /// Working directory for the command (default: where you submit from).
    #[arg(short = 'w', long)]
    pub workdir: Option<PathBuf>,

    /// Notification address recorded with the job.
    #[arg(long)]
    pub email: Option<String>,

    /// Pin the job to dedicated cores (server must run with --bind-cores).
    #[arg(long)]
    pub taskset: bool,

    /// Attach to an already-running process instead of spawning one.
    #[arg(long, value_name = "PID")]
    pub relink: Option<i32>,

    /// Re-attach a recovered job id (spawned by the server, not by hand).
    #[arg(long, value_name = "ID", hide = true)]
    pub rejoin: Option<u64>,

    /// Internal detached-runner stage.
    #[arg(long, hide = true)]
    pub runner: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server in the foreground.
    Daemon(DaemonOpts),
    /// List jobs.
    List {
        /// Every user's jobs, not just yours.
        #[arg(short, long)]
        all: bool,
        /// One job id per line.
        #[arg(long)]
        plain: bool,
        /// JSON array of records.
        #[arg(long)]
        json: bool,
    },
    /// Detailed info for one job.
    Info { jobid: Option<u64> },
    /// Current state of one job.
    State { jobid: Option<u64> },
    /// Output file location of one job.
    Output { jobid: Option<u64> },
    /// Follow the output of one job.
    Tail { jobid: Option<u64> },
    /// Block until a job finishes; exits with its errorlevel.
    Wait { jobid: Option<u64> },
    /// Remove a queued or finished job.
    Remove { jobid: Option<u64> },
    /// Move a job to the head of the queue.
    Urgent { jobid: Option<u64> },
    /// Exchange two queue positions.
    Swap { a: u64, b: u64 },
    /// Hold a job (queued: park it; running: stop it).
    Hold { jobid: Option<u64> },
    /// Undo a hold.
    Cont { jobid: Option<u64> },
    /// Signal all of your running jobs.
    KillAll,
    /// Count running jobs.
    CountRunning,
    /// Drop your finished jobs.
    Clear,
    /// Stop a user's jobs and bar new dispatch for them (root).
    SuspendUser { uid: u32 },
    /// Undo suspend-user.
    ResumeUser { uid: u32 },
    /// Suspend every user (root).
    SuspendAll,
    /// Resume every user (root).
    ResumeAll,
    /// Take the server mutation lock (auto-expires for non-root).
    Lock,
    /// Release the server mutation lock.
    Unlock,
    /// Re-read the user table file.
    RefreshUsers,
    /// Highest job id handed out so far.
    LastId,
    /// Label of one job.
    Label { jobid: Option<u64> },
    /// Command string of one job.
    Cmd { jobid: Option<u64> },
    /// Global slot bound.
    Slots {
        #[command(subcommand)]
        action: SlotsAction,
    },
    /// Server environment variables (seen by recovery runners).
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },
    /// Directory runners place output files in.
    Logdir {
        #[command(subcommand)]
        action: LogdirAction,
    },
    #[command(external_subcommand)]
    Run(Vec<String>),
}

#[derive(Debug, Subcommand)]
pub enum SlotsAction {
    /// Read the bound.
    Get,
    /// Change the bound.
    Set { n: i32 },
}

#[derive(Debug, Subcommand)]
pub enum EnvAction {
    /// Read a variable.
    Get { name: String },
    /// Set a variable (NAME=value).
    Set { assignment: String },
    /// Unset a variable.
    Unset { name: String },
}

#[derive(Debug, Subcommand)]
pub enum LogdirAction {
    /// Read the directory.
    Get,
    /// Change the directory.
    Set { path: PathBuf },
}

#[derive(Debug, Args)]
pub struct DaemonOpts {
    /// Global slot bound.
    #[arg(long, env = "SPOOLQ_SLOTS", default_value_t = default_slots())]
    pub slots: i32,

    /// Active-list bound; submissions beyond it hold their client.
    #[arg(long, env = "SPOOLQ_MAX_JOBS", default_value_t = 10_000)]
    pub max_jobs: usize,

    /// Run a core bank and pin --taskset jobs to dedicated CPUs.
    #[arg(long)]
    pub bind_cores: bool,

    /// Keep the job tables in memory only (no crash recovery).
    #[arg(long)]
    pub no_persist: bool,

    /// Directory runners place output files in.
    #[arg(long, env = "SPOOLQ_LOGDIR")]
    pub logdir: Option<PathBuf>,
}
