//! The engine proper: one value owning the job table, the accounts, the
//! dependency fan-out, the waiter list, and the server lock. Every public
//! method is one request from the event loop; replies go through the outbox.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;

use spoolq_affinity::CoreBank;
use spoolq_core::protocol::{
    JobResult, JobSelector, JobState, ListFormat, ListScope, NewJob, Reply, Request,
};
use spoolq_core::users::UserFile;

use crate::account::ResourceAccount;
use crate::api::{ClientId, EngineConfig, Outbox, Respawn, RespawnMode};
use crate::job::Job;
use crate::list;
use crate::persist::{JobStore, StoreError, Table};
use crate::procs::{PauseOutcome, ProcessOps, Signal, safe_pause};
use crate::sched;
use crate::table::JobTable;

const FIRST_JOBID: u64 = 1000;
const LOCK_EXPIRY: Duration = Duration::from_secs(30);

/// Corruption of engine state. The server treats this as fatal: the
/// invariants it guards cannot be repaired at runtime.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An internal invariant does not hold.
    #[error("engine state corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Locker {
    Unlocked,
    Root,
    User(u32),
}

/// The scheduling and job-lifecycle engine.
pub struct Engine {
    cfg: EngineConfig,
    store: Box<dyn JobStore>,
    procs: Box<dyn ProcessOps>,
    table: JobTable,
    account: ResourceAccount,
    /// Clients blocked in `wait`: (connection, jobid).
    notify: Vec<(ClientId, u64)>,
    next_jobid: u64,
    last_errorlevel: i32,
    last_finished_jobid: Option<u64>,
    locker: Locker,
    locked_at: Instant,
    rng: StdRng,
    /// Server-held environment overrides, consulted before the process env.
    env: HashMap<String, String>,
    logdir: PathBuf,
    cores: Option<CoreBank>,
}

impl Engine {
    /// A fresh engine over the given user table and seams.
    pub fn new(
        cfg: EngineConfig,
        users: &UserFile,
        store: Box<dyn JobStore>,
        procs: Box<dyn ProcessOps>,
    ) -> Self {
        let account = ResourceAccount::new(users, cfg.max_slots);
        let rng = match cfg.sched_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cores = cfg.bind_cores.map(CoreBank::new);
        let logdir = cfg.logdir.clone();
        Self {
            cfg,
            store,
            procs,
            table: JobTable::new(),
            account,
            notify: Vec::new(),
            next_jobid: FIRST_JOBID,
            last_errorlevel: 0,
            last_finished_jobid: None,
            locker: Locker::Unlocked,
            locked_at: Instant::now(),
            rng,
            env: HashMap::new(),
            logdir,
            cores,
        }
    }

    // ----- request dispatch ------------------------------------------------

    /// Apply one client request. `uid` is the peer uid from `SO_PEERCRED`.
    pub fn handle(
        &mut self,
        client: ClientId,
        uid: u32,
        req: Request,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        match req {
            Request::Submit(msg) => self.submit(client, uid, msg, out),
            Request::RunJobOk { jobid, ofilename, pid } => {
                return self.runjob_ok(jobid, ofilename, pid);
            }
            Request::EndJob { jobid, result } => return self.end_job(jobid, result, out),
            Request::List { scope, format } => self.list(client, uid, scope, format, out),
            Request::Info(sel) => self.job_info(client, sel, out),
            Request::Output(sel) => self.send_output(client, sel, out),
            Request::State(sel) => self.send_state(client, sel, out),
            Request::GetLabel(sel) => self.get_label(client, sel, out),
            Request::GetCommand(sel) => self.get_command(client, sel, out),
            Request::LastId => out.send(client, Reply::LastId(self.next_jobid - 1)),
            Request::Wait(sel) => self.wait_job(client, sel, out),
            Request::Remove(sel) => self.remove_job(client, uid, sel, out),
            Request::Urgent(sel) => self.move_urgent(client, uid, sel, out),
            Request::Swap { a, b } => self.swap_jobs(client, uid, a, b, out),
            Request::Hold(sel) => self.hold_job(client, uid, sel, out),
            Request::Cont(sel) => self.cont_job(client, uid, sel, out),
            Request::KillAll => self.kill_all(client, uid, out),
            Request::CountRunning => self.count_running(client, out),
            Request::ClearFinished => self.clear_finished(client, uid, out),
            Request::SuspendUser { uid: target } => self.suspend_user(client, uid, target, out),
            Request::ResumeUser { uid: target } => self.resume_user(client, uid, target, out),
            Request::SuspendAll => self.suspend_all(client, uid, out),
            Request::ResumeAll => self.resume_all(client, uid, out),
            Request::LockServer => self.lock_server(client, uid, out),
            Request::UnlockServer => self.unlock_server(client, uid, out),
            Request::RefreshUsers => self.refresh_users(client, uid, out),
            Request::SetMaxSlots { max_slots } => self.set_max_slots(client, uid, max_slots, out),
            Request::GetMaxSlots => {
                out.send(client, Reply::GetMaxSlotsOk(self.account.max_slots()));
            }
            Request::GetEnv { name } => self.get_env(client, &name, out),
            Request::SetEnv { assignment } => self.set_env(client, uid, &assignment, out),
            Request::UnsetEnv { name } => self.unset_env(client, uid, &name, out),
            Request::GetLogdir => out.line(client, self.logdir.display().to_string()),
            Request::SetLogdir { path } => self.set_logdir(client, uid, path, out),
        }
        Ok(())
    }

    // ----- submission ------------------------------------------------------

    /// Admit a job: fresh submission, recovery rejoin, or relink.
    pub fn submit(&mut self, client: ClientId, uid: u32, msg: NewJob, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        if msg.supplied_id.is_none() && self.account.internal_uid(uid).is_none() {
            out.refuse(client, format!("uid {uid} is not in the user table"));
            return;
        }

        if let Some(id) = msg.supplied_id {
            self.rejoin(client, uid, id, &msg, out);
            return;
        }

        if let Some(pid) = msg.taskpid {
            if !self.procs.is_alive(pid) {
                out.refuse(client, format!("pid {pid} does not exist"));
                return;
            }
            let owner = self.procs.owner_uid(pid);
            if uid != 0 && owner != Some(uid) {
                out.refuse(client, format!("pid {pid} belongs to another user"));
                return;
            }
        }

        let id = self.next_jobid;
        self.next_jobid += 1;

        let mut job = Job::from_submission(id, uid, &msg);
        job.runner = Some(client);
        job.info.enqueue = Some(Utc::now());
        if let Some(pid) = msg.taskpid {
            job.state = JobState::Relink;
            job.pid = pid;
            job.output_filename = self.procs.stdout_path(pid);
        } else if self.table.count_active() >= self.cfg.max_jobs {
            job.state = JobState::HoldingClient;
        }

        self.resolve_dependencies(&mut job, &msg.depend_on);

        let held = job.state == JobState::HoldingClient;
        self.admit(job);
        if !held {
            out.send(client, Reply::NewJobOk { jobid: id });
        }
        self.schedule(out);
    }

    /// Re-attach a fresh runner connection to a recovered job.
    fn rejoin(&mut self, client: ClientId, uid: u32, id: u64, msg: &NewJob, out: &mut Outbox) {
        let Some(job) = self.table.get(id) else {
            out.refuse(client, format!("job {id} is not waiting for a runner"));
            return;
        };
        if uid != 0 && job.owner_uid != uid {
            out.refuse(client, format!("job {id} belongs to another user"));
            return;
        }
        match job.state {
            JobState::Delink => {
                let pid = job.pid;
                if msg.taskpid.is_some_and(|p| p != pid) {
                    out.refuse(client, format!("job {id} records a different pid"));
                    return;
                }
                if let Some(job) = self.table.get_mut(id) {
                    job.runner = Some(client);
                }
                self.set_state(id, JobState::Relink);
            }
            JobState::Wait => {
                if let Some(job) = self.table.get_mut(id) {
                    job.runner = Some(client);
                }
                self.set_state(id, JobState::Queued);
            }
            JobState::Locked => {
                if let Some(job) = self.table.get_mut(id) {
                    job.runner = Some(client);
                }
            }
            other => {
                out.refuse(client, format!("job {id} already exists (state {other})"));
                return;
            }
        }
        out.send(client, Reply::NewJobOk { jobid: id });
        self.schedule(out);
    }

    /// Resolve `-1` sentinels and explicit parent ids at admission, wiring
    /// the reverse notification edges into still-active parents.
    fn resolve_dependencies(&mut self, job: &mut Job, raw: &[i64]) {
        for &raw_id in raw {
            if raw_id >= 0 && raw_id as u64 >= job.id {
                continue;
            }
            if raw_id >= 0 {
                let parent_id = raw_id as u64;
                job.depend_on.push(parent_id);
                if self.table.contains_active(parent_id) {
                    if let Some(parent) = self.table.get_mut(parent_id) {
                        parent.notify_errorlevel_to.push(job.id);
                    }
                } else if let Some(parent) = self.table.get(parent_id) {
                    job.dependency_errorlevel +=
                        parent.result.map(|r| r.errorlevel).unwrap_or(1).abs();
                } else {
                    // A vanished parent counts as a failed one.
                    job.dependency_errorlevel += 1;
                }
                continue;
            }

            // "The last job queued before this one". Distrust the active
            // list when something finished after its newest entry.
            let mut target = self.table.last_in_queue_by_id();
            if let (Some(last_fin), Some(t)) = (self.last_finished_jobid, target) {
                if last_fin > t {
                    target = None;
                }
            }
            if let Some(t) = target {
                job.depend_on.push(t);
                if let Some(parent) = self.table.get_mut(t) {
                    parent.notify_errorlevel_to.push(job.id);
                }
            } else if let Some(f) = self.table.last_finished_by_id() {
                job.depend_on.push(f);
                if self.last_finished_jobid.is_none_or(|lf| lf < f) {
                    let errorlevel = self
                        .table
                        .get(f)
                        .and_then(|p| p.result)
                        .map(|r| r.errorlevel)
                        .unwrap_or(1);
                    job.dependency_errorlevel += errorlevel.abs();
                } else {
                    job.dependency_errorlevel += self.last_errorlevel.abs();
                }
            } else {
                // Nothing left of the previous jobs; use the last known
                // errorlevel of this server's lifetime.
                job.dependency_errorlevel += self.last_errorlevel.abs();
            }
        }
    }

    fn admit(&mut self, job: Job) {
        if job.state == JobState::Queued {
            if let Some(u) = self.account.internal_uid(job.owner_uid) {
                self.account.queued_inc(u);
            }
        }
        self.store_op(|s| s.insert(Table::Jobs, &job));
        self.table.insert_active(job);
    }

    // ----- runner callbacks ------------------------------------------------

    /// The runner spawned (or attached to) the child.
    pub fn runjob_ok(
        &mut self,
        jobid: u64,
        ofilename: Option<PathBuf>,
        pid: i32,
    ) -> Result<(), EngineError> {
        let Some(job) = self.table.get_mut(jobid) else {
            return Err(EngineError::Corrupt(format!(
                "runjob_ok for unknown job {jobid}"
            )));
        };
        if !matches!(job.state, JobState::Running | JobState::Paused) {
            return Err(EngineError::Corrupt(format!(
                "runjob_ok for job {jobid} in state {}",
                job.state
            )));
        }
        job.pid = pid;
        if job.output_filename.is_none() {
            job.output_filename = ofilename;
        }
        job.info.start = Some(Utc::now());
        let cores = job.cores.clone();

        if pid > 0 && !cores.is_empty() {
            if let Err(err) = spoolq_affinity::set_task_cores(pid, &cores) {
                tracing::warn!("cannot pin job {jobid} (pid {pid}): {err}");
            }
        }
        let snapshot = self.table.get(jobid).cloned();
        if let Some(snapshot) = snapshot {
            self.store_op(|s| s.insert_or_replace(Table::Jobs, &snapshot));
        }
        Ok(())
    }

    /// The runner reaped the child (or skipped it for a failed dependency).
    pub fn end_job(
        &mut self,
        jobid: u64,
        result: JobResult,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let Some(job) = self.table.get(jobid) else {
            return Err(EngineError::Corrupt(format!(
                "end_job for unknown job {jobid}"
            )));
        };
        if !self.table.contains_active(jobid) {
            return Err(EngineError::Corrupt(format!(
                "end_job for job {jobid} outside the active list"
            )));
        }
        if job.state == JobState::Running && self.account.busy_slots() <= 0 {
            return Err(EngineError::Corrupt(format!(
                "busy_slots = {} while job {jobid} finishes",
                self.account.busy_slots()
            )));
        }
        self.finish_job(jobid, result, out);
        if self.account.busy_slots() < 0 {
            return Err(EngineError::Corrupt(format!(
                "busy_slots = {} after job {jobid} finished",
                self.account.busy_slots()
            )));
        }
        self.schedule(out);
        Ok(())
    }

    /// Shared finish path: frees resources, fans out to dependents and
    /// waiters, and archives or destroys the record.
    fn finish_job(&mut self, jobid: u64, result: JobResult, out: &mut Outbox) {
        self.free_cores(jobid);
        let state = if result.skipped {
            JobState::Skipped
        } else {
            JobState::Finished
        };
        self.set_state(jobid, state);
        if let Some(job) = self.table.get_mut(jobid) {
            job.result = Some(result);
            job.info.end = Some(Utc::now());
        }
        self.last_finished_jobid = Some(jobid);
        self.notify_errorlevel(jobid);

        let keep = self
            .table
            .get(jobid)
            .is_some_and(|j| j.should_keep_finished)
            || self.in_notify_list(jobid);
        if keep {
            let evicted = self.table.archive(jobid, self.cfg.max_finished);
            for old in evicted {
                self.store_op(|s| s.delete(Table::Finished, old));
            }
            let snapshot = self.table.get(jobid).cloned();
            if let Some(snapshot) = snapshot {
                self.store_op(|s| s.insert_or_replace(Table::Finished, &snapshot));
            }
        } else {
            self.table.remove(jobid);
        }
        self.store_op(|s| s.delete(Table::Jobs, jobid));

        self.check_notify_list(jobid, out);
        self.wake_hold_client(out);
    }

    /// Record the finisher's errorlevel and bump every dependent child.
    fn notify_errorlevel(&mut self, jobid: u64) {
        let (errorlevel, children) = match self.table.get(jobid) {
            Some(job) => (
                job.result.map(|r| r.errorlevel).unwrap_or(0),
                job.notify_errorlevel_to.clone(),
            ),
            None => return,
        };
        self.last_errorlevel = errorlevel;
        for child in children {
            if let Some(c) = self.table.get_mut(child) {
                c.dependency_errorlevel += errorlevel.abs();
            }
        }
    }

    fn in_notify_list(&self, jobid: u64) -> bool {
        self.notify.iter().any(|(_, j)| *j == jobid)
    }

    /// Wake the waiters of a now-terminal job, then evict it from the
    /// finished list if it was only being kept for them.
    fn check_notify_list(&mut self, jobid: u64, out: &mut Outbox) {
        let waiters: Vec<ClientId> = self
            .notify
            .iter()
            .filter(|(_, j)| *j == jobid)
            .map(|(c, _)| *c)
            .collect();
        if waiters.is_empty() {
            return;
        }
        let Some(job) = self.table.get(jobid) else {
            return;
        };
        if !job.state.is_terminal() {
            return;
        }
        let errorlevel = job.wait_errorlevel();
        let keep = job.should_keep_finished;
        for waiter in waiters {
            out.send(waiter, Reply::WaitJobOk { errorlevel });
        }
        self.notify.retain(|(_, j)| *j != jobid);
        if !keep && !self.in_notify_list(jobid) {
            self.table.remove(jobid);
            self.store_op(|s| s.delete(Table::Finished, jobid));
        }
    }

    fn wake_hold_client(&mut self, out: &mut Outbox) {
        if self.table.count_active() >= self.cfg.max_jobs {
            return;
        }
        let Some(id) = self.table.find_holding_client() else {
            return;
        };
        self.set_state(id, JobState::Queued);
        let runner = self.table.get(id).and_then(|j| j.runner);
        if let Some(runner) = runner {
            out.send(runner, Reply::NewJobOk { jobid: id });
        }
    }

    // ----- scheduling ------------------------------------------------------

    /// Dispatch runnable jobs until nothing more fits.
    pub fn schedule(&mut self, out: &mut Outbox) {
        loop {
            let Some(id) = sched::next_run_job(&self.table, &self.account, &mut self.rng) else {
                break;
            };
            if !self.dispatch(id, out) {
                break;
            }
        }
    }

    fn dispatch(&mut self, id: u64, out: &mut Outbox) -> bool {
        let Some(job) = self.table.get(id) else {
            return false;
        };
        let state = job.state;
        let runner = job.runner;
        let pid = job.pid;
        let dependency_errorlevel = job.dependency_errorlevel;
        let command = job.shown_command().to_string();
        let work_dir = job.work_dir.clone();

        match state {
            JobState::Relink => {
                if pid > 0 && self.procs.is_stopped(pid) {
                    // Attached to an already-stopped process: hold it paused
                    // without charging slots.
                    self.set_state(id, JobState::Paused);
                } else {
                    self.configure_running(id);
                }
            }
            JobState::Queued => {
                if runner.is_none() {
                    return false;
                }
                self.configure_running(id);
            }
            _ => return false,
        }

        // A dispatch that left the state untouched (e.g. the owner vanished
        // from the user table mid-flight) must not be reported as progress,
        // or the dispatch loop would spin on it.
        let progressed = self
            .table
            .get(id)
            .is_none_or(|j| !matches!(j.state, JobState::Queued | JobState::Relink));
        if !progressed {
            return false;
        }

        if let Some(runner) = runner {
            out.send(
                runner,
                Reply::RunJob {
                    jobid: id,
                    dependency_errorlevel,
                    command,
                    work_dir,
                    logdir: self.logdir.clone(),
                },
            );
        }
        true
    }

    /// Charge the accounts and mark the job running. Idempotent: calling it
    /// on a job that is already RUNNING with its slots charged is a no-op.
    fn configure_running(&mut self, id: u64) {
        let Some(job) = self.table.get(id) else {
            return;
        };
        if job.state == JobState::Running && job.num_allocated > 0 {
            return;
        }
        let Some(u) = self.account.internal_uid(job.owner_uid) else {
            return;
        };
        let pid = job.pid;
        let slots = job.num_slots;
        let wants_cores = job.taskset;

        if wants_cores {
            if let Some(bank) = self.cores.as_mut() {
                if let Some(cores) = bank.lock_cores(id, slots as usize) {
                    if pid > 0 {
                        if let Err(err) = spoolq_affinity::set_task_cores(pid, &cores) {
                            tracing::warn!("cannot pin job {id} (pid {pid}): {err}");
                        }
                    }
                    if let Some(job) = self.table.get_mut(id) {
                        job.cores = cores;
                    }
                }
            }
        }
        if pid > 0 && self.procs.is_stopped(pid) {
            self.procs.kill_tree(pid, Signal::Cont);
        }
        self.account.charge(u, slots);
        if let Some(job) = self.table.get_mut(id) {
            job.num_allocated = slots;
        }
        self.set_state(id, JobState::Running);
    }

    /// Release the job's slot charges and core holds. No-op when nothing is
    /// allocated.
    fn free_cores(&mut self, id: u64) {
        let Some(job) = self.table.get(id) else {
            return;
        };
        let allocated = job.num_allocated;
        let owner_uid = job.owner_uid;
        if let Some(bank) = self.cores.as_mut() {
            bank.unlock_cores(id);
        }
        if let Some(job) = self.table.get_mut(id) {
            job.cores.clear();
            job.num_allocated = 0;
        }
        if allocated > 0 {
            if let Some(u) = self.account.internal_uid(owner_uid) {
                self.account.release(u, allocated);
            }
        }
    }

    /// State transitions funnel through here so the per-user queued counters
    /// stay exact on every path, and the change mirrors to the store.
    fn set_state(&mut self, id: u64, new: JobState) {
        let Some(job) = self.table.get_mut(id) else {
            return;
        };
        let old = job.state;
        if old == new {
            return;
        }
        let owner_uid = job.owner_uid;
        job.state = new;

        if let Some(u) = self.account.internal_uid(owner_uid) {
            if old == JobState::Queued {
                self.account.queued_dec(u);
            }
            if new == JobState::Queued {
                self.account.queued_inc(u);
            }
        }
        if !new.is_terminal() {
            self.store_op(|s| s.set_state(Table::Jobs, id, new));
        }
    }

    // ----- waiters ---------------------------------------------------------

    /// Reply immediately for terminal jobs; otherwise park the client.
    pub fn wait_job(&mut self, client: ClientId, sel: JobSelector, out: &mut Outbox) {
        let Some(id) = self.select_job(sel) else {
            out.refuse(client, selector_error(sel, "waited"));
            return;
        };
        let Some(job) = self.table.get(id) else {
            return;
        };
        if job.state.is_terminal() {
            let errorlevel = job.wait_errorlevel();
            out.send(client, Reply::WaitJobOk { errorlevel });
        } else {
            self.notify.push((client, id));
        }
    }

    // ----- removal / reordering -------------------------------------------

    /// Remove a non-running job. Waiters see errorlevel −1 and dependents
    /// are bumped as if the job had failed.
    pub fn remove_job(&mut self, client: ClientId, uid: u32, sel: JobSelector, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let Some(id) = self.select_job(sel) else {
            out.refuse(client, selector_error(sel, "removed"));
            return;
        };
        let Some(job) = self.table.get(id) else {
            return;
        };
        if !may_act(uid, job) {
            out.refuse(
                client,
                format!("job {id} belongs to {}, not uid {uid}", self.display_user(job.owner_uid)),
            );
            return;
        }
        if job.state == JobState::Running {
            out.refuse(client, format!("job {id} is running; kill it instead"));
            return;
        }
        let was_active = self.table.contains_active(id);
        let held_runner = if job.state == JobState::HoldingClient {
            job.runner
        } else {
            None
        };

        self.free_cores(id);
        if let Some(job) = self.table.get_mut(id) {
            job.result = Some(JobResult {
                errorlevel: -1,
                ..JobResult::default()
            });
        }
        self.set_state(id, JobState::Finished);
        self.notify_errorlevel(id);

        let waiters: Vec<ClientId> = self
            .notify
            .iter()
            .filter(|(_, j)| *j == id)
            .map(|(c, _)| *c)
            .collect();
        for waiter in waiters {
            out.send(waiter, Reply::WaitJobOk { errorlevel: -1 });
        }
        self.notify.retain(|(_, j)| *j != id);
        if let Some(runner) = held_runner {
            if runner != client {
                out.refuse(runner, format!("job {id} was removed before it could queue"));
            }
        }

        self.table.remove(id);
        if was_active {
            self.store_op(|s| s.delete(Table::Jobs, id));
        } else {
            self.store_op(|s| s.delete(Table::Finished, id));
        }
        out.send(client, Reply::RemoveJobOk);
        self.wake_hold_client(out);
        self.schedule(out);
    }

    /// Move a job to the head of the active list.
    pub fn move_urgent(&mut self, client: ClientId, uid: u32, sel: JobSelector, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let id = match sel {
            JobSelector::Id(id) => Some(id),
            JobSelector::Last => self.table.active_ids().last().copied(),
        };
        let Some(id) = id.filter(|&id| self.table.contains_active(id)) else {
            out.refuse(client, selector_error(sel, "urged"));
            return;
        };
        self.table.move_top(id);
        self.store_op(|s| s.move_top(id));
        out.send(client, Reply::UrgentOk);
        self.schedule(out);
    }

    /// Exchange two active-list positions.
    pub fn swap_jobs(&mut self, client: ClientId, uid: u32, a: u64, b: u64, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        if self.table.swap(a, b) {
            self.store_op(|s| s.swap(a, b));
            out.send(client, Reply::SwapJobsOk);
            self.schedule(out);
        } else {
            out.refuse(client, format!("jobs {a} and {b} cannot be swapped"));
        }
    }

    // ----- hold / cont -----------------------------------------------------

    /// Hold a job: queued → locked (the scheduler skips it), running →
    /// safe-paused with its slots released.
    pub fn hold_job(&mut self, client: ClientId, uid: u32, sel: JobSelector, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let id = match sel {
            JobSelector::Id(id) => Some(id),
            JobSelector::Last => self.table.active_ids().last().copied(),
        };
        let Some(id) = id.filter(|&id| self.table.contains_active(id)) else {
            out.refuse(client, selector_error(sel, "held"));
            return;
        };
        let Some(job) = self.table.get(id) else {
            return;
        };
        if !may_act(uid, job) {
            out.refuse(
                client,
                format!("job {id} belongs to {}, not uid {uid}", self.display_user(job.owner_uid)),
            );
            return;
        }
        match job.state {
            JobState::Queued => {
                self.set_state(id, JobState::Locked);
                out.line(client, format!("job {id} held"));
            }
            JobState::Running => {
                let pid = job.pid;
                if pid <= 0 {
                    out.refuse(client, format!("job {id} has no pid yet"));
                    return;
                }
                match safe_pause(self.procs.as_ref(), pid) {
                    PauseOutcome::Paused => {
                        self.free_cores(id);
                        self.set_state(id, JobState::Paused);
                        out.line(client, format!("job {id} held"));
                        self.schedule(out);
                    }
                    PauseOutcome::StillRunning => {
                        out.refuse(client, format!("job {id} did not stop; left running"));
                    }
                }
            }
            other => {
                out.refuse(client, format!("job {id} cannot be held from state {other}"));
            }
        }
    }

    /// Undo a hold: locked → queued, paused → running with slots re-charged.
    pub fn cont_job(&mut self, client: ClientId, uid: u32, sel: JobSelector, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let id = match sel {
            JobSelector::Id(id) => Some(id),
            JobSelector::Last => self.table.active_ids().last().copied(),
        };
        let Some(id) = id.filter(|&id| self.table.contains_active(id)) else {
            out.refuse(client, selector_error(sel, "continued"));
            return;
        };
        let Some(job) = self.table.get(id) else {
            return;
        };
        if !may_act(uid, job) {
            out.refuse(
                client,
                format!("job {id} belongs to {}, not uid {uid}", self.display_user(job.owner_uid)),
            );
            return;
        }
        match job.state {
            JobState::Locked => {
                self.set_state(id, JobState::Queued);
                out.line(client, format!("job {id} continued"));
                self.schedule(out);
            }
            JobState::Paused => {
                self.configure_running(id);
                out.line(client, format!("job {id} continued"));
            }
            other => {
                out.refuse(client, format!("job {id} cannot be continued from state {other}"));
            }
        }
    }

    // ----- per-user suspension --------------------------------------------

    /// Stop a user's running jobs and bar new dispatch for them. The reply
    /// is one text block (one frame per request).
    pub fn suspend_user(&mut self, client: ClientId, uid: u32, target: u32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        if uid != 0 && uid != target {
            out.refuse(client, "only root may suspend another user");
            return;
        }
        let mut lines = Vec::new();
        self.suspend_user_inner(target, &mut lines);
        out.line(client, lines.join("\n"));
    }

    fn suspend_user_inner(&mut self, target: u32, lines: &mut Vec<String>) {
        let Some(u) = self.account.internal_uid(target) else {
            lines.push(format!("uid {target} is not in the user table"));
            return;
        };
        self.account.suspend(u);
        let running: Vec<(u64, i32)> = self
            .table
            .active_jobs()
            .filter(|j| j.owner_uid == target && j.state == JobState::Running)
            .map(|j| (j.id, j.pid))
            .collect();
        for (id, pid) in running {
            if pid <= 0 {
                lines.push(format!("cannot stop job {id}: no pid recorded"));
                continue;
            }
            match safe_pause(self.procs.as_ref(), pid) {
                PauseOutcome::Paused => {
                    self.free_cores(id);
                    self.set_state(id, JobState::Paused);
                }
                PauseOutcome::StillRunning => {
                    lines.push(format!("job {id} did not stop; left running"));
                }
            }
        }
        lines.push(format!("suspended user {}", self.display_user(target)));
    }

    /// Restore a user's cap and restart their paused jobs.
    pub fn resume_user(&mut self, client: ClientId, uid: u32, target: u32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        if uid != 0 && uid != target {
            out.refuse(client, "only root may resume another user");
            return;
        }
        let mut lines = Vec::new();
        self.resume_user_inner(target, &mut lines);
        out.line(client, lines.join("\n"));
        self.schedule(out);
    }

    fn resume_user_inner(&mut self, target: u32, lines: &mut Vec<String>) {
        let Some(u) = self.account.internal_uid(target) else {
            lines.push(format!("uid {target} is not in the user table"));
            return;
        };
        self.account.resume(u);
        let paused: Vec<u64> = self
            .table
            .active_jobs()
            .filter(|j| j.owner_uid == target && j.state == JobState::Paused)
            .map(|j| j.id)
            .collect();
        for id in paused {
            self.configure_running(id);
        }
        lines.push(format!("resumed user {}", self.display_user(target)));
    }

    /// Suspend every configured user. Root only.
    pub fn suspend_all(&mut self, client: ClientId, uid: u32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        if uid != 0 {
            out.refuse(client, "only root may suspend all users");
            return;
        }
        let uids: Vec<u32> = (0..self.account.user_count())
            .map(|u| self.account.user(u).uid)
            .collect();
        let mut lines = Vec::new();
        for target in uids {
            self.suspend_user_inner(target, &mut lines);
        }
        out.line(client, lines.join("\n"));
    }

    /// Resume every configured user. Root only.
    pub fn resume_all(&mut self, client: ClientId, uid: u32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        if uid != 0 {
            out.refuse(client, "only root may resume all users");
            return;
        }
        let uids: Vec<u32> = (0..self.account.user_count())
            .map(|u| self.account.user(u).uid)
            .collect();
        let mut lines = Vec::new();
        for target in uids {
            self.resume_user_inner(target, &mut lines);
        }
        out.line(client, lines.join("\n"));
        self.schedule(out);
    }

    // ----- kill / clear ----------------------------------------------------

    /// Report the running-job count, then the requester's running pids for
    /// client-side signalling.
    pub fn kill_all(&mut self, client: ClientId, uid: u32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let pids: Vec<i32> = self
            .table
            .active_jobs()
            .filter(|j| j.state == JobState::Running && may_act(uid, j) && j.pid > 0)
            .map(|j| j.pid)
            .collect();
        out.send(client, Reply::CountRunning(pids.len() as u32));
        out.send(client, Reply::RunningPids(pids));
    }

    /// Count of running jobs, all users.
    pub fn count_running(&self, client: ClientId, out: &mut Outbox) {
        let count = self
            .table
            .active_jobs()
            .filter(|j| j.state == JobState::Running)
            .count();
        out.send(client, Reply::CountRunning(count as u32));
    }

    /// Drop the requester's (root: everyone's) finished jobs.
    pub fn clear_finished(&mut self, client: ClientId, uid: u32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let ids: Vec<u64> = self
            .table
            .finished_jobs()
            .filter(|j| may_act(uid, j))
            .map(|j| j.id)
            .collect();
        let count = ids.len();
        for id in ids {
            self.table.remove(id);
            self.store_op(|s| s.delete(Table::Finished, id));
        }
        out.line(client, format!("cleared {count} finished jobs"));
    }

    // ----- queries ---------------------------------------------------------

    /// Send the listing in the requested format.
    pub fn list(
        &self,
        client: ClientId,
        uid: u32,
        scope: ListScope,
        format: ListFormat,
        out: &mut Outbox,
    ) {
        match format {
            ListFormat::Table => {
                out.line(client, list::render_table(&self.table, &self.account, scope, uid));
            }
            ListFormat::Plain => out.line(client, list::render_plain(&self.table, scope, uid)),
            ListFormat::Json => {
                out.send(
                    client,
                    Reply::JsonList(list::render_json(&self.table, &self.account, scope, uid)),
                );
            }
        }
    }

    /// Multi-line info dump for one job.
    pub fn job_info(&self, client: ClientId, sel: JobSelector, out: &mut Outbox) {
        let Some(id) = self.select_job(sel) else {
            out.refuse(client, selector_error(sel, "shown"));
            return;
        };
        if let Some(job) = self.table.get(id) {
            out.send(client, Reply::InfoData(list::render_info(job, &self.account)));
        }
    }

    /// Where a job's output lives. The `Last` selector prefers the head of
    /// the active list while anything runs, like the original server.
    pub fn send_output(&self, client: ClientId, sel: JobSelector, out: &mut Outbox) {
        let id = match sel {
            JobSelector::Id(id) => Some(id),
            JobSelector::Last => {
                if self.account.busy_slots() > 0 {
                    self.table.active_ids().first().copied()
                } else {
                    self.table.finished_ids().last()
                }
            }
        };
        let job = id.and_then(|id| self.table.get(id)).filter(|j| {
            matches!(
                j.state,
                JobState::Running | JobState::Paused | JobState::Finished | JobState::Skipped
            )
        });
        let Some(job) = job else {
            out.refuse(client, selector_error(sel, "shown: not finished or not running"));
            return;
        };
        if job.state == JobState::Skipped {
            out.line(client, format!("job {} was skipped due to a dependency", job.id));
            return;
        }
        out.send(
            client,
            Reply::AnswerOutput {
                store_output: job.store_output,
                pid: job.pid,
                ofilename: job.output_filename.clone(),
            },
        );
    }

    /// Current state of one job.
    pub fn send_state(&self, client: ClientId, sel: JobSelector, out: &mut Outbox) {
        let Some(id) = self.select_job(sel) else {
            out.refuse(client, selector_error(sel, "stated"));
            return;
        };
        if let Some(job) = self.table.get(id) {
            out.send(client, Reply::AnswerState(job.state));
        }
    }

    /// Label of one job (empty line when unlabeled).
    pub fn get_label(&self, client: ClientId, sel: JobSelector, out: &mut Outbox) {
        let Some(id) = self.select_job(sel) else {
            out.refuse(client, selector_error(sel, "shown"));
            return;
        };
        if let Some(job) = self.table.get(id) {
            out.line(client, job.label.clone().unwrap_or_default());
        }
    }

    /// Command string of one job.
    pub fn get_command(&self, client: ClientId, sel: JobSelector, out: &mut Outbox) {
        let Some(id) = self.select_job(sel) else {
            out.refuse(client, selector_error(sel, "shown"));
            return;
        };
        if let Some(job) = self.table.get(id) {
            out.line(client, job.shown_command().to_string());
        }
    }

    // ----- server lock -----------------------------------------------------

    /// Take the coarse server mutation lock.
    pub fn lock_server(&mut self, client: ClientId, uid: u32, out: &mut Outbox) {
        self.check_locker_expiry();
        if uid == 0 {
            self.locker = Locker::Root;
            self.locked_at = Instant::now();
            out.line(client, "server locked by root");
            return;
        }
        match self.locker {
            Locker::Unlocked => {
                if self.account.internal_uid(uid).is_some() {
                    self.locker = Locker::User(uid);
                    self.locked_at = Instant::now();
                    out.line(client, format!("server locked by {}", self.display_user(uid)));
                } else {
                    out.refuse(client, format!("uid {uid} is not in the user table"));
                }
            }
            Locker::User(holder) if holder == uid => {
                out.line(client, format!("server already locked by {}", self.display_user(uid)));
            }
            _ => {
                out.refuse(client, format!("server cannot be locked by {}", self.display_user(uid)));
            }
        }
    }

    /// Release the server lock.
    pub fn unlock_server(&mut self, client: ClientId, uid: u32, out: &mut Outbox) {
        self.check_locker_expiry();
        match self.locker {
            _ if uid == 0 => {
                self.locker = Locker::Unlocked;
                out.line(client, "server unlocked by root");
            }
            Locker::User(holder) if holder == uid => {
                self.locker = Locker::Unlocked;
                out.line(client, format!("server unlocked by {}", self.display_user(uid)));
            }
            Locker::Unlocked => out.line(client, "server is not locked"),
            _ => {
                out.refuse(client, format!("server cannot be unlocked by {}", self.display_user(uid)));
            }
        }
    }

    /// Expire a non-root lock 30 s after it was taken. Root locks persist
    /// until an explicit unlock.
    pub fn check_locker_expiry(&mut self) {
        if let Locker::User(_) = self.locker {
            if self.locked_at.elapsed() > LOCK_EXPIRY {
                self.locker = Locker::Unlocked;
            }
        }
    }

    fn refuse_if_locked(&mut self, client: ClientId, uid: u32, out: &mut Outbox) -> bool {
        self.check_locker_expiry();
        let holder = match self.locker {
            Locker::Unlocked => return false,
            Locker::Root => {
                if uid == 0 {
                    return false;
                }
                "root".to_string()
            }
            Locker::User(holder) => {
                if uid == holder || uid == 0 {
                    return false;
                }
                self.display_user(holder)
            }
        };
        out.refuse(client, format!("the server is locked by {holder}"));
        true
    }

    // ----- config knobs ----------------------------------------------------

    /// Change the global slot bound. Shrinking may leave `busy_slots` above
    /// the bound; new dispatch is refused until jobs finish.
    pub fn set_max_slots(&mut self, client: ClientId, uid: u32, n: i32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        if n <= 0 {
            out.refuse(client, format!("max slots must be positive, got {n}"));
            return;
        }
        self.account.set_max_slots(n);
        out.line(client, format!("max slots set to {n}"));
        self.schedule(out);
    }

    /// Re-read the user table file.
    pub fn refresh_users(&mut self, client: ClientId, uid: u32, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let Some(path) = self.cfg.users_path.clone() else {
            out.refuse(client, "no user file configured");
            return;
        };
        match spoolq_core::users::load_user_file(&path) {
            Ok(Some(file)) => {
                self.account.refresh(&file);
                out.line(client, "user table refreshed");
                self.schedule(out);
            }
            Ok(None) => out.refuse(client, format!("user file {} not found", path.display())),
            Err(err) => out.refuse(client, format!("cannot read user file: {err:#}")),
        }
    }

    fn get_env(&self, client: ClientId, name: &str, out: &mut Outbox) {
        let value = self
            .env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok());
        out.send(client, Reply::EnvValue(value));
    }

    fn set_env(&mut self, client: ClientId, uid: u32, assignment: &str, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        let Some((name, value)) = assignment.split_once('=') else {
            out.refuse(client, format!("expected NAME=value, got {assignment:?}"));
            return;
        };
        self.env.insert(name.to_string(), value.to_string());
        out.line(client, format!("{name} set"));
    }

    fn unset_env(&mut self, client: ClientId, uid: u32, name: &str, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        self.env.remove(name);
        out.line(client, format!("{name} unset"));
    }

    fn set_logdir(&mut self, client: ClientId, uid: u32, path: PathBuf, out: &mut Outbox) {
        if self.refuse_if_locked(client, uid, out) {
            return;
        }
        self.logdir = path;
        out.line(client, format!("logdir set to {}", self.logdir.display()));
    }

    // ----- connection lifecycle -------------------------------------------

    /// A connection dropped: forget its waits and reap the jobs it was
    /// running, so nothing dangles.
    pub fn client_gone(&mut self, client: ClientId, out: &mut Outbox) {
        self.notify.retain(|(c, _)| *c != client);
        let ids: Vec<u64> = self
            .table
            .active_jobs()
            .filter(|j| j.runner == Some(client) && !j.state.is_terminal())
            .map(|j| j.id)
            .collect();
        for id in ids {
            let result = JobResult {
                errorlevel: -1,
                ..JobResult::default()
            };
            self.finish_job(id, result, out);
        }
        self.schedule(out);
    }

    // ----- recovery --------------------------------------------------------

    /// Rebuild the tables from the store. Returns the runners the server
    /// must respawn: relink runners for surviving pids, fresh runners for
    /// jobs that never started.
    pub fn recover(&mut self) -> Vec<Respawn> {
        let mut respawns = Vec::new();
        let mut max_id = 0u64;

        for id in self.store.read_all_ids_in_table(Table::Jobs) {
            let Some(mut job) = self.store.read_by_id(Table::Jobs, id) else {
                continue;
            };
            max_id = max_id.max(id);
            job.runner = None;
            job.num_allocated = 0;
            job.cores.clear();

            match job.state {
                JobState::Running | JobState::Paused | JobState::Relink | JobState::Delink => {
                    let pid = job.pid;
                    let owner_alive = pid > 0
                        && self.procs.is_alive(pid)
                        && self.procs.owner_uid(pid) == Some(job.owner_uid);
                    if owner_alive {
                        job.state = JobState::Delink;
                        self.table.insert_active(job);
                        self.store_op(|s| s.set_state(Table::Jobs, id, JobState::Delink));
                        respawns.push(Respawn {
                            jobid: id,
                            mode: RespawnMode::Relink { pid },
                        });
                    } else {
                        self.store_op(|s| s.delete(Table::Jobs, id));
                    }
                }
                JobState::Queued | JobState::Wait | JobState::HoldingClient => {
                    job.pid = 0;
                    job.state = JobState::Wait;
                    self.table.insert_active(job);
                    self.store_op(|s| s.set_state(Table::Jobs, id, JobState::Wait));
                    respawns.push(Respawn {
                        jobid: id,
                        mode: RespawnMode::Fresh,
                    });
                }
                JobState::Locked => {
                    job.pid = 0;
                    self.table.insert_active(job);
                    respawns.push(Respawn {
                        jobid: id,
                        mode: RespawnMode::Fresh,
                    });
                }
                JobState::Finished | JobState::Skipped => {
                    self.store_op(|s| s.delete(Table::Jobs, id));
                }
            }
        }

        let mut finished_ids = self.store.read_all_ids_in_table(Table::Finished);
        finished_ids.sort_unstable();
        for id in finished_ids {
            if let Some(mut job) = self.store.read_by_id(Table::Finished, id) {
                max_id = max_id.max(id);
                job.runner = None;
                self.table.push_finished_restored(job);
            }
        }

        self.next_jobid = self.next_jobid.max(max_id + 1);
        respawns
    }

    // ----- helpers / inspection -------------------------------------------

    fn select_job(&self, sel: JobSelector) -> Option<u64> {
        match sel {
            JobSelector::Id(id) => self.table.get(id).map(|j| j.id),
            JobSelector::Last => self.table.last_added(),
        }
    }

    fn display_user(&self, uid: u32) -> String {
        match self.account.internal_uid(uid) {
            Some(u) => self.account.user(u).name.clone(),
            None if uid == 0 => "root".to_string(),
            None => format!("uid{uid}"),
        }
    }

    fn store_op(&mut self, op: impl FnOnce(&mut dyn JobStore) -> Result<(), StoreError>) {
        if let Err(err) = op(self.store.as_mut()) {
            tracing::warn!("persistence failure (state kept in memory): {err}");
        }
    }

    /// Global busy-slot count.
    pub fn busy_slots(&self) -> i32 {
        self.account.busy_slots()
    }

    /// Global slot bound.
    pub fn max_slots(&self) -> i32 {
        self.account.max_slots()
    }

    /// One job, from either list.
    pub fn job(&self, id: u64) -> Option<&Job> {
        self.table.get(id)
    }

    /// State of one job.
    pub fn job_state(&self, id: u64) -> Option<JobState> {
        self.table.get(id).map(|j| j.state)
    }

    /// Active list, in dispatch order.
    pub fn active_ids(&self) -> Vec<u64> {
        self.table.active_ids().to_vec()
    }

    /// Finished list, oldest first.
    pub fn finished_ids(&self) -> Vec<u64> {
        self.table.finished_ids().collect()
    }

    /// Busy slots charged to a real uid.
    pub fn user_busy(&self, uid: u32) -> Option<i32> {
        self.account.internal_uid(uid).map(|u| self.account.user(u).busy)
    }

    /// Queued-job count of a real uid.
    pub fn user_queued(&self, uid: u32) -> Option<i32> {
        self.account.internal_uid(uid).map(|u| self.account.user(u).queued)
    }

    /// Highest id handed out so far.
    pub fn last_allocated_id(&self) -> u64 {
        self.next_jobid - 1
    }

    /// Panic with a diagnostic if any cross-component invariant is broken.
    /// Test harnesses call this after every step.
    pub fn assert_invariants(&self) {
        let mut busy = 0i32;
        let mut per_user: HashMap<u32, i32> = HashMap::new();
        let mut queued: HashMap<u32, i32> = HashMap::new();

        for job in self.table.active_jobs() {
            busy += job.num_allocated as i32;
            *per_user.entry(job.owner_uid).or_default() += job.num_allocated as i32;
            if job.state == JobState::Queued {
                *queued.entry(job.owner_uid).or_default() += 1;
            }
            assert_eq!(
                job.num_allocated > 0,
                job.state == JobState::Running,
                "job {}: allocation {} does not match state {}",
                job.id,
                job.num_allocated,
                job.state
            );
            for &dep in &job.depend_on {
                assert!(dep < job.id, "job {}: parent {dep} is not older", job.id);
            }
        }
        assert_eq!(busy, self.account.busy_slots(), "busy_slots out of sync");

        for u in 0..self.account.user_count() {
            let ua = self.account.user(u);
            assert_eq!(
                per_user.get(&ua.uid).copied().unwrap_or(0),
                ua.busy,
                "user {} busy out of sync",
                ua.name
            );
            assert_eq!(
                queued.get(&ua.uid).copied().unwrap_or(0),
                ua.queued,
                "user {} queued count out of sync",
                ua.name
            );
        }

        assert!(
            self.table.finished_ids().count() <= self.cfg.max_finished,
            "finished list over capacity"
        );
        for job in self.table.finished_jobs() {
            match job.state {
                JobState::Skipped => {
                    assert!(job.result.is_some_and(|r| r.skipped), "skipped job {} lacks the flag", job.id);
                }
                JobState::Finished => {
                    assert!(job.result.is_none_or(|r| !r.skipped), "finished job {} marked skipped", job.id);
                }
                other => panic!("job {} in finished list with state {other}", job.id),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_lock(&mut self, by: Duration) {
        self.locked_at = Instant::now().checked_sub(by).unwrap_or_else(Instant::now);
    }
}

fn may_act(uid: u32, job: &Job) -> bool {
    uid == 0 || job.owner_uid == uid
}

fn selector_error(sel: JobSelector, verb: &str) -> String {
    match sel {
        JobSelector::Last => format!("the last job cannot be {verb}"),
        JobSelector::Id(id) => format!("job {id} cannot be {verb}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemStore;
    use crate::procs::testprocs::FakeProcs;
    use spoolq_core::users::{UserEntry, UserFile};

    fn users() -> UserFile {
        UserFile {
            users: vec![
                UserEntry { name: "ana".into(), uid: 1001, max_slots: 4 },
                UserEntry { name: "bo".into(), uid: 1002, max_slots: 4 },
            ],
            ..UserFile::default()
        }
    }

    fn engine(max_slots: i32) -> Engine {
        Engine::new(
            EngineConfig {
                max_slots,
                sched_seed: Some(5),
                ..EngineConfig::default()
            },
            &users(),
            Box::new(MemStore::new()),
            Box::new(FakeProcs::default()),
        )
    }

    fn submit(engine: &mut Engine, client: u64, uid: u32, command: &str) -> u64 {
        let mut out = Outbox::new();
        engine.submit(
            ClientId(client),
            uid,
            NewJob {
                num_slots: 1,
                command: command.into(),
                should_keep_finished: true,
                ..NewJob::default()
            },
            &mut out,
        );
        engine.last_allocated_id()
    }

    #[test]
    fn non_root_lock_expires_after_thirty_seconds() {
        let mut e = engine(2);
        let mut out = Outbox::new();

        e.lock_server(ClientId(1), 1001, &mut out);
        out.drain();
        e.submit(ClientId(2), 1002, NewJob { num_slots: 1, command: "true".into(), ..NewJob::default() }, &mut out);
        assert!(out.drain().iter().any(|(_, r)| matches!(r, Reply::Error(_))));

        e.backdate_lock(Duration::from_secs(31));
        e.check_locker_expiry();
        e.submit(ClientId(3), 1002, NewJob { num_slots: 1, command: "true".into(), ..NewJob::default() }, &mut out);
        assert!(out.drain().iter().any(|(_, r)| matches!(r, Reply::NewJobOk { .. })));
    }

    #[test]
    fn root_lock_only_yields_to_unlock() {
        let mut e = engine(2);
        let mut out = Outbox::new();

        e.lock_server(ClientId(1), 0, &mut out);
        e.backdate_lock(Duration::from_secs(3600));
        e.check_locker_expiry();
        out.drain();
        e.submit(ClientId(2), 1001, NewJob { num_slots: 1, command: "true".into(), ..NewJob::default() }, &mut out);
        assert!(out.drain().iter().any(|(_, r)| matches!(r, Reply::Error(_))));

        e.unlock_server(ClientId(1), 0, &mut out);
        out.drain();
        e.submit(ClientId(3), 1001, NewJob { num_slots: 1, command: "true".into(), ..NewJob::default() }, &mut out);
        assert!(out.drain().iter().any(|(_, r)| matches!(r, Reply::NewJobOk { .. })));
    }

    #[test]
    fn explicit_dependency_on_a_vanished_parent_counts_as_failure() {
        let mut e = engine(1);
        let running = submit(&mut e, 1, 1001, "sleep 60");

        let mut out = Outbox::new();
        e.submit(
            ClientId(2),
            1001,
            NewJob {
                num_slots: 1,
                command: "echo dep".into(),
                depend_on: vec![900, running as i64],
                ..NewJob::default()
            },
            &mut out,
        );
        let id = e.last_allocated_id();
        let job = e.job(id).unwrap();
        assert_eq!(job.depend_on, vec![900, running]);
        assert_eq!(job.dependency_errorlevel, 1);
        assert_eq!(
            e.job(running).unwrap().notify_errorlevel_to,
            vec![id]
        );
    }

    #[test]
    fn end_job_for_an_unknown_id_is_fatal() {
        let mut e = engine(1);
        let mut out = Outbox::new();
        let err = e.end_job(4242, JobResult::default(), &mut out);
        assert!(matches!(err, Err(EngineError::Corrupt(_))));
    }

    #[test]
    fn trimming_max_slots_pauses_dispatch_without_breaking_accounts() {
        let mut e = engine(4);
        let mut out = Outbox::new();

        let a = submit(&mut e, 1, 1001, "sleep 60");
        let b = submit(&mut e, 2, 1001, "sleep 60");
        e.runjob_ok(a, None, 5001).unwrap();
        e.runjob_ok(b, None, 5002).unwrap();
        assert_eq!(e.busy_slots(), 2);

        e.set_max_slots(ClientId(3), 0, 1, &mut out);
        assert_eq!(e.max_slots(), 1);
        assert_eq!(e.busy_slots(), 2, "running jobs keep their charge");

        // Nothing new dispatches while over the bound.
        let c = submit(&mut e, 4, 1001, "echo later");
        assert_eq!(e.job_state(c), Some(JobState::Queued));

        e.end_job(a, JobResult::default(), &mut out).unwrap();
        assert_eq!(e.job_state(c), Some(JobState::Queued), "still one over");
        e.end_job(b, JobResult::default(), &mut out).unwrap();
        assert_eq!(e.job_state(c), Some(JobState::Running));
        e.assert_invariants();
    }
}
