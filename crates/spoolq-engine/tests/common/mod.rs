//! Shared harness: an engine over an in-memory store and a scripted process
//! table, plus helpers that play the runner's part of the protocol.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use spoolq_core::protocol::{JobResult, NewJob, Reply};
use spoolq_core::users::{UserEntry, UserFile};
use spoolq_engine::{
    ClientId, Engine, EngineConfig, JobStore, MemStore, Outbox, ProcessOps, Signal,
};

#[derive(Default)]
pub struct ProcState {
    pub alive: HashSet<i32>,
    pub stopped: HashSet<i32>,
    pub owners: HashMap<i32, u32>,
    pub refuse_stop: HashSet<i32>,
    pub signals: Vec<(i32, Signal)>,
}

/// Scripted process table shared between the test and the engine.
#[derive(Clone, Default)]
pub struct ScriptedProcs(pub Arc<Mutex<ProcState>>);

impl ScriptedProcs {
    pub fn spawn(&self, pid: i32, uid: u32) {
        let mut st = self.0.lock().unwrap();
        st.alive.insert(pid);
        st.owners.insert(pid, uid);
    }

    pub fn reap(&self, pid: i32) {
        let mut st = self.0.lock().unwrap();
        st.alive.remove(&pid);
        st.stopped.remove(&pid);
    }

    pub fn stop_by_hand(&self, pid: i32) {
        self.0.lock().unwrap().stopped.insert(pid);
    }

    pub fn refuse_stop(&self, pid: i32) {
        self.0.lock().unwrap().refuse_stop.insert(pid);
    }
}

impl ProcessOps for ScriptedProcs {
    fn kill(&self, pid: i32, sig: Signal) -> std::io::Result<()> {
        self.kill_tree(pid, sig);
        Ok(())
    }

    fn kill_tree(&self, pid: i32, sig: Signal) {
        let mut st = self.0.lock().unwrap();
        st.signals.push((pid, sig));
        match sig {
            Signal::Stop => {
                if !st.refuse_stop.contains(&pid) {
                    st.stopped.insert(pid);
                }
            }
            Signal::Cont => {
                st.stopped.remove(&pid);
            }
            Signal::Term => {
                st.alive.remove(&pid);
            }
        }
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.0.lock().unwrap().alive.contains(&pid)
    }

    fn is_stopped(&self, pid: i32) -> bool {
        self.0.lock().unwrap().stopped.contains(&pid)
    }

    fn owner_uid(&self, pid: i32) -> Option<u32> {
        self.0.lock().unwrap().owners.get(&pid).copied()
    }

    fn stdout_path(&self, pid: i32) -> Option<PathBuf> {
        if self.is_alive(pid) {
            Some(PathBuf::from(format!("/proc/{pid}/out")))
        } else {
            None
        }
    }
}

pub fn user_file(entries: &[(&str, u32, i32)]) -> UserFile {
    UserFile {
        users: entries
            .iter()
            .map(|&(name, uid, max_slots)| UserEntry {
                name: name.to_string(),
                uid,
                max_slots,
            })
            .collect(),
        ..UserFile::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub out: Outbox,
    pub procs: ScriptedProcs,
    next_client: u64,
}

impl Harness {
    pub fn new(max_slots: i32, users: &[(&str, u32, i32)]) -> Self {
        Self::with_config(
            EngineConfig {
                max_slots,
                sched_seed: Some(42),
                ..EngineConfig::default()
            },
            users,
            Box::new(MemStore::new()),
        )
    }

    pub fn with_config(
        cfg: EngineConfig,
        users: &[(&str, u32, i32)],
        store: Box<dyn JobStore>,
    ) -> Self {
        let procs = ScriptedProcs::default();
        let engine = Engine::new(cfg, &user_file(users), store, Box::new(procs.clone()));
        Self {
            engine,
            out: Outbox::new(),
            procs,
            next_client: 0,
        }
    }

    pub fn client(&mut self) -> ClientId {
        self.next_client += 1;
        ClientId(self.next_client)
    }

    /// Submit a command; returns (runner connection, allocated id if the
    /// reply came back immediately).
    pub fn submit(&mut self, uid: u32, msg: NewJob) -> (ClientId, Option<u64>) {
        let client = self.client();
        self.engine.submit(client, uid, msg, &mut self.out);
        let jobid = self.out.messages().iter().find_map(|(to, reply)| match reply {
            Reply::NewJobOk { jobid } if *to == client => Some(*jobid),
            _ => None,
        });
        self.engine.assert_invariants();
        (client, jobid)
    }

    pub fn simple_job(command: &str) -> NewJob {
        NewJob {
            num_slots: 1,
            store_output: false,
            should_keep_finished: true,
            command: command.to_string(),
            ..NewJob::default()
        }
    }

    /// Dispatch orders sent since the last drain: (runner, jobid,
    /// dependency_errorlevel).
    pub fn run_orders(&mut self) -> Vec<(ClientId, u64, i32)> {
        self.out
            .drain()
            .into_iter()
            .filter_map(|(to, reply)| match reply {
                Reply::RunJob { jobid, dependency_errorlevel, .. } => {
                    Some((to, jobid, dependency_errorlevel))
                }
                _ => None,
            })
            .collect()
    }

    /// Play the runner's spawn callback.
    pub fn start(&mut self, jobid: u64, pid: i32) {
        let uid = self.engine.job(jobid).map(|j| j.owner_uid).unwrap_or(0);
        self.procs.spawn(pid, uid);
        self.engine
            .runjob_ok(jobid, Some(PathBuf::from(format!("/tmp/out-{jobid}"))), pid)
            .expect("runjob_ok");
        self.engine.assert_invariants();
    }

    /// Play the runner's completion callback.
    pub fn finish(&mut self, jobid: u64, errorlevel: i32) {
        if let Some(pid) = self.engine.job(jobid).map(|j| j.pid) {
            self.procs.reap(pid);
        }
        let result = JobResult {
            errorlevel,
            real_ms: 5,
            ..JobResult::default()
        };
        self.engine.end_job(jobid, result, &mut self.out).expect("end_job");
        self.engine.assert_invariants();
    }

    /// Play a runner that skips its command for a failed dependency.
    pub fn skip(&mut self, jobid: u64, dependency_errorlevel: i32) {
        let result = JobResult {
            errorlevel: dependency_errorlevel,
            skipped: true,
            ..JobResult::default()
        };
        self.engine.end_job(jobid, result, &mut self.out).expect("end_job");
        self.engine.assert_invariants();
    }
}
