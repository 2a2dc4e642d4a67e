//! Persistence adapter: a key/value-per-table store indexed by job id.
//!
//! The store is a best-effort mirror of the engine's structural state; the
//! engine never blocks on it and a failed write only costs recovery
//! fidelity, not correctness of the live queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use spoolq_core::protocol::JobState;

use crate::job::Job;

/// The two persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Open jobs (everything on the active list).
    Jobs,
    /// Terminal jobs retained for inspection.
    Finished,
}

/// Store failures. Surfaced to the engine, which logs and carries on.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem trouble.
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization trouble.
    #[error("store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Operations the engine mirrors onto disk.
pub trait JobStore {
    /// Add a record; replaces silently if the id is already present.
    fn insert(&mut self, table: Table, job: &Job) -> Result<(), StoreError>;
    /// Add or overwrite a record.
    fn insert_or_replace(&mut self, table: Table, job: &Job) -> Result<(), StoreError>;
    /// Drop a record; absent ids are fine.
    fn delete(&mut self, table: Table, id: u64) -> Result<(), StoreError>;
    /// Update just the state field of a record.
    fn set_state(&mut self, table: Table, id: u64, state: JobState) -> Result<(), StoreError>;
    /// Mirror of the active-list urgent move.
    fn move_top(&mut self, id: u64) -> Result<(), StoreError>;
    /// Mirror of the active-list swap.
    fn swap(&mut self, a: u64, b: u64) -> Result<(), StoreError>;
    /// All ids in a table: `Jobs` in active-list order, `Finished` by id.
    fn read_all_ids_in_table(&self, table: Table) -> Vec<u64>;
    /// One record.
    fn read_by_id(&self, table: Table, id: u64) -> Option<Job>;
}

/// In-memory store: the trait semantics without a file. Used by tests and
/// `--no-persist` servers.
#[derive(Debug, Default)]
pub struct MemStore {
    jobs: BTreeMap<u64, Job>,
    order: Vec<u64>,
    finished: BTreeMap<u64, Job>,
}

impl MemStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemStore {
    fn insert(&mut self, table: Table, job: &Job) -> Result<(), StoreError> {
        match table {
            Table::Jobs => {
                if self.jobs.insert(job.id, job.clone()).is_none() {
                    self.order.push(job.id);
                }
            }
            Table::Finished => {
                self.finished.insert(job.id, job.clone());
            }
        }
        Ok(())
    }

    fn insert_or_replace(&mut self, table: Table, job: &Job) -> Result<(), StoreError> {
        self.insert(table, job)
    }

    fn delete(&mut self, table: Table, id: u64) -> Result<(), StoreError> {
        match table {
            Table::Jobs => {
                self.jobs.remove(&id);
                self.order.retain(|&o| o != id);
            }
            Table::Finished => {
                self.finished.remove(&id);
            }
        }
        Ok(())
    }

    fn set_state(&mut self, table: Table, id: u64, state: JobState) -> Result<(), StoreError> {
        let slot = match table {
            Table::Jobs => self.jobs.get_mut(&id),
            Table::Finished => self.finished.get_mut(&id),
        };
        if let Some(job) = slot {
            job.state = state;
        }
        Ok(())
    }

    fn move_top(&mut self, id: u64) -> Result<(), StoreError> {
        if let Some(pos) = self.order.iter().position(|&o| o == id) {
            self.order.remove(pos);
            self.order.insert(0, id);
        }
        Ok(())
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<(), StoreError> {
        let pa = self.order.iter().position(|&o| o == a);
        let pb = self.order.iter().position(|&o| o == b);
        if let (Some(pa), Some(pb)) = (pa, pb) {
            self.order.swap(pa, pb);
        }
        Ok(())
    }

    fn read_all_ids_in_table(&self, table: Table) -> Vec<u64> {
        match table {
            Table::Jobs => self.order.clone(),
            Table::Finished => self.finished.keys().copied().collect(),
        }
    }

    fn read_by_id(&self, table: Table, id: u64) -> Option<Job> {
        match table {
            Table::Jobs => self.jobs.get(&id).cloned(),
            Table::Finished => self.finished.get(&id).cloned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    active_order: Vec<u64>,
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    finished: Vec<Job>,
}

/// File-backed store: one JSON state file rewritten with tmp-file + rename
/// on every structural change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    mem: MemStore,
}

impl FileStore {
    /// Open (or create) the state file at `path`.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let mut mem = MemStore::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: StateFile = serde_json::from_str(&raw)?;
            for job in file.finished {
                mem.finished.insert(job.id, job);
            }
            for job in file.jobs {
                mem.jobs.insert(job.id, job);
            }
            // Replay order: the persisted order vector, then any stray
            // records it does not mention, by id.
            let mut order: Vec<u64> = file
                .active_order
                .iter()
                .copied()
                .filter(|id| mem.jobs.contains_key(id))
                .collect();
            for &id in mem.jobs.keys() {
                if !order.contains(&id) {
                    order.push(id);
                }
            }
            mem.order = order;
        }
        Ok(Self { path, mem })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = StateFile {
            version: 1,
            active_order: self.mem.order.clone(),
            jobs: self.mem.jobs.values().cloned().collect(),
            finished: self.mem.finished.values().cloned().collect(),
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl JobStore for FileStore {
    fn insert(&mut self, table: Table, job: &Job) -> Result<(), StoreError> {
        self.mem.insert(table, job)?;
        self.persist()
    }

    fn insert_or_replace(&mut self, table: Table, job: &Job) -> Result<(), StoreError> {
        self.mem.insert_or_replace(table, job)?;
        self.persist()
    }

    fn delete(&mut self, table: Table, id: u64) -> Result<(), StoreError> {
        self.mem.delete(table, id)?;
        self.persist()
    }

    fn set_state(&mut self, table: Table, id: u64, state: JobState) -> Result<(), StoreError> {
        self.mem.set_state(table, id, state)?;
        self.persist()
    }

    fn move_top(&mut self, id: u64) -> Result<(), StoreError> {
        self.mem.move_top(id)?;
        self.persist()
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<(), StoreError> {
        self.mem.swap(a, b)?;
        self.persist()
    }

    fn read_all_ids_in_table(&self, table: Table) -> Vec<u64> {
        self.mem.read_all_ids_in_table(table)
    }

    fn read_by_id(&self, table: Table, id: u64) -> Option<Job> {
        self.mem.read_by_id(table, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolq_core::protocol::NewJob;

    fn job(id: u64) -> Job {
        Job::from_submission(
            id,
            1000,
            &NewJob {
                command: format!("sleep {id}"),
                num_slots: 1,
                ..NewJob::default()
            },
        )
    }

    #[test]
    fn mem_store_order_mirrors_reorders() {
        let mut s = MemStore::new();
        for id in [1000, 1001, 1002] {
            s.insert(Table::Jobs, &job(id)).unwrap();
        }
        s.move_top(1002).unwrap();
        s.swap(1000, 1001).unwrap();
        assert_eq!(s.read_all_ids_in_table(Table::Jobs), vec![1002, 1001, 1000]);

        s.delete(Table::Jobs, 1001).unwrap();
        assert_eq!(s.read_all_ids_in_table(Table::Jobs), vec![1002, 1000]);
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let mut s = FileStore::open(path.clone()).unwrap();
            s.insert(Table::Jobs, &job(1000)).unwrap();
            s.insert(Table::Jobs, &job(1001)).unwrap();
            s.insert(Table::Finished, &job(1002)).unwrap();
            s.move_top(1001).unwrap();
            s.set_state(Table::Jobs, 1000, JobState::Locked).unwrap();
        }

        let s = FileStore::open(path).unwrap();
        assert_eq!(s.read_all_ids_in_table(Table::Jobs), vec![1001, 1000]);
        assert_eq!(s.read_all_ids_in_table(Table::Finished), vec![1002]);
        assert_eq!(
            s.read_by_id(Table::Jobs, 1000).unwrap().state,
            JobState::Locked
        );
        assert!(s.read_by_id(Table::Finished, 1000).is_none());
    }
}
