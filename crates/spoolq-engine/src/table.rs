//! The job table: one id-indexed slab plus the two orderings the server
//! reasons about, the active list (submission order, modulo urgent/swap)
//! and the bounded finished list (oldest first).

use std::collections::{BTreeMap, VecDeque};

use crate::job::Job;

use spoolq_core::protocol::JobState;

#[derive(Debug, Default)]
pub(crate) struct JobTable {
    jobs: BTreeMap<u64, Job>,
    active: Vec<u64>,
    finished: VecDeque<u64>,
}

impl JobTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub(crate) fn contains_active(&self, id: u64) -> bool {
        self.active.contains(&id)
    }

    pub(crate) fn count_active(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn active_ids(&self) -> &[u64] {
        &self.active
    }

    pub(crate) fn finished_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.finished.iter().copied()
    }

    pub(crate) fn active_jobs(&self) -> impl Iterator<Item = &Job> {
        self.active.iter().filter_map(|id| self.jobs.get(id))
    }

    pub(crate) fn finished_jobs(&self) -> impl Iterator<Item = &Job> {
        self.finished.iter().filter_map(|id| self.jobs.get(id))
    }

    pub(crate) fn find_holding_client(&self) -> Option<u64> {
        self.active_jobs()
            .find(|j| j.state == JobState::HoldingClient)
            .map(|j| j.id)
    }

    /// Most recently added job: tail of the active list, else the newest
    /// finished job.
    pub(crate) fn last_added(&self) -> Option<u64> {
        self.active.last().copied().or_else(|| self.finished.back().copied())
    }

    /// Largest id in the active list.
    pub(crate) fn last_in_queue_by_id(&self) -> Option<u64> {
        self.active.iter().copied().max()
    }

    /// Largest id in the finished list.
    pub(crate) fn last_finished_by_id(&self) -> Option<u64> {
        self.finished.iter().copied().max()
    }

    pub(crate) fn insert_active(&mut self, job: Job) {
        let id = job.id;
        debug_assert!(!self.jobs.contains_key(&id), "duplicate job id {id}");
        self.jobs.insert(id, job);
        self.active.push(id);
    }

    /// Restore a finished job during recovery (appended in call order).
    pub(crate) fn push_finished_restored(&mut self, job: Job) {
        let id = job.id;
        self.jobs.insert(id, job);
        self.finished.push_back(id);
    }

    /// Move `id` from the active list to the tail of the finished list,
    /// evicting from the head while over `max_finished`. Returns the evicted
    /// ids so the caller can mirror the deletions.
    pub(crate) fn archive(&mut self, id: u64, max_finished: usize) -> Vec<u64> {
        let mut evicted = Vec::new();
        if let Some(pos) = self.active.iter().position(|&a| a == id) {
            self.active.remove(pos);
            while self.finished.len() + 1 > max_finished.max(1) {
                match self.finished.pop_front() {
                    Some(old) => {
                        self.jobs.remove(&old);
                        evicted.push(old);
                    }
                    None => break,
                }
            }
            self.finished.push_back(id);
        }
        evicted
    }

    /// Unlink and destroy from whichever list contains the id.
    pub(crate) fn remove(&mut self, id: u64) -> Option<Job> {
        if let Some(pos) = self.active.iter().position(|&a| a == id) {
            self.active.remove(pos);
        } else if let Some(pos) = self.finished.iter().position(|&f| f == id) {
            self.finished.remove(pos);
        }
        self.jobs.remove(&id)
    }

    pub(crate) fn move_top(&mut self, id: u64) -> bool {
        match self.active.iter().position(|&a| a == id) {
            Some(pos) => {
                self.active.remove(pos);
                self.active.insert(0, id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn swap(&mut self, a: u64, b: u64) -> bool {
        let pa = self.active.iter().position(|&x| x == a);
        let pb = self.active.iter().position(|&x| x == b);
        match (pa, pb) {
            (Some(pa), Some(pb)) => {
                self.active.swap(pa, pb);
                true
            }
            _ => false,
        }
    }
}
