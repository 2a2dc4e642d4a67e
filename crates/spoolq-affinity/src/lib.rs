#![deny(unreachable_pub)]

//! CPU-core bookkeeping for pinned jobs: a bank of per-core holds plus the
//! `sched_setaffinity` binding applied to dispatched pids.

use std::io;

/// Tracks which CPU cores are held by which job.
#[derive(Debug)]
pub struct CoreBank {
    holds: Vec<Option<u64>>,
}

impl CoreBank {
    /// A bank over cores `0..ncores`, all free.
    pub fn new(ncores: usize) -> Self {
        Self {
            holds: vec![None; ncores],
        }
    }

    /// Number of cores currently unheld.
    pub fn free_count(&self) -> usize {
        self.holds.iter().filter(|h| h.is_none()).count()
    }

    /// Reserve `n` free cores for `jobid`. Returns the core indices, or
    /// `None` without reserving anything when fewer than `n` are free.
    pub fn lock_cores(&mut self, jobid: u64, n: usize) -> Option<Vec<u32>> {
        if self.free_count() < n {
            return None;
        }
        let mut cores = Vec::with_capacity(n);
        for (idx, hold) in self.holds.iter_mut().enumerate() {
            if cores.len() == n {
                break;
            }
            if hold.is_none() {
                *hold = Some(jobid);
                cores.push(idx as u32);
            }
        }
        Some(cores)
    }

    /// Release every core held by `jobid`; returns how many were released.
    pub fn unlock_cores(&mut self, jobid: u64) -> usize {
        let mut released = 0;
        for hold in &mut self.holds {
            if *hold == Some(jobid) {
                *hold = None;
                released += 1;
            }
        }
        released
    }
}

/// Pin `pid` (and its future children) to the given cores.
pub fn set_task_cores(pid: i32, cores: &[u32]) -> io::Result<()> {
    if cores.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty core set"));
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &core in cores {
            libc::CPU_SET(core as usize, &mut set);
        }
        if libc::sched_setaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_lock_unlock() {
        let mut bank = CoreBank::new(4);
        assert_eq!(bank.free_count(), 4);

        let a = bank.lock_cores(1001, 3).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(bank.free_count(), 1);

        // Not enough cores left; nothing must be reserved.
        assert!(bank.lock_cores(1002, 2).is_none());
        assert_eq!(bank.free_count(), 1);

        assert_eq!(bank.unlock_cores(1001), 3);
        assert_eq!(bank.free_count(), 4);
        assert_eq!(bank.unlock_cores(1001), 0);
    }
}
