//! Process-control seam: signal delivery and procfs probes. The real
//! implementation lives in the binary crate (it needs libc); the engine only
//! ever calls through this trait, so tests can script process behavior.

use std::path::PathBuf;
use std::time::Duration;

/// Signals the engine ever sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGSTOP.
    Stop,
    /// SIGCONT.
    Cont,
    /// SIGTERM.
    Term,
}

/// Signal delivery and procfs probes for one host.
pub trait ProcessOps {
    /// Deliver `sig` to `pid`.
    fn kill(&self, pid: i32, sig: Signal) -> std::io::Result<()>;

    /// Deliver `sig` to `pid` and all of its descendants.
    fn kill_tree(&self, pid: i32, sig: Signal);

    /// Whether the pid exists.
    fn is_alive(&self, pid: i32) -> bool;

    /// Whether the pid is in the stopped (`T`) procfs state.
    fn is_stopped(&self, pid: i32) -> bool;

    /// Real uid owning the pid.
    fn owner_uid(&self, pid: i32) -> Option<u32>;

    /// Resolution of the pid's fd 1, for relink output back-fill.
    fn stdout_path(&self, pid: i32) -> Option<PathBuf>;
}

/// Outcome of [`safe_pause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// The process tree was observed stopped; slots may be released.
    Paused,
    /// The process would not stop within the window; SIGCONT was sent to
    /// undo the partial stop and the job must stay RUNNING.
    StillRunning,
}

const PAUSE_PROBES: u32 = 20;
const PAUSE_PROBE_DELAY: Duration = Duration::from_millis(5);

/// Stop `pid` and its descendants, then verify the stop took. Never lies:
/// if the process is still runnable after the probe window the stop is
/// rolled back with SIGCONT and the caller is told so.
pub(crate) fn safe_pause(procs: &dyn ProcessOps, pid: i32) -> PauseOutcome {
    procs.kill_tree(pid, Signal::Stop);
    for probe in 0..PAUSE_PROBES {
        if !procs.is_alive(pid) || procs.is_stopped(pid) {
            return PauseOutcome::Paused;
        }
        if probe + 1 < PAUSE_PROBES {
            std::thread::sleep(PAUSE_PROBE_DELAY);
        }
    }
    procs.kill_tree(pid, Signal::Cont);
    PauseOutcome::StillRunning
}

#[cfg(test)]
pub(crate) mod testprocs {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    /// Scripted process table for unit tests: records every signal and
    /// answers probes from two mutable sets.
    #[derive(Debug, Default)]
    pub(crate) struct FakeProcs {
        pub(crate) alive: RefCell<HashSet<i32>>,
        pub(crate) stopped: RefCell<HashSet<i32>>,
        pub(crate) owners: RefCell<HashMap<i32, u32>>,
        pub(crate) signals: RefCell<Vec<(i32, Signal)>>,
        /// When set, a Stop is absorbed without the pid ever stopping.
        pub(crate) ignore_stop: RefCell<HashSet<i32>>,
    }

    impl FakeProcs {
        pub(crate) fn spawn(&self, pid: i32, uid: u32) {
            self.alive.borrow_mut().insert(pid);
            self.owners.borrow_mut().insert(pid, uid);
        }
    }

    impl ProcessOps for FakeProcs {
        fn kill(&self, pid: i32, sig: Signal) -> std::io::Result<()> {
            self.kill_tree(pid, sig);
            Ok(())
        }

        fn kill_tree(&self, pid: i32, sig: Signal) {
            self.signals.borrow_mut().push((pid, sig));
            match sig {
                Signal::Stop => {
                    if !self.ignore_stop.borrow().contains(&pid) {
                        self.stopped.borrow_mut().insert(pid);
                    }
                }
                Signal::Cont => {
                    self.stopped.borrow_mut().remove(&pid);
                }
                Signal::Term => {
                    self.alive.borrow_mut().remove(&pid);
                }
            }
        }

        fn is_alive(&self, pid: i32) -> bool {
            self.alive.borrow().contains(&pid)
        }

        fn is_stopped(&self, pid: i32) -> bool {
            self.stopped.borrow().contains(&pid)
        }

        fn owner_uid(&self, pid: i32) -> Option<u32> {
            self.owners.borrow().get(&pid).copied()
        }

        fn stdout_path(&self, pid: i32) -> Option<PathBuf> {
            if self.is_alive(pid) {
                Some(PathBuf::from(format!("/tmp/relinked-{pid}.out")))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testprocs::FakeProcs;
    use super::*;

    #[test]
    fn safe_pause_stops_and_verifies() {
        let procs = FakeProcs::default();
        procs.spawn(4242, 1000);
        assert_eq!(safe_pause(&procs, 4242), PauseOutcome::Paused);
        assert!(procs.is_stopped(4242));
    }

    #[test]
    fn safe_pause_rolls_back_when_stop_does_not_take() {
        let procs = FakeProcs::default();
        procs.spawn(4242, 1000);
        procs.ignore_stop.borrow_mut().insert(4242);

        assert_eq!(safe_pause(&procs, 4242), PauseOutcome::StillRunning);
        let signals = procs.signals.borrow();
        assert_eq!(signals.first(), Some(&(4242, Signal::Stop)));
        assert_eq!(signals.last(), Some(&(4242, Signal::Cont)));
    }
}
