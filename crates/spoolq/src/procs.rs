//! Real [`ProcessOps`]: signals through libc, probes through procfs.

use std::io;
use std::path::{Path, PathBuf};

use spoolq_engine::{ProcessOps, Signal};

pub struct ProcfsOps;

fn signo(sig: Signal) -> i32 {
    match sig {
        Signal::Stop => libc::SIGSTOP,
        Signal::Cont => libc::SIGCONT,
        Signal::Term => libc::SIGTERM,
    }
}

/// Procfs state character: field 3 of `/proc/<pid>/stat`, right after the
/// parenthesized comm (which itself may contain spaces and parens).
fn stat_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    stat.rsplit_once(')')?.1.trim_start().chars().next()
}

/// Pids reachable through `/proc/<pid>/task/*/children`, recursively.
fn collect_descendants(pid: i32, acc: &mut Vec<i32>) {
    let task_dir = format!("/proc/{pid}/task");
    let Ok(entries) = std::fs::read_dir(task_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(children) = std::fs::read_to_string(entry.path().join("children")) else {
            continue;
        };
        for child in children.split_whitespace().filter_map(|c| c.parse::<i32>().ok()) {
            if !acc.contains(&child) {
                acc.push(child);
                collect_descendants(child, acc);
            }
        }
    }
}

impl ProcessOps for ProcfsOps {
    fn kill(&self, pid: i32, sig: Signal) -> io::Result<()> {
        if pid <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad pid"));
        }
        let rc = unsafe { libc::kill(pid, signo(sig)) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn kill_tree(&self, pid: i32, sig: Signal) {
        // Parent first, so a stopping tree cannot spawn replacements while
        // we walk it.
        let mut pids = vec![pid];
        collect_descendants(pid, &mut pids);
        for p in pids {
            let _ = self.kill(p, sig);
        }
    }

    fn is_alive(&self, pid: i32) -> bool {
        pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
    }

    fn is_stopped(&self, pid: i32) -> bool {
        matches!(stat_state(pid), Some('T') | Some('t'))
    }

    fn owner_uid(&self, pid: i32) -> Option<u32> {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(format!("/proc/{pid}")).ok().map(|m| m.uid())
    }

    fn stdout_path(&self, pid: i32) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/{pid}/fd/1")).ok()
    }
}

/// CPU time spent in reaped children so far, in milliseconds (user, system).
pub fn children_cpu_ms() -> (u64, u64) {
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) != 0 {
            return (0, 0);
        }
        let user = usage.ru_utime.tv_sec as u64 * 1000 + usage.ru_utime.tv_usec as u64 / 1000;
        let system = usage.ru_stime.tv_sec as u64 * 1000 + usage.ru_stime.tv_usec as u64 / 1000;
        (user, system)
    }
}
