//! Slot accounting: the global busy/max ledger plus the per-user ledgers the
//! scheduler consults. A negative per-user `max_slots` is the suspend flag;
//! the configured cap is its absolute value.

use spoolq_core::users::UserFile;

#[derive(Debug, Clone)]
pub(crate) struct UserAccount {
    pub(crate) name: String,
    pub(crate) uid: u32,
    pub(crate) max_slots: i32,
    pub(crate) busy: i32,
    pub(crate) queued: i32,
}

#[derive(Debug)]
pub(crate) struct ResourceAccount {
    users: Vec<UserAccount>,
    busy_slots: i32,
    max_slots: i32,
}

impl ResourceAccount {
    pub(crate) fn new(file: &UserFile, max_slots: i32) -> Self {
        let users = file
            .users
            .iter()
            .map(|u| UserAccount {
                name: u.name.clone(),
                uid: u.uid,
                max_slots: u.max_slots,
                busy: 0,
                queued: 0,
            })
            .collect();
        Self {
            users,
            busy_slots: 0,
            max_slots: max_slots.max(1),
        }
    }

    pub(crate) fn user_count(&self) -> usize {
        self.users.len()
    }

    pub(crate) fn user(&self, u: usize) -> &UserAccount {
        &self.users[u]
    }

    /// Translate a real uid to the internal index.
    pub(crate) fn internal_uid(&self, uid: u32) -> Option<usize> {
        self.users.iter().position(|u| u.uid == uid)
    }

    pub(crate) fn busy_slots(&self) -> i32 {
        self.busy_slots
    }

    pub(crate) fn max_slots(&self) -> i32 {
        self.max_slots
    }

    pub(crate) fn set_max_slots(&mut self, n: i32) {
        self.max_slots = n;
    }

    /// May be negative after a `set_max_slots` trim; dispatch is then
    /// refused until enough jobs finish.
    pub(crate) fn free_slots(&self) -> i32 {
        self.max_slots - self.busy_slots
    }

    pub(crate) fn charge(&mut self, u: usize, slots: u32) {
        self.busy_slots += slots as i32;
        self.users[u].busy += slots as i32;
    }

    pub(crate) fn release(&mut self, u: usize, slots: u32) {
        self.busy_slots -= slots as i32;
        self.users[u].busy -= slots as i32;
    }

    pub(crate) fn queued_inc(&mut self, u: usize) {
        self.users[u].queued += 1;
    }

    pub(crate) fn queued_dec(&mut self, u: usize) {
        self.users[u].queued -= 1;
    }

    /// Whether user `u` has headroom for `slots` more. False while the user
    /// is suspended.
    pub(crate) fn can_run(&self, u: usize, slots: u32) -> bool {
        !self.is_suspended(u) && self.users[u].max_slots - self.users[u].busy >= slots as i32
    }

    pub(crate) fn suspend(&mut self, u: usize) {
        self.users[u].max_slots = -self.users[u].max_slots.abs();
    }

    pub(crate) fn resume(&mut self, u: usize) {
        self.users[u].max_slots = self.users[u].max_slots.abs();
    }

    pub(crate) fn is_suspended(&self, u: usize) -> bool {
        self.users[u].max_slots < 0
    }

    /// Re-read the user table. Counters carry over by uid; users dropped
    /// from the file but still holding slots or queued jobs are kept as
    /// suspended entries until those drain.
    pub(crate) fn refresh(&mut self, file: &UserFile) {
        let old = std::mem::take(&mut self.users);
        self.users = file
            .users
            .iter()
            .map(|u| {
                let prev = old.iter().find(|o| o.uid == u.uid);
                UserAccount {
                    name: u.name.clone(),
                    uid: u.uid,
                    max_slots: u.max_slots,
                    busy: prev.map_or(0, |p| p.busy),
                    queued: prev.map_or(0, |p| p.queued),
                }
            })
            .collect();
        for o in old {
            if (o.busy > 0 || o.queued > 0) && self.internal_uid(o.uid).is_none() {
                self.users.push(UserAccount {
                    max_slots: -o.max_slots.abs(),
                    ..o
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolq_core::users::{UserEntry, UserFile};

    fn file(entries: &[(u32, i32)]) -> UserFile {
        UserFile {
            users: entries
                .iter()
                .map(|&(uid, max_slots)| UserEntry {
                    name: format!("u{uid}"),
                    uid,
                    max_slots,
                })
                .collect(),
            ..UserFile::default()
        }
    }

    #[test]
    fn charge_and_release() {
        let mut acct = ResourceAccount::new(&file(&[(1000, 2), (1001, 4)]), 4);
        let u = acct.internal_uid(1001).unwrap();

        assert!(acct.can_run(u, 4));
        acct.charge(u, 3);
        assert_eq!(acct.busy_slots(), 3);
        assert_eq!(acct.free_slots(), 1);
        assert!(!acct.can_run(u, 2));
        assert!(acct.can_run(u, 1));

        acct.release(u, 3);
        assert_eq!(acct.busy_slots(), 0);
        assert_eq!(acct.user(u).busy, 0);
    }

    #[test]
    fn suspend_flag_is_the_sign() {
        let mut acct = ResourceAccount::new(&file(&[(1000, 2)]), 4);
        acct.suspend(0);
        assert!(acct.is_suspended(0));
        assert!(!acct.can_run(0, 1));
        acct.resume(0);
        assert_eq!(acct.user(0).max_slots, 2);
        assert!(acct.can_run(0, 2));
    }

    #[test]
    fn refresh_keeps_draining_users() {
        let mut acct = ResourceAccount::new(&file(&[(1000, 2), (1001, 4)]), 8);
        let u = acct.internal_uid(1001).unwrap();
        acct.charge(u, 2);

        acct.refresh(&file(&[(1000, 3)]));
        assert_eq!(acct.user(0).max_slots, 3);

        let kept = acct.internal_uid(1001).unwrap();
        assert_eq!(acct.user(kept).busy, 2);
        assert!(acct.is_suspended(kept));
    }
}
