//! Dispatch selection. Relink re-attachment always wins; otherwise a random
//! rotation over users keeps multi-tenant dispatch starvation-free, and
//! within a user the active-list order (submission, modulo urgent/swap) is
//! respected.

use rand::Rng;
use rand::rngs::StdRng;

use spoolq_core::protocol::JobState;

use crate::account::ResourceAccount;
use crate::table::JobTable;

/// Id of the next job to dispatch, or `None` when nothing is runnable.
/// Pure selection: slot accounting happens in `configure_running`.
pub(crate) fn next_run_job(
    table: &JobTable,
    acct: &ResourceAccount,
    rng: &mut StdRng,
) -> Option<u64> {
    if let Some(j) = table.active_jobs().find(|j| j.state == JobState::Relink) {
        return Some(j.id);
    }

    let free = acct.free_slots();
    if free <= 0 {
        return None;
    }
    let user_number = acct.user_count();
    if user_number == 0 || table.count_active() == 0 {
        return None;
    }

    let u0 = rng.gen_range(0..user_number);
    for step in 1..=user_number {
        let u = (u0 + step) % user_number;
        if acct.user(u).queued == 0 {
            continue;
        }

        'jobs: for job in table.active_jobs() {
            if job.state != JobState::Queued {
                continue;
            }
            if acct.internal_uid(job.owner_uid) != Some(u) {
                continue;
            }
            for &dep in &job.depend_on {
                if let Some(parent) = table.get(dep) {
                    if !parent.state.is_terminal() {
                        continue 'jobs;
                    }
                }
            }
            if job.num_slots as i32 <= free && acct.can_run(u, job.num_slots) {
                return Some(job.id);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use spoolq_core::protocol::NewJob;
    use spoolq_core::users::{UserEntry, UserFile};

    use crate::job::Job;

    fn users(entries: &[(u32, i32)]) -> UserFile {
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

    fn queued(id: u64, uid: u32, slots: u32) -> Job {
        Job::from_submission(
            id,
            uid,
            &NewJob {
                command: "true".into(),
                num_slots: slots,
                ..NewJob::default()
            },
        )
    }

    fn setup(acct: &mut ResourceAccount, table: &mut JobTable, jobs: Vec<Job>) {
        for job in jobs {
            let u = acct.internal_uid(job.owner_uid).unwrap();
            acct.queued_inc(u);
            table.insert_active(job);
        }
    }

    #[test]
    fn respects_active_list_order_within_a_user() {
        let mut acct = ResourceAccount::new(&users(&[(1000, 4)]), 4);
        let mut table = JobTable::new();
        setup(
            &mut acct,
            &mut table,
            vec![queued(1000, 1000, 1), queued(1001, 1000, 1)],
        );
        table.move_top(1001);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_run_job(&table, &acct, &mut rng), Some(1001));
    }

    #[test]
    fn refuses_when_no_free_slots() {
        let mut acct = ResourceAccount::new(&users(&[(1000, 4)]), 1);
        let mut table = JobTable::new();
        setup(&mut acct, &mut table, vec![queued(1000, 1000, 1)]);
        acct.charge(0, 1);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_run_job(&table, &acct, &mut rng), None);
    }

    #[test]
    fn user_cap_blocks_before_global_cap() {
        // Global capacity 4, user cap 2, three one-slot jobs queued.
        let mut acct = ResourceAccount::new(&users(&[(1000, 2)]), 4);
        let mut table = JobTable::new();
        setup(
            &mut acct,
            &mut table,
            vec![queued(1000, 1000, 1), queued(1001, 1000, 1), queued(1002, 1000, 1)],
        );
        acct.charge(0, 2);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_run_job(&table, &acct, &mut rng), None);
    }

    #[test]
    fn unfinished_parent_blocks_child() {
        let mut acct = ResourceAccount::new(&users(&[(1000, 4)]), 4);
        let mut table = JobTable::new();
        let parent = queued(1000, 1000, 1);
        let mut child = queued(1001, 1000, 1);
        child.depend_on = vec![1000];
        setup(&mut acct, &mut table, vec![parent, child]);

        // The parent is picked; while it runs the child must not be.
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_run_job(&table, &acct, &mut rng), Some(1000));

        let u = acct.internal_uid(1000).unwrap();
        table.get_mut(1000).unwrap().state = JobState::Running;
        acct.queued_dec(u);
        acct.charge(u, 1);
        assert_eq!(next_run_job(&table, &acct, &mut rng), None);

        // Once terminal (even skipped), the child is runnable.
        table.get_mut(1000).unwrap().state = JobState::Skipped;
        acct.release(u, 1);
        assert_eq!(next_run_job(&table, &acct, &mut rng), Some(1001));
    }

    #[test]
    fn vanished_parent_does_not_block() {
        let mut acct = ResourceAccount::new(&users(&[(1000, 4)]), 4);
        let mut table = JobTable::new();
        let mut child = queued(1001, 1000, 1);
        child.depend_on = vec![900];
        setup(&mut acct, &mut table, vec![child]);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_run_job(&table, &acct, &mut rng), Some(1001));
    }

    #[test]
    fn relink_preempts_everything() {
        let mut acct = ResourceAccount::new(&users(&[(1000, 4)]), 4);
        let mut table = JobTable::new();
        setup(&mut acct, &mut table, vec![queued(1000, 1000, 1)]);
        let mut relink = queued(1001, 1000, 1);
        relink.state = JobState::Relink;
        table.insert_active(relink);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_run_job(&table, &acct, &mut rng), Some(1001));
    }

    #[test]
    fn rotation_serves_every_user_with_headroom() {
        let mut acct = ResourceAccount::new(&users(&[(1000, 2), (1001, 2), (1002, 2)]), 16);
        let mut table = JobTable::new();
        setup(
            &mut acct,
            &mut table,
            vec![queued(1000, 1000, 1), queued(1001, 1001, 1), queued(1002, 1002, 1)],
        );

        // Over many seeds, every user's job is sometimes picked first.
        let mut seen = std::collections::HashSet::new();
        for seed in 0..64 {
            let mut rng = StdRng::seed_from_u64(seed);
            seen.insert(next_run_job(&table, &acct, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }
}
