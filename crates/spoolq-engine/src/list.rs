//! Listing and info rendering. Line-oriented text for humans, an
//! array-of-records JSON form for machines.

use chrono::Utc;
use serde_json::json;

use spoolq_core::protocol::{JobState, ListScope};

use crate::account::ResourceAccount;
use crate::job::Job;
use crate::table::JobTable;

fn user_name(acct: &ResourceAccount, job: &Job) -> String {
    match acct.internal_uid(job.owner_uid) {
        Some(u) => acct.user(u).name.clone(),
        None => format!("uid{}", job.owner_uid),
    }
}

fn elapsed_ms(job: &Job) -> u64 {
    if let Some(result) = job.result {
        return result.real_ms;
    }
    match (job.info.start, job.info.end) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
        (Some(start), None) => (Utc::now() - start).num_milliseconds().max(0) as u64,
        _ => 0,
    }
}

fn errorlevel_cell(job: &Job) -> String {
    match job.result {
        Some(r) => r.errorlevel.to_string(),
        None => String::new(),
    }
}

fn output_cell(job: &Job) -> String {
    job.output_filename
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn listed<'t>(
    table: &'t JobTable,
    scope: ListScope,
    requester_uid: u32,
) -> impl Iterator<Item = &'t Job> {
    let active = table
        .active_jobs()
        .filter(move |j| j.state != JobState::HoldingClient)
        .filter(move |j| scope == ListScope::All || j.owner_uid == requester_uid);
    active.chain(table.finished_jobs())
}

pub(crate) fn render_table(
    table: &JobTable,
    acct: &ResourceAccount,
    scope: ListScope,
    requester_uid: u32,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<6} {:<9} {:<5} {:<10} {:<8} {:>8} {:<12} Command\n",
        "ID", "State", "Proc", "User", "E-level", "Time", "Label"
    ));
    for job in listed(table, scope, requester_uid) {
        let time = format!("{:.2}s", elapsed_ms(job) as f64 / 1000.0);
        out.push_str(&format!(
            "{:<6} {:<9} {:<5} {:<10} {:<8} {:>8} {:<12} {}\n",
            job.id,
            job.state.to_string(),
            job.num_slots,
            user_name(acct, job),
            errorlevel_cell(job),
            time,
            job.label.as_deref().unwrap_or(""),
            job.shown_command(),
        ));
    }
    out
}

pub(crate) fn render_plain(table: &JobTable, scope: ListScope, requester_uid: u32) -> String {
    let mut out = String::new();
    for job in listed(table, scope, requester_uid) {
        out.push_str(&format!("{}\n", job.id));
    }
    out
}

pub(crate) fn render_json(
    table: &JobTable,
    acct: &ResourceAccount,
    scope: ListScope,
    requester_uid: u32,
) -> serde_json::Value {
    let records: Vec<serde_json::Value> = listed(table, scope, requester_uid)
        .map(|job| {
            json!({
                "ID": job.id,
                "State": job.state.to_string(),
                "Proc.": job.num_slots,
                "User": user_name(acct, job),
                "Label": job.label.as_deref().unwrap_or(""),
                "Output": output_cell(job),
                "E-Level": job.result.map(|r| r.errorlevel),
                "Time_ms": elapsed_ms(job),
                "Command": job.shown_command(),
            })
        })
        .collect();
    serde_json::Value::Array(records)
}

pub(crate) fn render_info(job: &Job, acct: &ResourceAccount) -> String {
    let mut out = String::new();
    out.push_str(&format!("Job {}\n", job.id));
    if job.depend_on.is_empty() {
        out.push_str(&format!("Command: {}\n", job.shown_command()));
    } else {
        let deps: Vec<String> = job.depend_on.iter().map(|d| d.to_string()).collect();
        out.push_str(&format!(
            "Command: [{}]&& {}\n",
            deps.join(","),
            job.shown_command()
        ));
    }
    out.push_str(&format!(
        "User: {} (uid {})\n",
        user_name(acct, job),
        job.owner_uid
    ));
    out.push_str(&format!("State: {}\n", job.state));
    out.push_str(&format!("Slots required: {}\n", job.num_slots));
    if let Some(label) = &job.label {
        out.push_str(&format!("Label: {label}\n"));
    }
    if let Some(output) = &job.output_filename {
        out.push_str(&format!("Output: {}\n", output.display()));
    }
    if let Some(t) = job.info.enqueue {
        out.push_str(&format!("Enqueue time: {}\n", t.to_rfc3339()));
    }
    if let Some(t) = job.info.start {
        out.push_str(&format!("Start time: {}\n", t.to_rfc3339()));
    }
    match job.state {
        JobState::Running | JobState::Paused => {
            out.push_str(&format!(
                "Time running: {:.2}s\n",
                elapsed_ms(job) as f64 / 1000.0
            ));
        }
        JobState::Finished | JobState::Skipped => {
            if let Some(t) = job.info.end {
                out.push_str(&format!("End time: {}\n", t.to_rfc3339()));
            }
            if let Some(r) = job.result {
                if r.died_by_signal {
                    out.push_str(&format!("Exit status: killed by signal {}\n", r.signal));
                } else {
                    out.push_str(&format!("Exit status: died with exit code {}\n", r.errorlevel));
                }
                out.push_str(&format!(
                    "Time run: {:.2}s (user {:.2}s, system {:.2}s)\n",
                    r.real_ms as f64 / 1000.0,
                    r.user_ms as f64 / 1000.0,
                    r.system_ms as f64 / 1000.0
                ));
            }
        }
        _ => {}
    }
    if let Some(env) = &job.info.env_dump {
        out.push_str("Environment:\n");
        out.push_str(env);
        if !env.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
