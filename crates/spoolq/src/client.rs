//! One-shot client commands: open a connection, send the request, print
//! what comes back.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use spoolq_core::protocol::{
    JobSelector, ListFormat, ListScope, Reply, Request, read_frame, write_frame,
};

use crate::cli::{Command, EnvAction, LogdirAction, SlotsAction};
use crate::net::connect;

fn sel(jobid: Option<u64>) -> JobSelector {
    jobid.map(JobSelector::Id).unwrap_or(JobSelector::Last)
}

async fn roundtrip(req: &Request) -> anyhow::Result<Reply> {
    let mut stream = connect(true).await?;
    let (mut reader, mut writer) = stream.split();
    write_frame(&mut writer, req).await?;
    let Some(reply): Option<Reply> = read_frame(&mut reader).await? else {
        anyhow::bail!("server closed the connection");
    };
    Ok(reply)
}

fn print_reply(reply: Reply) -> anyhow::Result<i32> {
    let code = match reply {
        Reply::ListLine(text) => {
            if text.ends_with('\n') {
                print!("{text}");
            } else {
                println!("{text}");
            }
            0
        }
        Reply::Error(text) => {
            eprintln!("spoolq: {text}");
            1
        }
        Reply::InfoData(text) => {
            print!("{text}");
            0
        }
        Reply::JsonList(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            0
        }
        Reply::AnswerState(state) => {
            println!("{state}");
            0
        }
        Reply::WaitJobOk { errorlevel } => errorlevel,
        Reply::LastId(id) => {
            println!("{id}");
            0
        }
        Reply::GetMaxSlotsOk(n) => {
            println!("{n}");
            0
        }
        Reply::CountRunning(n) => {
            println!("{n}");
            0
        }
        Reply::RemoveJobOk => {
            println!("removed");
            0
        }
        Reply::UrgentOk => {
            println!("moved to the head of the queue");
            0
        }
        Reply::SwapJobsOk => {
            println!("swapped");
            0
        }
        Reply::AnswerOutput { store_output, ofilename, .. } => {
            match ofilename {
                Some(path) => println!("{}", path.display()),
                None if store_output => println!("(not started yet)"),
                None => println!("(output not stored)"),
            }
            0
        }
        Reply::EnvValue(Some(value)) => {
            println!("{value}");
            0
        }
        Reply::EnvValue(None) => 1,
        other => {
            eprintln!("spoolq: unexpected reply: {other:?}");
            1
        }
    };
    Ok(code)
}

async fn kill_all() -> anyhow::Result<i32> {
    let mut stream = connect(true).await?;
    let (mut reader, mut writer) = stream.split();
    write_frame(&mut writer, &Request::KillAll).await?;

    let Some(Reply::CountRunning(count)) = read_frame(&mut reader).await? else {
        anyhow::bail!("unexpected reply to kill-all");
    };
    let Some(Reply::RunningPids(pids)) = read_frame(&mut reader).await? else {
        anyhow::bail!("unexpected reply to kill-all");
    };
    for pid in &pids {
        unsafe {
            libc::kill(*pid, libc::SIGTERM);
        }
    }
    println!("signalled {count} running jobs");
    Ok(0)
}

/// Follow a job's output file while its process lives.
async fn tail(jobid: Option<u64>) -> anyhow::Result<i32> {
    let reply = roundtrip(&Request::Output(sel(jobid))).await?;
    let (pid, path) = match reply {
        Reply::AnswerOutput { pid, ofilename: Some(path), .. } => (pid, path),
        Reply::AnswerOutput { .. } => {
            eprintln!("spoolq: the job's output is not stored");
            return Ok(1);
        }
        other => return print_reply(other),
    };

    let mut file = std::fs::File::open(&path)?;
    let mut pos = 0u64;
    let mut buf = Vec::new();
    loop {
        file.seek(SeekFrom::Start(pos))?;
        buf.clear();
        file.read_to_end(&mut buf)?;
        if !buf.is_empty() {
            pos += buf.len() as u64;
            use std::io::Write as _;
            std::io::stdout().write_all(&buf)?;
            std::io::stdout().flush()?;
            continue;
        }
        let alive = pid > 0 && Path::new(&format!("/proc/{pid}")).exists();
        if !alive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(0)
}

/// Run one client subcommand; returns the process exit code.
pub async fn run_command(cmd: Command) -> anyhow::Result<i32> {
    let req = match cmd {
        Command::List { all, plain, json } => {
            let scope = if all { ListScope::All } else { ListScope::Mine };
            let format = if json {
                ListFormat::Json
            } else if plain {
                ListFormat::Plain
            } else {
                ListFormat::Table
            };
            Request::List { scope, format }
        }
        Command::Info { jobid } => Request::Info(sel(jobid)),
        Command::State { jobid } => Request::State(sel(jobid)),
        Command::Output { jobid } => Request::Output(sel(jobid)),
        Command::Tail { jobid } => return tail(jobid).await,
        Command::Wait { jobid } => Request::Wait(sel(jobid)),
        Command::Remove { jobid } => Request::Remove(sel(jobid)),
        Command::Urgent { jobid } => Request::Urgent(sel(jobid)),
        Command::Swap { a, b } => Request::Swap { a, b },
        Command::Hold { jobid } => Request::Hold(sel(jobid)),
        Command::Cont { jobid } => Request::Cont(sel(jobid)),
        Command::KillAll => return kill_all().await,
        Command::CountRunning => Request::CountRunning,
        Command::Clear => Request::ClearFinished,
        Command::SuspendUser { uid } => Request::SuspendUser { uid },
        Command::ResumeUser { uid } => Request::ResumeUser { uid },
        Command::SuspendAll => Request::SuspendAll,
        Command::ResumeAll => Request::ResumeAll,
        Command::Lock => Request::LockServer,
        Command::Unlock => Request::UnlockServer,
        Command::RefreshUsers => Request::RefreshUsers,
        Command::LastId => Request::LastId,
        Command::Label { jobid } => Request::GetLabel(sel(jobid)),
        Command::Cmd { jobid } => Request::GetCommand(sel(jobid)),
        Command::Slots { action } => match action {
            SlotsAction::Get => Request::GetMaxSlots,
            SlotsAction::Set { n } => Request::SetMaxSlots { max_slots: n },
        },
        Command::Env { action } => match action {
            EnvAction::Get { name } => Request::GetEnv { name },
            EnvAction::Set { assignment } => Request::SetEnv { assignment },
            EnvAction::Unset { name } => Request::UnsetEnv { name },
        },
        Command::Logdir { action } => match action {
            LogdirAction::Get => Request::GetLogdir,
            LogdirAction::Set { path } => Request::SetLogdir { path },
        },
        Command::Daemon(_) | Command::Run(_) => unreachable!("handled in main"),
    };

    let reply = roundtrip(&req).await?;
    print_reply(reply)
}
