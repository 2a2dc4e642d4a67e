//! The server: a unix-socket event loop around one engine. Per-connection
//! reader tasks funnel framed requests into a single mpsc; the loop task
//! owns the engine and every writer half, so all engine state is mutated
//! from one place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use spoolq_core::paths;
use spoolq_core::protocol::{Request, read_frame, write_frame};
use spoolq_core::users::{UserFile, load_user_file};
use spoolq_engine::{
    ClientId, Engine, EngineConfig, FileStore, JobStore, MemStore, Outbox, Respawn, RespawnMode,
};

use crate::cli::DaemonOpts;
use crate::procs::ProcfsOps;

enum ConnEvent {
    Request { client: ClientId, uid: u32, req: Request },
    Gone { client: ClientId },
}

fn bind_listener(path: &PathBuf) -> anyhow::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(l) => Ok(l),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            // A previous server died without cleaning up, or one is live.
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                anyhow::bail!("another server is already listening on {}", path.display());
            }
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
            Ok(UnixListener::bind(path)?)
        }
        Err(err) => Err(err).with_context(|| format!("binding {}", path.display())),
    }
}

fn load_users(slots: i32) -> anyhow::Result<(UserFile, Option<PathBuf>, bool)> {
    let path = paths::users_path()?;
    match load_user_file(&path) {
        Ok(Some(file)) if !file.users.is_empty() => Ok((file, Some(path), true)),
        Ok(_) => Ok((
            UserFile::single_user(paths::own_uid(), slots),
            Some(path),
            false,
        )),
        Err(err) => {
            warn!("cannot read user file {}: {err:#}; running single-user", path.display());
            Ok((UserFile::single_user(paths::own_uid(), slots), None, false))
        }
    }
}

fn spawn_respawns(respawns: &[Respawn]) {
    let Ok(exe) = std::env::current_exe() else {
        warn!("cannot locate own executable; recovered jobs stay parked");
        return;
    };
    for respawn in respawns {
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.arg("--rejoin").arg(respawn.jobid.to_string());
        if let RespawnMode::Relink { pid } = respawn.mode {
            cmd.arg("--relink").arg(pid.to_string());
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        match cmd.spawn() {
            Ok(mut child) => {
                info!("respawned runner for job {}", respawn.jobid);
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(err) => warn!("cannot respawn runner for job {}: {err}", respawn.jobid),
        }
    }
}

async fn flush(
    engine: &mut Engine,
    writers: &mut HashMap<ClientId, OwnedWriteHalf>,
    out: &mut Outbox,
) {
    // A dead writer reaps that client's jobs, which can queue more replies;
    // drain until quiet.
    while !out.messages().is_empty() {
        let batch = out.drain();
        let mut dead = Vec::new();
        for (client, reply) in batch {
            let Some(writer) = writers.get_mut(&client) else {
                continue;
            };
            if write_frame(writer, &reply).await.is_err() {
                dead.push(client);
            }
        }
        for client in dead {
            writers.remove(&client);
            engine.client_gone(client, out);
        }
    }
}

fn reader_task(
    client: ClientId,
    uid: u32,
    mut read_half: tokio::net::unix::OwnedReadHalf,
    tx: mpsc::UnboundedSender<ConnEvent>,
) {
    tokio::spawn(async move {
        loop {
            match read_frame::<_, Request>(&mut read_half).await {
                Ok(Some(req)) => {
                    if tx.send(ConnEvent::Request { client, uid, req }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        let _ = tx.send(ConnEvent::Gone { client });
    });
}

pub async fn run(opts: DaemonOpts) -> anyhow::Result<()> {
    let socket = paths::socket_path();
    let listener = bind_listener(&socket)?;

    let (users, users_path, multi_user) = load_users(opts.slots)?;
    // Multi-user servers must accept connections from everyone; ownership
    // checks happen per-request against the peer uid.
    let mode = if multi_user { 0o666 } else { 0o600 };
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(mode));
    }

    let store: Box<dyn JobStore> = if opts.no_persist {
        Box::new(MemStore::new())
    } else {
        let path = paths::state_path()?;
        Box::new(FileStore::open(path)?)
    };

    let logdir = opts.logdir.clone().unwrap_or_else(paths::default_logdir);
    let cfg = EngineConfig {
        max_slots: opts.slots.max(1),
        max_jobs: opts.max_jobs.max(1),
        max_finished: paths::max_finished(),
        logdir,
        users_path,
        sched_seed: None,
        bind_cores: opts.bind_cores.then(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }),
    };
    let mut engine = Engine::new(cfg, &users, store, Box::new(ProcfsOps));

    let respawns = engine.recover();
    if !respawns.is_empty() {
        info!("recovered {} open jobs from disk", respawns.len());
        spawn_respawns(&respawns);
    }

    info!(
        "listening on {} (slots={}, users={})",
        socket.display(),
        opts.slots,
        users.users.len()
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<ConnEvent>();
    let mut writers: HashMap<ClientId, OwnedWriteHalf> = HashMap::new();
    let mut next_client = 0u64;
    let mut sweep = tokio::time::interval(Duration::from_secs(10));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut out = Outbox::new();

    let result: anyhow::Result<()> = loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                next_client += 1;
                let client = ClientId(next_client);
                let uid = peer_uid(&stream);
                let (read_half, write_half) = stream.into_split();
                writers.insert(client, write_half);
                reader_task(client, uid, read_half, tx.clone());
            }
            ev = rx.recv() => {
                let Some(ev) = ev else { break Ok(()) };
                match ev {
                    ConnEvent::Request { client, uid, req } => {
                        if let Err(err) = engine.handle(client, uid, req, &mut out) {
                            // Invariant corruption: stop rather than keep
                            // scheduling against bad accounts.
                            error!("{err}");
                            break Err(err.into());
                        }
                    }
                    ConnEvent::Gone { client } => {
                        writers.remove(&client);
                        engine.client_gone(client, &mut out);
                    }
                }
                flush(&mut engine, &mut writers, &mut out).await;
            }
            _ = sweep.tick() => {
                engine.check_locker_expiry();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("terminated; shutting down");
                break Ok(());
            }
        }
    };

    let _ = std::fs::remove_file(&socket);
    result
}

fn peer_uid(stream: &UnixStream) -> u32 {
    stream.peer_cred().map(|cred| cred.uid()).unwrap_or(u32::MAX)
}
