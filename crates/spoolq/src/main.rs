mod cli;
mod client;
mod net;
mod procs;
mod runner;
mod server;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

fn exit_code(errorlevel: i32) -> i32 {
    if errorlevel < 0 {
        255
    } else {
        errorlevel.min(255)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();

    match cli.command.take() {
        Some(Command::Daemon(opts)) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            server::run(opts).await
        }
        Some(Command::Run(argv)) => runner::submit_detached(&cli, &argv).await,
        Some(cmd) => {
            let code = client::run_command(cmd).await?;
            std::process::exit(exit_code(code));
        }
        None => {
            if cli.runner {
                runner::runner_stage().await
            } else if let Some(jobid) = cli.rejoin {
                runner::rejoin(jobid, cli.relink).await
            } else if let Some(pid) = cli.relink {
                runner::relink_detached(&cli, pid).await
            } else {
                anyhow::bail!("nothing to do; try `spoolq --help`");
            }
        }
    }
}
