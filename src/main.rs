use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    lessonsync::logging::init().context("init logging")?;

    let cli = lessonsync::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        lessonsync::cli::Command::Run(args) => {
            lessonsync::sync::run(args).await.context("run")?;
        }
        lessonsync::cli::Command::Reconcile(args) => {
            lessonsync::sync::reconcile(args).await.context("reconcile")?;
        }
        lessonsync::cli::Command::Status(args) => {
            lessonsync::status::run(args).await.context("status")?;
        }
    }

    Ok(())
}
