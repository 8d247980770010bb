use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Extract and publish every unresolved lesson.
    Run(RunArgs),
    /// Merge the remote ledger into the checkpoint without visiting classes.
    Reconcile(ReconcileArgs),
    /// Print checkpoint progress.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to `lessonsync.yaml`.
    #[arg(long)]
    pub config: String,

    /// Override the checkpoint path from the config.
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Override the per-run class cap from the config.
    #[arg(long)]
    pub max_classes: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Path to `lessonsync.yaml`.
    #[arg(long)]
    pub config: String,

    /// Override the checkpoint path from the config.
    #[arg(long)]
    pub checkpoint: Option<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Checkpoint file (`processed_classes.json`).
    #[arg(long)]
    pub checkpoint: String,
}
