use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;

use crate::checkpoint::{CheckpointStore, LocalFsCheckpointStorage};
use crate::cli::{ReconcileArgs, RunArgs};
use crate::config::{self, Config};
use crate::manifest::Manifest;
use crate::pipeline::{self, Pipeline};

fn checkpoint_path(config: &Config, flag: Option<&str>) -> PathBuf {
    flag.map(PathBuf::from)
        .unwrap_or_else(|| config.checkpoint.clone())
}

async fn open_checkpoint(path: &Path) -> CheckpointStore {
    tracing::info!(path = %path.display(), "loading checkpoint");
    CheckpointStore::load(Arc::new(LocalFsCheckpointStorage::new(path))).await
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = config::load(Path::new(&args.config)).context("load config")?;
    let manifest = Manifest::load(&config.manifest).context("load manifest")?;
    if manifest.is_empty() {
        tracing::warn!(path = %config.manifest.display(), "manifest lists no classes");
    }

    let mut settings = config.pipeline.settings();
    if let Some(max_classes) = args.max_classes {
        if max_classes == 0 {
            anyhow::bail!("--max-classes must be > 0");
        }
        settings.max_units_per_run = max_classes;
    }

    let ports = config.ports(&manifest)?;
    let checkpoint = open_checkpoint(&checkpoint_path(&config, args.checkpoint.as_deref())).await;

    let mut pipeline = Pipeline::new(settings, ports, checkpoint);
    let summary = pipeline.run(&manifest).await.context("pipeline run")?;

    tracing::info!(
        summary = %serde_json::to_string(&summary).unwrap_or_default(),
        "done"
    );
    Ok(())
}

pub async fn reconcile(args: ReconcileArgs) -> anyhow::Result<()> {
    let config = config::load(Path::new(&args.config)).context("load config")?;
    let ledger = config.ledger_client().context("configure ledger")?;
    let mut checkpoint =
        open_checkpoint(&checkpoint_path(&config, args.checkpoint.as_deref())).await;

    let settings = config.pipeline.settings();
    let (rows, stats) =
        pipeline::reconcile_checkpoint(&mut checkpoint, ledger.as_ref(), &settings.retry).await;
    tracing::info!(
        rows = rows.len(),
        classes_advanced = stats.classes_advanced,
        duplicate_rows = stats.duplicate_rows,
        "reconciled"
    );
    Ok(())
}
