use std::fs::OpenOptions;
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::error::StepError;
use crate::formats::LedgerRow;
use crate::ledger::LedgerClient;

/// Ledger kept as a JSONL file, one row per line. Used for offline runs.
#[derive(Debug, Clone)]
pub struct JsonlLedger {
    path: PathBuf,
}

impl JsonlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_rows(&self) -> anyhow::Result<Vec<LedgerRow>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("open ledger: {}", self.path.display()));
            }
        };

        let mut rows = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read ledger: {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: LedgerRow = serde_json::from_str(&line)
                .with_context(|| format!("parse ledger line {}", idx + 1))?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn write_row(&self, row: &LedgerRow) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir: {}", parent.display()))?;
        }
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger for append: {}", self.path.display()))?;
        let mut line = serde_json::to_vec(row).context("serialize ledger row")?;
        line.push(b'\n');
        out.write_all(&line).context("append ledger row")?;
        out.flush().context("flush ledger")?;
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for JsonlLedger {
    async fn fetch_rows(&self) -> Result<Vec<LedgerRow>, StepError> {
        Ok(self.read_rows()?)
    }

    async fn append_row(&self, row: &LedgerRow) -> Result<(), StepError> {
        self.write_row(row).map_err(|err| StepError::transient(format!("{err:#}")))
    }
}
