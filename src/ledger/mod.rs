//! The remote ledger is the system of record for "already published".
//!
//! Other actors (manual edits, concurrent runs) write to it too, so the local
//! checkpoint is only ever merged forward from it.

pub mod local;
pub mod sheets;

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::error::StepError;
use crate::formats::LedgerRow;
use crate::retry::RetryPolicy;

pub use local::JsonlLedger;
pub use sheets::SheetsLedger;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn fetch_rows(&self) -> Result<Vec<LedgerRow>, StepError>;
    async fn append_row(&self, row: &LedgerRow) -> Result<(), StepError>;
}

/// `class_id:lesson_number`, the identity of a published lesson.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey(String);

impl LedgerKey {
    pub fn new(class_id: &str, lesson_number: &str) -> Self {
        Self(format!("{}:{}", class_id.trim(), lesson_number.trim()))
    }

    pub fn for_row(row: &LedgerRow) -> Self {
        Self::new(&row.class_id, &row.lesson_number)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    keys: HashSet<LedgerKey>,
}

impl DedupIndex {
    pub fn build(rows: &[LedgerRow]) -> Self {
        let mut index = Self::default();
        index.extend(rows);
        index
    }

    pub fn extend(&mut self, rows: &[LedgerRow]) {
        self.keys.extend(rows.iter().map(LedgerKey::for_row));
    }

    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.keys.contains(key)
    }

    pub fn insert(&mut self, key: LedgerKey) -> bool {
        self.keys.insert(key)
    }
}

pub fn build_dedup_index(rows: &[LedgerRow]) -> DedupIndex {
    DedupIndex::build(rows)
}

/// Fetches the ledger with bounded retries. An unreachable ledger yields no
/// rows; the run then relies on the local checkpoint alone.
pub async fn fetch_all(client: &dyn LedgerClient, policy: &RetryPolicy) -> Vec<LedgerRow> {
    match policy.run("fetch_rows", "ledger", || client.fetch_rows()).await {
        Ok(rows) => {
            tracing::info!(rows = rows.len(), "fetched ledger");
            rows
        }
        Err(err) => {
            tracing::warn!(%err, "ledger unavailable; continuing with local checkpoint only");
            Vec::new()
        }
    }
}

/// Merges ledger rows into the checkpoint, forward only.
///
/// A ledgered lesson `n` proves lessons up to index `n - 1` were handled and
/// that the class is not fatally broken, so its error flag is cleared.
pub fn reconcile(checkpoint: &mut Checkpoint, rows: &[LedgerRow]) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    let mut labels: HashMap<&str, HashSet<&str>> = HashMap::new();

    for row in rows {
        if !labels
            .entry(row.class_id.as_str())
            .or_default()
            .insert(row.lesson_number.as_str())
        {
            tracing::warn!(
                class_id = %row.class_id,
                lesson_number = %row.lesson_number,
                "ledger holds the same lesson twice"
            );
            stats.duplicate_rows += 1;
        }

        let Some(ordinal) = row.lesson_ordinal() else {
            tracing::debug!(
                class_id = %row.class_id,
                lesson_number = %row.lesson_number,
                "non-numeric lesson number; dedup only"
            );
            continue;
        };
        if row.course_name.is_empty() {
            continue;
        }

        let before = checkpoint.get_progress(&row.course_name, &row.class_id);
        let mut target = ordinal - 1;
        if before.total_lessons > 0 {
            target = target.min(before.total_lessons - 1);
        }

        checkpoint.advance(&row.course_name, &row.class_id, target, false);
        checkpoint.clear_errors(&row.course_name, &row.class_id);

        let after = checkpoint.get_progress(&row.course_name, &row.class_id);
        if after != before {
            stats.classes_advanced += 1;
        }
    }

    if stats.classes_advanced > 0 {
        tracing::info!(
            updates = stats.classes_advanced,
            "checkpoint advanced from ledger"
        );
    }
    stats
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub classes_advanced: usize,
    pub duplicate_rows: usize,
}
