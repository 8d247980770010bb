use std::sync::Arc;

use crate::formats::LedgerRow;
use crate::ledger::{DedupIndex, LedgerClient, LedgerKey};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Appended,
    /// Another actor (or an earlier run) already ledgered this key.
    AlreadyPresent,
    Failed(String),
}

impl PublishOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Idempotent append to the ledger, keyed by `class_id:lesson_number`.
pub struct PublicationGate {
    ledger: Arc<dyn LedgerClient>,
    policy: RetryPolicy,
    refresh_before_append: bool,
    index: DedupIndex,
}

impl PublicationGate {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        policy: RetryPolicy,
        refresh_before_append: bool,
        index: DedupIndex,
    ) -> Self {
        Self {
            ledger,
            policy,
            refresh_before_append,
            index,
        }
    }

    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.index.contains(key)
    }

    pub async fn publish(&mut self, row: &LedgerRow) -> PublishOutcome {
        let key = LedgerKey::for_row(row);

        if self.refresh_before_append {
            match self.ledger.fetch_rows().await {
                Ok(rows) => self.index.extend(&rows),
                Err(err) => {
                    tracing::warn!(unit = %key, reason = %err, "ledger refresh failed; using in-memory index");
                }
            }
        }

        if self.index.contains(&key) {
            tracing::info!(unit = %key, "already in ledger; skipping append");
            return PublishOutcome::AlreadyPresent;
        }

        let ledger = &self.ledger;
        match self
            .policy
            .run("append_row", key.as_str(), || ledger.append_row(row))
            .await
        {
            Ok(()) => {
                tracing::info!(unit = %key, status = %row.status, "published");
                self.index.insert(key);
                PublishOutcome::Appended
            }
            Err(err) => {
                tracing::error!(unit = %key, reason = %err, "publish failed");
                PublishOutcome::Failed(err.to_string())
            }
        }
    }
}
