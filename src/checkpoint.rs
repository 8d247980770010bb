//! Durable per-class progress.
//!
//! The checkpoint is a JSON document keyed by course name, then class id:
//!
//! ```json
//! { "Kindergarten 1": { "11005": { "last_lesson": 4, "total_lessons": 24, "has_errors": false } } }
//! ```
//!
//! It is rewritten after every lesson attempt. Losing it is never fatal: an
//! unreadable file degrades to an empty checkpoint and the ledger dedup index
//! keeps already published lessons from being published twice.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::formats::ClassProgress;

#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    async fn read(&self) -> anyhow::Result<Option<Vec<u8>>>;
    async fn write(&self, bytes: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalFsCheckpointStorage {
    path: PathBuf,
}

impl LocalFsCheckpointStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CheckpointStorage for LocalFsCheckpointStorage {
    async fn read(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read: {}", self.path.display())),
        }
    }

    async fn write(&self, bytes: &[u8]) -> anyhow::Result<()> {
        write_atomic(&self.path, bytes).await
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent dir: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    courses: BTreeMap<String, BTreeMap<String, ClassProgress>>,
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }

    pub fn get_progress(&self, course: &str, class_id: &str) -> ClassProgress {
        self.courses
            .get(course)
            .and_then(|classes| classes.get(class_id))
            .copied()
            .unwrap_or_default()
    }

    pub fn course(&self, course: &str) -> Option<&BTreeMap<String, ClassProgress>> {
        self.courses.get(course)
    }

    pub fn courses(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, ClassProgress>)> {
        self.courses.iter()
    }

    /// A course is satisfied once one of its classes finished without errors.
    pub fn is_course_satisfied(&self, course: &str) -> bool {
        self.course(course)
            .is_some_and(|classes| classes.values().any(ClassProgress::is_clean_complete))
    }

    fn entry(&mut self, course: &str, class_id: &str) -> &mut ClassProgress {
        self.courses
            .entry(course.to_owned())
            .or_default()
            .entry(class_id.to_owned())
            .or_default()
    }

    /// Moves `last_lesson` forward (never back) and accumulates the error flag.
    pub fn advance(&mut self, course: &str, class_id: &str, lesson_index: i64, has_errors: bool) {
        let progress = self.entry(course, class_id);
        progress.last_lesson = progress.last_lesson.max(lesson_index);
        progress.has_errors |= has_errors;
    }

    pub fn set_total(&mut self, course: &str, class_id: &str, total_lessons: i64) {
        let progress = self.entry(course, class_id);
        if progress.total_lessons != total_lessons && progress.last_lesson >= total_lessons {
            tracing::warn!(
                course,
                class_id,
                last_lesson = progress.last_lesson,
                total_lessons,
                "lesson count shrank below recorded progress"
            );
        }
        progress.total_lessons = total_lessons;
    }

    pub fn mark_errored(&mut self, course: &str, class_id: &str) {
        self.entry(course, class_id).has_errors = true;
    }

    pub fn clear_errors(&mut self, course: &str, class_id: &str) {
        self.entry(course, class_id).has_errors = false;
    }

    pub fn summary(&self) -> CheckpointSummary {
        let mut summary = CheckpointSummary::default();
        for classes in self.courses.values() {
            summary.courses += 1;
            if classes.values().any(ClassProgress::is_clean_complete) {
                summary.satisfied_courses += 1;
            }
            for progress in classes.values() {
                summary.classes += 1;
                if progress.is_complete() {
                    summary.completed_classes += 1;
                }
                if progress.has_errors {
                    summary.errored_classes += 1;
                }
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub courses: usize,
    pub satisfied_courses: usize,
    pub classes: usize,
    pub completed_classes: usize,
    pub errored_classes: usize,
}

/// In-memory checkpoint backed by a [`CheckpointStorage`].
///
/// The in-memory state stays authoritative for the rest of the run even when
/// a save fails.
pub struct CheckpointStore {
    storage: Arc<dyn CheckpointStorage>,
    state: Checkpoint,
}

impl CheckpointStore {
    pub async fn load(storage: Arc<dyn CheckpointStorage>) -> Self {
        let state = match storage.read().await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(?err, "checkpoint is not valid json; starting empty");
                    Checkpoint::default()
                }
            },
            Ok(None) => {
                tracing::info!("no checkpoint found; starting empty");
                Checkpoint::default()
            }
            Err(err) => {
                tracing::warn!(?err, "failed to read checkpoint; starting empty");
                Checkpoint::default()
            }
        };
        Self { storage, state }
    }

    pub fn state(&self) -> &Checkpoint {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut Checkpoint {
        &mut self.state
    }

    pub fn get_progress(&self, course: &str, class_id: &str) -> ClassProgress {
        self.state.get_progress(course, class_id)
    }

    pub fn advance(&mut self, course: &str, class_id: &str, lesson_index: i64, has_errors: bool) {
        self.state.advance(course, class_id, lesson_index, has_errors);
    }

    /// Returns `false` when the write failed; the failure is logged.
    pub async fn save(&self) -> bool {
        match self.try_save().await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(?err, "failed to persist checkpoint");
                false
            }
        }
    }

    async fn try_save(&self) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(&self.state).context("serialize checkpoint")?;
        self.storage.write(&data).await.context("write checkpoint")
    }

    /// Advance and flush. This is the crash-recovery boundary between lessons.
    pub async fn commit(
        &mut self,
        course: &str,
        class_id: &str,
        lesson_index: i64,
        has_errors: bool,
    ) -> bool {
        self.advance(course, class_id, lesson_index, has_errors);
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryStorage {
        bytes: Mutex<Option<Vec<u8>>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl CheckpointStorage for MemoryStorage {
        async fn read(&self) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.bytes.lock().unwrap().clone())
        }

        async fn write(&self, bytes: &[u8]) -> anyhow::Result<()> {
            if self.fail_writes {
                anyhow::bail!("disk full");
            }
            *self.bytes.lock().unwrap() = Some(bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn unknown_class_has_default_progress() {
        let checkpoint = Checkpoint::default();
        assert_eq!(
            checkpoint.get_progress("course", "C1"),
            ClassProgress {
                last_lesson: -1,
                total_lessons: 0,
                has_errors: false
            }
        );
    }

    #[test]
    fn advance_is_forward_only_and_ors_errors() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.advance("course", "C1", 3, false);
        checkpoint.advance("course", "C1", 1, true);
        checkpoint.advance("course", "C1", 2, false);

        let progress = checkpoint.get_progress("course", "C1");
        assert_eq!(progress.last_lesson, 3);
        assert!(progress.has_errors);
    }

    #[test]
    fn course_satisfied_requires_clean_completion() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.set_total("course", "C1", 2);
        checkpoint.advance("course", "C1", 1, true);
        assert!(!checkpoint.is_course_satisfied("course"));

        checkpoint.set_total("course", "C2", 2);
        checkpoint.advance("course", "C2", 1, false);
        assert!(checkpoint.is_course_satisfied("course"));
        assert!(!checkpoint.is_course_satisfied("other"));
    }

    #[test]
    fn summary_counts_classes() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.set_total("a", "C1", 1);
        checkpoint.advance("a", "C1", 0, false);
        checkpoint.mark_errored("b", "C2");
        let summary = checkpoint.summary();
        assert_eq!(summary.courses, 2);
        assert_eq!(summary.satisfied_courses, 1);
        assert_eq!(summary.classes, 2);
        assert_eq!(summary.completed_classes, 1);
        assert_eq!(summary.errored_classes, 1);
    }

    #[tokio::test]
    async fn load_degrades_to_empty_on_garbage() {
        let storage = Arc::new(MemoryStorage {
            bytes: Mutex::new(Some(b"{not json".to_vec())),
            fail_writes: false,
        });
        let store = CheckpointStore::load(storage).await;
        assert!(store.state().is_empty());
    }

    #[tokio::test]
    async fn commit_persists_and_reloads() {
        let storage = Arc::new(MemoryStorage::default());
        let mut store = CheckpointStore::load(storage.clone()).await;
        store.state_mut().set_total("course", "C1", 3);
        assert!(store.commit("course", "C1", 0, false).await);

        let reloaded = CheckpointStore::load(storage).await;
        assert_eq!(reloaded.get_progress("course", "C1").last_lesson, 0);
        assert_eq!(reloaded.get_progress("course", "C1").total_lessons, 3);
    }

    #[tokio::test]
    async fn failed_save_keeps_memory_state() {
        let storage = Arc::new(MemoryStorage {
            bytes: Mutex::new(None),
            fail_writes: true,
        });
        let mut store = CheckpointStore::load(storage).await;
        assert!(!store.commit("course", "C1", 4, false).await);
        assert_eq!(store.get_progress("course", "C1").last_lesson, 4);
    }

    #[tokio::test]
    async fn local_fs_storage_round_trips_and_leaves_no_tmp_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("state").join("processed.json");
        let storage = LocalFsCheckpointStorage::new(&path);

        assert!(storage.read().await.unwrap().is_none());
        storage.write(b"{}").await.unwrap();
        storage.write(b"{\"a\":{}}").await.unwrap();
        assert_eq!(storage.read().await.unwrap().unwrap(), b"{\"a\":{}}");

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
