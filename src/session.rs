//! Portal session port and the snapshot-backed driver.
//!
//! The browser scraper that walks the portal writes one JSON snapshot per
//! class into a directory; [`SnapshotDriver`] serves those snapshots through
//! the same interface a live session would.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::formats::{ClassCandidate, ClassDetail, LessonRow, RawLesson};

#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn login(&self) -> Result<(), StepError>;
    async fn list_classes(&self, course: &str) -> Result<Vec<ClassCandidate>, StepError>;
    async fn open_class(&self, class_id: &str) -> Result<ClassDetail, StepError>;
    async fn read_lesson(&self, class_id: &str, row: &LessonRow) -> Result<RawLesson, StepError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassSnapshot {
    pub class_code: String,
    pub course_name: String,
    #[serde(default)]
    pub lessons: Vec<LessonSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonSnapshot {
    pub lesson_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_reference: Option<String>,
    #[serde(default)]
    pub homework: String,
    #[serde(default)]
    pub report_text: String,
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotDriver {
    dir: PathBuf,
    candidates: Vec<ClassCandidate>,
}

impl SnapshotDriver {
    pub fn new(dir: impl Into<PathBuf>, candidates: Vec<ClassCandidate>) -> Self {
        Self {
            dir: dir.into(),
            candidates,
        }
    }

    pub fn snapshot_path(&self, class_id: &str) -> PathBuf {
        self.dir.join(format!("{class_id}.json"))
    }

    async fn read_snapshot(&self, class_id: &str) -> Result<ClassSnapshot, StepError> {
        let path = self.snapshot_path(class_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StepError::Other(anyhow::anyhow!(
                    "no snapshot for class {class_id}: {}",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(StepError::transient(format!(
                    "read snapshot {}: {err}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| StepError::transient(format!("parse snapshot {}: {err}", path.display())))
    }
}

#[async_trait]
impl SessionDriver for SnapshotDriver {
    async fn login(&self) -> Result<(), StepError> {
        let meta = tokio::fs::metadata(&self.dir).await.map_err(|err| {
            StepError::auth(format!("snapshot dir {}: {err}", self.dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(StepError::auth(format!(
                "snapshot path is not a directory: {}",
                self.dir.display()
            )));
        }
        Ok(())
    }

    async fn list_classes(&self, course: &str) -> Result<Vec<ClassCandidate>, StepError> {
        Ok(self
            .candidates
            .iter()
            .filter(|c| c.course_name == course)
            .cloned()
            .collect())
    }

    async fn open_class(&self, class_id: &str) -> Result<ClassDetail, StepError> {
        let snapshot = self.read_snapshot(class_id).await?;
        let lessons = snapshot
            .lessons
            .iter()
            .enumerate()
            .map(|(index, lesson)| LessonRow {
                index,
                lesson_number: lesson.lesson_number.trim().to_owned(),
            })
            .collect();
        Ok(ClassDetail {
            class_code: snapshot.class_code.trim().to_owned(),
            course_name: snapshot.course_name.trim().to_owned(),
            lessons,
        })
    }

    async fn read_lesson(&self, class_id: &str, row: &LessonRow) -> Result<RawLesson, StepError> {
        let snapshot = self.read_snapshot(class_id).await?;
        let lesson = snapshot.lessons.get(row.index).ok_or_else(|| {
            StepError::transient(format!("lesson row {} vanished from class {class_id}", row.index))
        })?;
        if lesson.lesson_number.trim() != row.lesson_number {
            return Err(StepError::transient(format!(
                "lesson row {} changed from {} to {}",
                row.index,
                row.lesson_number,
                lesson.lesson_number.trim()
            )));
        }
        Ok(RawLesson {
            report_reference: lesson
                .report_reference
                .clone()
                .filter(|r| !r.trim().is_empty()),
            homework: lesson.homework.clone(),
            report_text: lesson.report_text.clone(),
            links: lesson.links.clone(),
        })
    }
}

/// Writes a snapshot the way the scraper does. Handy for fixtures.
pub fn write_snapshot(dir: &Path, class_id: &str, snapshot: &ClassSnapshot) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create snapshot dir: {}", dir.display()))?;
    let path = dir.join(format!("{class_id}.json"));
    let data = serde_json::to_vec_pretty(snapshot).context("serialize snapshot")?;
    std::fs::write(&path, data).with_context(|| format!("write snapshot: {}", path.display()))?;
    Ok(())
}
