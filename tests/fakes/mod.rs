#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lessonsync::checkpoint::CheckpointStorage;
use lessonsync::error::StepError;
use lessonsync::extraction::ExtractionService;
use lessonsync::formats::{ClassCandidate, ClassDetail, LedgerRow, LessonRow, RawLesson};
use lessonsync::ledger::LedgerClient;
use lessonsync::links::LinkChecker;
use lessonsync::notify::NotificationSink;
use lessonsync::pipeline::PipelineSettings;
use lessonsync::retry::{RateLimitBackoff, RetryPolicy};
use lessonsync::session::SessionDriver;
use serde_json::Value;

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        classes_per_course: 3,
        max_units_per_run: 50,
        retry: RetryPolicy::new(3, Duration::ZERO),
        login: RetryPolicy::new(2, Duration::ZERO),
        rate_limit: RateLimitBackoff {
            base: Duration::ZERO,
            max: Duration::ZERO,
            max_jitter: Duration::ZERO,
        },
        refresh_before_append: true,
    }
}

pub fn candidate(course: &str, class_id: &str, start_date: &str) -> ClassCandidate {
    ClassCandidate {
        course_name: course.to_owned(),
        class_id: class_id.to_owned(),
        start_date: Some(start_date.to_owned()),
        rate: None,
    }
}

pub fn ledger_row(class_id: &str, course: &str, lesson_number: &str) -> LedgerRow {
    LedgerRow {
        class_id: class_id.to_owned(),
        class_code: "manual".to_owned(),
        course_name: course.to_owned(),
        lesson_number: lesson_number.to_owned(),
        report_reference: String::new(),
        homework: String::new(),
        payload: "{}".to_owned(),
        status: "OK".to_owned(),
    }
}

#[derive(Debug, Clone)]
pub struct FakeClass {
    pub course_name: String,
    pub class_code: String,
    pub lessons: Vec<String>,
}

impl FakeClass {
    pub fn new(course: &str, class_code: &str, lessons: usize) -> Self {
        Self {
            course_name: course.to_owned(),
            class_code: class_code.to_owned(),
            lessons: (1..=lessons).map(|n| n.to_string()).collect(),
        }
    }
}

#[derive(Default)]
pub struct FakeSession {
    pub candidates: Vec<ClassCandidate>,
    pub classes: HashMap<String, FakeClass>,
    /// `class_id:lesson_number` keys whose reads always fail transiently.
    pub stale_lessons: HashSet<String>,
    /// `class_id:lesson_number` keys at which the portal session expires.
    pub expired_at: HashSet<String>,
    pub reject_login: bool,
    pub logins: AtomicU32,
    pub opened: Mutex<Vec<String>>,
    pub reads: Mutex<Vec<String>>,
}

impl FakeSession {
    pub fn with_class(mut self, candidate: ClassCandidate, class: FakeClass) -> Self {
        self.classes.insert(candidate.class_id.clone(), class);
        self.candidates.push(candidate);
        self
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionDriver for FakeSession {
    async fn login(&self) -> Result<(), StepError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.reject_login {
            return Err(StepError::auth("bad password"));
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
        self.opened.lock().unwrap().push(class_id.to_owned());
        let class = self
            .classes
            .get(class_id)
            .ok_or_else(|| StepError::Other(anyhow::anyhow!("unknown class {class_id}")))?;
        Ok(ClassDetail {
            class_code: class.class_code.clone(),
            course_name: class.course_name.clone(),
            lessons: class
                .lessons
                .iter()
                .enumerate()
                .map(|(index, label)| LessonRow {
                    index,
                    lesson_number: label.clone(),
                })
                .collect(),
        })
    }

    async fn read_lesson(&self, class_id: &str, row: &LessonRow) -> Result<RawLesson, StepError> {
        let key = format!("{class_id}:{}", row.lesson_number);
        self.reads.lock().unwrap().push(key.clone());
        if self.stale_lessons.contains(&key) {
            return Err(StepError::transient("stale element reference"));
        }
        if self.expired_at.contains(&key) {
            return Err(StepError::auth("session expired"));
        }
        Ok(RawLesson {
            report_reference: Some(format!(
                "https://docs.google.com/document/d/{class_id}-{}/edit",
                row.lesson_number
            )),
            homework: format!("Homework for lesson {}", row.lesson_number),
            report_text: format!("Lesson plan {key}"),
            links: vec!["https://quizlet.com/set".to_owned()],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Ok,
    RateLimited,
}

pub struct FakeExtraction {
    pub mode: ExtractionMode,
    pub calls: AtomicU32,
}

impl FakeExtraction {
    pub fn new(mode: ExtractionMode) -> Self {
        Self {
            mode,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ExtractionService for FakeExtraction {
    fn available_backends(&self) -> Vec<String> {
        vec!["primary".to_owned(), "secondary".to_owned()]
    }

    async fn extract(&self, backend: &str, raw_text: &str) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            ExtractionMode::Ok => Ok(serde_json::json!({
                "lesson_unit": raw_text,
                "backend": backend,
            })),
            ExtractionMode::RateLimited => Err(StepError::rate_limited("insufficient_quota")),
        }
    }
}

#[derive(Default)]
pub struct FakeLedger {
    pub rows: Mutex<Vec<LedgerRow>>,
    pub appends: AtomicU32,
    pub fail_appends: bool,
}

impl FakeLedger {
    pub fn with_rows(rows: Vec<LedgerRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Default::default()
        }
    }

    pub fn rows(&self) -> Vec<LedgerRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.rows()
            .iter()
            .map(|r| format!("{}:{}", r.class_id, r.lesson_number))
            .collect()
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn fetch_rows(&self) -> Result<Vec<LedgerRow>, StepError> {
        Ok(self.rows())
    }

    async fn append_row(&self, row: &LedgerRow) -> Result<(), StepError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.fail_appends {
            return Err(StepError::transient("503 backend unavailable"));
        }
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

/// Reports the lessons whose report reference is listed in `broken`.
#[derive(Default)]
pub struct FakeLinks {
    pub broken: Mutex<HashSet<String>>,
}

impl FakeLinks {
    pub fn break_report(&self, class_id: &str, lesson_number: &str) {
        self.broken.lock().unwrap().insert(format!(
            "https://docs.google.com/document/d/{class_id}-{lesson_number}/edit"
        ));
    }
}

#[async_trait]
impl LinkChecker for FakeLinks {
    async fn audit(&self, lesson: &RawLesson) -> Vec<String> {
        let broken = self.broken.lock().unwrap();
        lesson
            .report_reference
            .iter()
            .filter(|r| broken.contains(*r))
            .map(|r| format!("report {r}: deleted or not found"))
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryCheckpoint {
    pub bytes: Mutex<Option<Vec<u8>>>,
}

impl MemoryCheckpoint {
    pub fn json(&self) -> Value {
        let bytes = self.bytes.lock().unwrap().clone().unwrap_or_default();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpoint {
    async fn read(&self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.bytes.lock().unwrap().clone())
    }

    async fn write(&self, bytes: &[u8]) -> anyhow::Result<()> {
        *self.bytes.lock().unwrap() = Some(bytes.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.to_owned());
        Ok(())
    }
}
