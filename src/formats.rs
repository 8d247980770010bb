use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One line of the class manifest (`classes.jsonl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassCandidate {
    pub course_name: String,
    pub class_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

impl ClassCandidate {
    /// Accepts ISO dates and the day-first dates exported by the portal.
    pub fn parsed_start_date(&self) -> Option<NaiveDate> {
        let raw = self.start_date.as_deref()?.trim();
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
            .or_else(|_| NaiveDate::parse_from_str(raw, "%d-%m-%Y"))
            .ok()
    }
}

/// Per-class progress as persisted in the checkpoint file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassProgress {
    #[serde(default = "ClassProgress::default_last_lesson")]
    pub last_lesson: i64,
    #[serde(default)]
    pub total_lessons: i64,
    #[serde(default)]
    pub has_errors: bool,
}

impl ClassProgress {
    fn default_last_lesson() -> i64 {
        -1
    }

    /// Next lesson index to visit.
    pub fn next_index(&self) -> usize {
        (self.last_lesson + 1).max(0) as usize
    }

    /// Every known lesson has been visited. Unknown totals never count.
    pub fn is_complete(&self) -> bool {
        self.total_lessons > 0 && self.last_lesson + 1 >= self.total_lessons
    }

    pub fn is_clean_complete(&self) -> bool {
        self.is_complete() && !self.has_errors
    }
}

impl Default for ClassProgress {
    fn default() -> Self {
        Self {
            last_lesson: -1,
            total_lessons: 0,
            has_errors: false,
        }
    }
}

/// A lesson row as listed on the class page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LessonRow {
    /// Zero-based position in the class table.
    pub index: usize,
    /// Label shown by the portal; the canonical dedup identity.
    pub lesson_number: String,
}

#[derive(Debug, Clone)]
pub struct ClassDetail {
    pub class_code: String,
    pub course_name: String,
    pub lessons: Vec<LessonRow>,
}

#[derive(Debug, Clone, Default)]
pub struct RawLesson {
    pub report_reference: Option<String>,
    pub homework: String,
    pub report_text: String,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessonStatus {
    Ok,
    HasErrors,
}

impl LessonStatus {
    pub fn from_errors(has_errors: bool) -> Self {
        if has_errors { Self::HasErrors } else { Self::Ok }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::HasErrors => "Has Errors",
        }
    }
}

/// A published lesson in the remote ledger.
///
/// Column order matters: the ledger key is built from column 0 (`class_id`)
/// and column 3 (`lesson_number`), which is also how rows written by hand
/// are recognised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRow {
    pub class_id: String,
    pub class_code: String,
    pub course_name: String,
    pub lesson_number: String,
    pub report_reference: String,
    pub homework: String,
    pub payload: String,
    pub status: String,
}

impl LedgerRow {
    pub const COLUMNS: usize = 8;

    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.class_id.clone(),
            self.class_code.clone(),
            self.course_name.clone(),
            self.lesson_number.clone(),
            self.report_reference.clone(),
            self.homework.clone(),
            self.payload.clone(),
            self.status.clone(),
        ]
    }

    /// Rows shorter than four cells carry no key and are ignored.
    pub fn from_cells(cells: &[String]) -> Option<Self> {
        if cells.len() < 4 {
            return None;
        }
        let cell = |i: usize| cells.get(i).map(|c| c.trim().to_owned()).unwrap_or_default();
        let class_id = cell(0);
        let lesson_number = cell(3);
        if class_id.is_empty() || lesson_number.is_empty() {
            return None;
        }
        Some(Self {
            class_id,
            class_code: cell(1),
            course_name: cell(2),
            lesson_number,
            report_reference: cell(4),
            homework: cell(5),
            payload: cell(6),
            status: cell(7),
        })
    }

    /// Lesson number as an integer, when the label is numeric.
    pub fn lesson_ordinal(&self) -> Option<i64> {
        self.lesson_number.trim().parse::<i64>().ok()
    }
}
