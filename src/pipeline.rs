//! The run loop: courses → ranked classes → lessons.
//!
//! Every lesson attempt ends with a checkpoint flush, and publication is
//! gated by the ledger dedup index, so a run can be killed at any point and
//! restarted without publishing a lesson twice.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::checkpoint::{CheckpointStore, CheckpointSummary};
use crate::error::StepError;
use crate::extraction::{self, ExtractionService, LessonContext};
use crate::formats::{ClassCandidate, ClassDetail, LedgerRow, LessonRow, LessonStatus};
use crate::ledger::{self, LedgerClient, LedgerKey, ReconcileStats};
use crate::links::LinkChecker;
use crate::manifest::Manifest;
use crate::notify::{self, NotificationSink};
use crate::publish::{PublicationGate, PublishOutcome};
use crate::retry::{RateLimitBackoff, RetryError, RetryPolicy};
use crate::session::SessionDriver;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Classes attempted per course before giving up on it for this run.
    pub classes_per_course: usize,
    /// Classes attempted per run, across all courses.
    pub max_units_per_run: usize,
    pub retry: RetryPolicy,
    pub login: RetryPolicy,
    pub rate_limit: RateLimitBackoff,
    pub refresh_before_append: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            classes_per_course: 3,
            max_units_per_run: 50,
            retry: RetryPolicy::new(3, Duration::from_secs(2)),
            login: RetryPolicy::new(3, Duration::from_secs(5)),
            rate_limit: RateLimitBackoff {
                base: Duration::from_secs(30),
                max: Duration::from_secs(300),
                max_jitter: Duration::from_secs(5),
            },
            refresh_before_append: true,
        }
    }
}

/// The collaborators a run talks to.
#[derive(Clone)]
pub struct Ports {
    pub session: Arc<dyn SessionDriver>,
    pub extraction: Arc<dyn ExtractionService>,
    pub ledger: Arc<dyn LedgerClient>,
    pub links: Arc<dyn LinkChecker>,
    pub notifier: Arc<dyn NotificationSink>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub ledger_rows: usize,
    pub reconciled_classes: usize,
    pub courses_visited: usize,
    pub courses_already_satisfied: usize,
    pub courses_satisfied: usize,
    pub classes_attempted: usize,
    pub classes_errored: usize,
    pub lessons_published: usize,
    pub lessons_skipped: usize,
    pub lessons_errored: usize,
    pub degraded_payloads: usize,
    pub broken_links: usize,
    pub publish_failures: usize,
    pub run_cap_reached: bool,
    #[serde(skip)]
    pub checkpoint: CheckpointSummary,
}

impl RunSummary {
    /// Chat message (Telegram HTML).
    pub fn to_message(&self) -> String {
        let mut lines = vec![
            "<b>lessonsync run finished</b>".to_owned(),
            format!("Classes attempted: {}", self.classes_attempted),
            format!("Lessons published: {}", self.lessons_published),
            format!("Lessons already in ledger: {}", self.lessons_skipped),
            format!("Lessons with errors: {}", self.lessons_errored),
            format!("Classes with errors: {}", self.classes_errored),
            format!(
                "Courses satisfied: {}/{}",
                self.checkpoint.satisfied_courses, self.checkpoint.courses
            ),
        ];
        if self.degraded_payloads > 0 {
            lines.push(format!("Default payloads used: {}", self.degraded_payloads));
        }
        if self.broken_links > 0 {
            lines.push(format!("Unreachable links: {}", self.broken_links));
        }
        if self.run_cap_reached {
            lines.push("Run cap reached; remaining classes left for the next run.".to_owned());
        }
        lines.join("\n")
    }
}

/// Start date descending, then rate descending, then class id ascending.
/// Missing dates and rates sort last.
pub fn rank_candidates(mut candidates: Vec<ClassCandidate>) -> Vec<ClassCandidate> {
    candidates.sort_by(|a, b| {
        b.parsed_start_date()
            .cmp(&a.parsed_start_date())
            .then_with(|| b.rate.partial_cmp(&a.rate).unwrap_or(Ordering::Equal))
            .then_with(|| a.class_id.cmp(&b.class_id))
    });
    candidates
}

/// Fetches the ledger and merges it into the checkpoint. Returns the rows so
/// the caller can seed its dedup index.
pub async fn reconcile_checkpoint(
    store: &mut CheckpointStore,
    client: &dyn LedgerClient,
    policy: &RetryPolicy,
) -> (Vec<LedgerRow>, ReconcileStats) {
    let rows = ledger::fetch_all(client, policy).await;
    let stats = ledger::reconcile(store.state_mut(), &rows);
    store.save().await;
    (rows, stats)
}

enum LessonResult {
    Done { has_errors: bool },
    AbortClass(StepError),
    /// The session stopped accepting requests; nothing may be committed.
    SessionLost(StepError),
}

fn session_lost(course: &str, class_id: &str, err: StepError) -> anyhow::Error {
    anyhow::Error::new(err).context(format!("session lost while processing {course} / {class_id}"))
}

pub struct Pipeline {
    settings: PipelineSettings,
    ports: Ports,
    checkpoint: CheckpointStore,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, ports: Ports, checkpoint: CheckpointStore) -> Self {
        Self {
            settings,
            ports,
            checkpoint,
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Runs until every course is satisfied, skipped, or the run cap is hit.
    ///
    /// Only an authentication failure aborts the run; everything else is
    /// recorded in the checkpoint and the summary.
    pub async fn run(&mut self, manifest: &Manifest) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary::default();

        let (rows, stats) = reconcile_checkpoint(
            &mut self.checkpoint,
            self.ports.ledger.as_ref(),
            &self.settings.retry,
        )
        .await;
        summary.ledger_rows = rows.len();
        summary.reconciled_classes = stats.classes_advanced;

        let mut gate = PublicationGate::new(
            self.ports.ledger.clone(),
            self.settings.retry,
            self.settings.refresh_before_append,
            ledger::build_dedup_index(&rows),
        );

        let result = self.run_courses(manifest, &mut gate, &mut summary).await;
        summary.checkpoint = self.checkpoint.state().summary();

        match result {
            Ok(()) => {
                tracing::info!(
                    classes = summary.classes_attempted,
                    published = summary.lessons_published,
                    skipped = summary.lessons_skipped,
                    errored_lessons = summary.lessons_errored,
                    errored_classes = summary.classes_errored,
                    "run finished"
                );
                notify::notify(self.ports.notifier.as_ref(), &summary.to_message()).await;
                Ok(summary)
            }
            Err(err) => {
                let message = format!(
                    "<b>lessonsync run aborted</b>\n{}",
                    notify::escape_html(&format!("{err:#}"))
                );
                notify::notify(self.ports.notifier.as_ref(), &message).await;
                Err(err)
            }
        }
    }

    async fn run_courses(
        &mut self,
        manifest: &Manifest,
        gate: &mut PublicationGate,
        summary: &mut RunSummary,
    ) -> anyhow::Result<()> {
        'courses: for course in manifest.courses() {
            if self.checkpoint.state().is_course_satisfied(&course) {
                tracing::info!(course = %course, "course already satisfied; skipping");
                summary.courses_already_satisfied += 1;
                continue;
            }
            summary.courses_visited += 1;

            let session = self.ports.session.clone();
            let candidates = match self
                .settings
                .retry
                .run("list_classes", &course, || session.list_classes(&course))
                .await
            {
                Ok(candidates) => rank_candidates(candidates),
                Err(RetryError::Fatal(err @ StepError::Auth(_))) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("session lost while listing classes for {course}")));
                }
                Err(err) => {
                    tracing::warn!(course = %course, reason = %err, "cannot list classes; skipping course");
                    continue;
                }
            };

            let mut attempted = 0usize;
            for candidate in &candidates {
                if attempted >= self.settings.classes_per_course {
                    tracing::info!(
                        course = %course,
                        attempted,
                        "class attempts exhausted for course"
                    );
                    break;
                }
                let progress = self.checkpoint.get_progress(&course, &candidate.class_id);
                if progress.is_complete() {
                    tracing::debug!(
                        course = %course,
                        class_id = %candidate.class_id,
                        has_errors = progress.has_errors,
                        "class already complete; next candidate"
                    );
                    continue;
                }
                if summary.classes_attempted >= self.settings.max_units_per_run {
                    tracing::info!(
                        cap = self.settings.max_units_per_run,
                        "run cap reached; stopping"
                    );
                    summary.run_cap_reached = true;
                    break 'courses;
                }

                attempted += 1;
                summary.classes_attempted += 1;
                tracing::info!(
                    course = %course,
                    class_id = %candidate.class_id,
                    attempt = attempted,
                    of = self.settings.classes_per_course,
                    "processing class"
                );

                self.login().await?;
                self.process_class(&course, &candidate.class_id, gate, summary)
                    .await?;

                if self.checkpoint.state().is_course_satisfied(&course) {
                    tracing::info!(course = %course, class_id = %candidate.class_id, "course satisfied");
                    summary.courses_satisfied += 1;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn login(&self) -> anyhow::Result<()> {
        let policy = self.settings.login;
        let mut last_reason = String::new();
        for attempt in 1..=policy.max_attempts {
            match self.ports.session.login().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        attempts = policy.max_attempts,
                        reason = %err,
                        "login failed"
                    );
                    last_reason = err.to_string();
                    if attempt < policy.max_attempts && !policy.delay.is_zero() {
                        tokio::time::sleep(policy.delay).await;
                    }
                }
            }
        }
        anyhow::bail!(
            "login failed after {} attempt(s): {last_reason}",
            policy.max_attempts
        )
    }

    async fn process_class(
        &mut self,
        course: &str,
        class_id: &str,
        gate: &mut PublicationGate,
        summary: &mut RunSummary,
    ) -> anyhow::Result<()> {
        let session = self.ports.session.clone();
        let detail = match self
            .settings
            .retry
            .run("open_class", class_id, || session.open_class(class_id))
            .await
            .map_err(into_step_error)
            .and_then(|detail| verify_identity(course, class_id, detail))
        {
            Ok(detail) => detail,
            Err(err @ StepError::Auth(_)) => return Err(session_lost(course, class_id, err)),
            Err(err) => {
                tracing::warn!(course, class_id, reason = %err, "class abandoned");
                self.abandon_class(course, class_id, summary).await;
                return Ok(());
            }
        };

        let total = detail.lessons.len() as i64;
        self.checkpoint.state_mut().set_total(course, class_id, total);
        self.checkpoint.save().await;
        warn_on_repeated_labels(class_id, &detail.lessons);

        let start = self.checkpoint.get_progress(course, class_id).next_index();
        if start >= detail.lessons.len() {
            tracing::info!(course, class_id, total, "no lessons left to visit");
        }

        for row in detail.lessons.iter().skip(start) {
            let key = LedgerKey::new(class_id, &row.lesson_number);
            if gate.contains(&key) {
                tracing::info!(unit = %key, index = row.index, "already in ledger; advancing");
                summary.lessons_skipped += 1;
                self.checkpoint
                    .commit(course, class_id, row.index as i64, false)
                    .await;
                continue;
            }

            match self
                .process_lesson(course, class_id, &detail, row, &key, gate, summary)
                .await
            {
                LessonResult::Done { has_errors } => {
                    if has_errors {
                        summary.lessons_errored += 1;
                    }
                    self.checkpoint
                        .commit(course, class_id, row.index as i64, has_errors)
                        .await;
                }
                LessonResult::AbortClass(err) => {
                    tracing::warn!(unit = %key, reason = %err, "class abandoned mid-way");
                    self.abandon_class(course, class_id, summary).await;
                    return Ok(());
                }
                LessonResult::SessionLost(err) => {
                    tracing::error!(unit = %key, reason = %err, "session lost; lesson left for the next run");
                    return Err(session_lost(course, class_id, err));
                }
            }
        }

        let progress = self.checkpoint.get_progress(course, class_id);
        tracing::info!(
            course,
            class_id,
            last_lesson = progress.last_lesson,
            total_lessons = progress.total_lessons,
            has_errors = progress.has_errors,
            "class done"
        );
        if progress.has_errors {
            summary.classes_errored += 1;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_lesson(
        &self,
        course: &str,
        class_id: &str,
        detail: &ClassDetail,
        row: &LessonRow,
        key: &LedgerKey,
        gate: &mut PublicationGate,
        summary: &mut RunSummary,
    ) -> LessonResult {
        let unit = key.as_str();
        let session = self.ports.session.clone();
        let raw = match self
            .settings
            .retry
            .run("read_lesson", unit, || session.read_lesson(class_id, row))
            .await
        {
            Ok(raw) => raw,
            Err(RetryError::Fatal(err @ StepError::IdentityMismatch(_))) => {
                return LessonResult::AbortClass(err);
            }
            Err(RetryError::Fatal(err @ StepError::Auth(_))) => {
                return LessonResult::SessionLost(err);
            }
            Err(err) => {
                tracing::warn!(unit, reason = %err, "lesson unreadable; marking errored");
                return LessonResult::Done { has_errors: true };
            }
        };

        let problems = self.ports.links.audit(&raw).await;
        for problem in &problems {
            tracing::warn!(unit, %problem, "unreachable link");
        }
        summary.broken_links += problems.len();

        let extracted = extraction::extract_with_fallback(
            self.ports.extraction.as_ref(),
            &self.settings.retry,
            &self.settings.rate_limit,
            unit,
            &raw.report_text,
        )
        .await;
        if extracted.degraded {
            summary.degraded_payloads += 1;
        }
        let mut has_errors = extracted.degraded || !problems.is_empty();
        let mut payload = extracted.payload;
        extraction::enrich_payload(
            &mut payload,
            &LessonContext {
                class_code: &detail.class_code,
                course_name: course,
                lesson_number: &row.lesson_number,
                raw: &raw,
            },
        );

        let ledger_row = LedgerRow {
            class_id: class_id.to_owned(),
            class_code: detail.class_code.clone(),
            course_name: course.to_owned(),
            lesson_number: row.lesson_number.clone(),
            report_reference: raw.report_reference.clone().unwrap_or_default(),
            homework: raw.homework.clone(),
            payload: payload.to_string(),
            status: LessonStatus::from_errors(has_errors).as_str().to_owned(),
        };

        match gate.publish(&ledger_row).await {
            PublishOutcome::Appended => summary.lessons_published += 1,
            PublishOutcome::AlreadyPresent => summary.lessons_skipped += 1,
            PublishOutcome::Failed(_) => {
                summary.publish_failures += 1;
                has_errors = true;
            }
        }
        LessonResult::Done { has_errors }
    }

    async fn abandon_class(&mut self, course: &str, class_id: &str, summary: &mut RunSummary) {
        self.checkpoint.state_mut().mark_errored(course, class_id);
        self.checkpoint.save().await;
        summary.classes_errored += 1;
    }
}

fn into_step_error(err: RetryError) -> StepError {
    match err {
        RetryError::Fatal(err) => err,
        exhausted @ RetryError::Exhausted { .. } => StepError::Other(anyhow::Error::new(exhausted)),
    }
}

fn verify_identity(course: &str, class_id: &str, detail: ClassDetail) -> Result<ClassDetail, StepError> {
    if detail.course_name.trim() != course.trim() {
        return Err(StepError::identity_mismatch(format!(
            "class {class_id} belongs to {:?}, expected {course:?}",
            detail.course_name
        )));
    }
    if detail.class_code.trim().is_empty() {
        return Err(StepError::identity_mismatch(format!(
            "class {class_id} has no class code"
        )));
    }
    Ok(detail)
}

fn warn_on_repeated_labels(class_id: &str, lessons: &[LessonRow]) {
    let mut seen = HashSet::new();
    for row in lessons {
        if !seen.insert(row.lesson_number.as_str()) {
            tracing::warn!(
                class_id,
                lesson_number = %row.lesson_number,
                index = row.index,
                "lesson label repeats within class; later rows dedup against the first"
            );
        }
    }
}
