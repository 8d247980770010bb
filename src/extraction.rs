//! Structured extraction of lesson reports.
//!
//! Backends are tried in order. Rate limits move on to the next backend;
//! once every backend has refused, one delayed attempt is made against the
//! preferred backend before falling back to [`default_payload`].

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use url::Url;

use crate::error::StepError;
use crate::formats::RawLesson;
use crate::openai;
use crate::retry::{RateLimitBackoff, RetryError, RetryPolicy};

pub const CANNOT_FIND_INFO: &str = "cannot find info";

pub const DEFAULT_INSTRUCTIONS: &str = r#"Extract structured data from the provided text (a lesson plan document). Ignore any "Comments" section entirely so that no personal student information is stored. Output a JSON object with the following fields:
- class_name: String, e.g. "Kindergarten 1 - KG1R".
- lesson_unit: String, e.g. "Unit 33 (1st)".
- lesson_date: String, format YYYY-MM-DD.
- learning_objectives: Object { vocabulary_review: { theme, words: [{english, vietnamese}], count }, vocabulary_new: { theme, words, count }, pronunciation: { sound, words, count }, phonics: String }.
- warm_up: Object { description: String, videos: [{title, url}] }.
- homework_check: String, summarised without student names.
- running_content: Object { theme, review_vocabulary: { link, words, structure, examples: [String], activities } }.
- new_vocabulary: Object { theme, words, link, activities }.
- phonics: Object { letter, words, link, activities, videos: [{title, url}] }.
- homework: Array of Strings.
- links_all: Array of {context, url, type} where type is "youtube" for youtube.com, "quizlet" for quizlet.com, else "other".

Preserve all text accurately, including Vietnamese translations. Return only the JSON object, no additional text."#;

#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Backend names in preference order.
    fn available_backends(&self) -> Vec<String>;
    async fn extract(&self, backend: &str, raw_text: &str) -> Result<Value, StepError>;
}

/// Extraction through an OpenAI-compatible `/responses` endpoint. Each
/// backend is a model name.
pub struct OpenAiExtractor {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    models: Vec<String>,
    instructions: String,
    temperature: f32,
}

impl std::fmt::Debug for OpenAiExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiExtractor")
            .field("endpoint", &self.endpoint)
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl OpenAiExtractor {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        models: Vec<String>,
        temperature: f32,
    ) -> anyhow::Result<Self> {
        if models.is_empty() {
            anyhow::bail!("at least one extraction model is required");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("build openai http client")?;
        Ok(Self {
            client,
            endpoint: openai::responses_endpoint(base_url),
            api_key: api_key.into(),
            models,
            instructions: DEFAULT_INSTRUCTIONS.to_owned(),
            temperature,
        })
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

#[async_trait]
impl ExtractionService for OpenAiExtractor {
    fn available_backends(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn extract(&self, backend: &str, raw_text: &str) -> Result<Value, StepError> {
        let text = openai::responses_text(
            &self.client,
            &self.endpoint,
            &self.api_key,
            backend,
            &self.instructions,
            raw_text,
            self.temperature,
        )
        .await?;
        parse_payload(&text).map_err(StepError::Other)
    }
}

/// Offline engine: no model call, the raw text rides along in the default
/// payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtractor;

#[async_trait]
impl ExtractionService for NoopExtractor {
    fn available_backends(&self) -> Vec<String> {
        vec!["noop".to_owned()]
    }

    async fn extract(&self, _backend: &str, raw_text: &str) -> Result<Value, StepError> {
        let mut payload = default_payload();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("raw_text".to_owned(), Value::String(raw_text.to_owned()));
        }
        Ok(payload)
    }
}

/// Parses model output into a JSON object, tolerating Markdown code fences.
pub fn parse_payload(text: &str) -> anyhow::Result<Value> {
    let text = strip_code_fence(text);
    let value: Value = serde_json::from_str(text).context("parse extraction output as json")?;
    if !value.is_object() {
        anyhow::bail!("extraction output is not a json object");
    }
    Ok(value)
}

fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(inner) = text.strip_prefix("```").and_then(|t| t.strip_suffix("```")) else {
        return text;
    };
    inner.strip_prefix("json").unwrap_or(inner).trim()
}

/// The payload published when extraction is impossible.
pub fn default_payload() -> Value {
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    json!({
        "class_name": CANNOT_FIND_INFO,
        "lesson_unit": CANNOT_FIND_INFO,
        "lesson_date": today,
        "learning_objectives": {
            "vocabulary_review": { "theme": "", "words": [], "count": 0 },
            "vocabulary_new": { "theme": "", "words": [], "count": 0 },
            "pronunciation": { "sound": "", "words": [], "count": 0 },
            "phonics": ""
        },
        "warm_up": { "description": "", "videos": [] },
        "homework_check": CANNOT_FIND_INFO,
        "running_content": {
            "theme": "",
            "review_vocabulary": {
                "link": "", "words": [], "structure": "", "examples": [], "activities": ""
            }
        },
        "new_vocabulary": { "theme": "", "words": [], "link": "", "activities": "" },
        "phonics": { "letter": "", "words": [], "link": "", "activities": "", "videos": [] },
        "homework": [],
        "links_all": []
    })
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub payload: Value,
    /// Backend that produced the payload; `None` for the default payload.
    pub backend: Option<String>,
    pub degraded: bool,
}

impl Extracted {
    fn degraded() -> Self {
        Self {
            payload: default_payload(),
            backend: None,
            degraded: true,
        }
    }
}

/// Runs the backend chain for one unit. Never fails: exhaustion yields the
/// default payload flagged as degraded. Transient failures are retried on
/// the same backend under `policy` before the chain moves on.
pub async fn extract_with_fallback(
    service: &dyn ExtractionService,
    policy: &RetryPolicy,
    backoff: &RateLimitBackoff,
    unit: &str,
    raw_text: &str,
) -> Extracted {
    if raw_text.trim().is_empty() {
        tracing::warn!(unit, "no report text; using default payload");
        return Extracted::degraded();
    }

    let backends = service.available_backends();
    let mut rate_limited = 0u32;
    for (attempt, backend) in backends.iter().enumerate() {
        match extract_once(service, policy, backend, unit, raw_text).await {
            Ok(payload) => {
                tracing::debug!(unit, backend = %backend, "extracted");
                return Extracted {
                    payload,
                    backend: Some(backend.clone()),
                    degraded: false,
                };
            }
            Err(RetryError::Fatal(err)) if err.is_rate_limited() => {
                rate_limited += 1;
                tracing::warn!(
                    unit,
                    backend = %backend,
                    attempt = attempt + 1,
                    reason = %err,
                    "backend rate limited; trying next backend"
                );
            }
            Err(err) => {
                tracing::warn!(
                    unit,
                    backend = %backend,
                    attempt = attempt + 1,
                    reason = %err,
                    "extraction failed; trying next backend"
                );
            }
        }
    }

    if rate_limited > 0
        && let Some(preferred) = backends.first()
    {
        let delay = backoff.delay(rate_limited);
        tracing::info!(
            unit,
            backend = %preferred,
            delay_ms = delay.as_millis() as u64,
            "all backends refused; waiting before final attempt"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match extract_once(service, policy, preferred, unit, raw_text).await {
            Ok(payload) => {
                return Extracted {
                    payload,
                    backend: Some(preferred.clone()),
                    degraded: false,
                };
            }
            Err(err) => {
                tracing::warn!(
                    unit,
                    backend = %preferred,
                    attempt = backends.len() + 1,
                    reason = %err,
                    "final extraction attempt failed"
                );
            }
        }
    }

    tracing::warn!(unit, "extraction exhausted; using default payload");
    Extracted::degraded()
}

async fn extract_once(
    service: &dyn ExtractionService,
    policy: &RetryPolicy,
    backend: &str,
    unit: &str,
    raw_text: &str,
) -> Result<Value, RetryError> {
    policy
        .run("extract", unit, || service.extract(backend, raw_text))
        .await
}

/// Lesson facts merged into every payload regardless of what the model
/// returned.
#[derive(Debug, Clone)]
pub struct LessonContext<'a> {
    pub class_code: &'a str,
    pub course_name: &'a str,
    pub lesson_number: &'a str,
    pub raw: &'a RawLesson,
}

pub fn enrich_payload(payload: &mut Value, ctx: &LessonContext<'_>) {
    if !payload.is_object() {
        *payload = default_payload();
    }
    let Some(obj) = payload.as_object_mut() else {
        return;
    };

    obj.insert("lesson_number".to_owned(), json!(ctx.lesson_number));
    obj.insert(
        "class_name".to_owned(),
        json!(format!("{} - {}", ctx.course_name, ctx.class_code)),
    );
    obj.insert("homework_content".to_owned(), json!(ctx.raw.homework));
    let reference = ctx.raw.report_reference.as_deref().unwrap_or_default();
    obj.insert("report_reference".to_owned(), json!(reference));
    if let Some(doc_id) = ctx.raw.report_reference.as_deref().and_then(parse_doc_id) {
        obj.insert("doc_id".to_owned(), json!(doc_id));
    }

    merge_links(obj, &ctx.raw.links);
}

fn merge_links(obj: &mut Map<String, Value>, raw_links: &[String]) {
    let mut links: Vec<Value> = match obj.remove("links_all") {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    for url in raw_links {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        let known = links
            .iter()
            .any(|link| link.get("url").and_then(Value::as_str) == Some(url));
        if known {
            continue;
        }
        links.push(json!({
            "context": "report link",
            "url": url,
            "type": classify_link(url),
        }));
    }
    obj.insert("links_all".to_owned(), Value::Array(links));
}

pub fn classify_link(url: &str) -> &'static str {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default();
    let matches = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));
    if matches("youtube.com") || matches("youtu.be") {
        "youtube"
    } else if matches("quizlet.com") {
        "quizlet"
    } else {
        "other"
    }
}

/// Google Docs document id from `/document/d/<id>/...` or an `id=` query.
pub fn parse_doc_id(reference: &str) -> Option<String> {
    let url = Url::parse(reference.trim()).ok()?;
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "d"
            && let Some(id) = segments.next()
            && !id.is_empty()
        {
            return Some(id.to_owned());
        }
    }
    url.query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}
