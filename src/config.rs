//! YAML run configuration. Secrets are never read from the file; they come
//! from the environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::extraction::{ExtractionService, NoopExtractor, OpenAiExtractor};
use crate::ledger::{JsonlLedger, LedgerClient, SheetsLedger, sheets};
use crate::links::{self, HttpLinkChecker, LinkChecker, NoopLinkChecker};
use crate::manifest::Manifest;
use crate::notify::{self, LogNotifier, NotificationSink, TelegramNotifier};
use crate::pipeline::{PipelineSettings, Ports};
use crate::retry::{RateLimitBackoff, RetryPolicy};
use crate::session::SnapshotDriver;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const LEDGER_TOKEN_ENV: &str = "LESSONSYNC_LEDGER_TOKEN";
pub const TELEGRAM_BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";
pub const TELEGRAM_CHAT_ID_ENV: &str = "TELEGRAM_CHAT_ID";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Class manifest (`classes.jsonl`).
    pub manifest: PathBuf,
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,
    pub session: SessionConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub links: LinksConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_checkpoint() -> PathBuf {
    PathBuf::from("processed_classes.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Directory of `<class_id>.json` snapshots written by the scraper.
    pub snapshots_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerConfig {
    Sheets {
        spreadsheet_id: String,
        sheet_name: String,
        #[serde(default = "default_sheets_base_url")]
        base_url: String,
    },
    Jsonl {
        path: PathBuf,
    },
}

fn default_sheets_base_url() -> String {
    sheets::SHEETS_API_BASE.to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionEngine {
    Openai,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractionConfig {
    pub engine: ExtractionEngine,
    pub base_url: String,
    /// Backends in preference order.
    pub models: Vec<String>,
    pub temperature: f32,
    pub instructions_file: Option<PathBuf>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            engine: ExtractionEngine::Openai,
            base_url: "https://api.openai.com/v1".to_owned(),
            models: vec!["gpt-4.1-mini".to_owned(), "gpt-4.1".to_owned()],
            temperature: 0.0,
            instructions_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkCheckKind {
    Http,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinksConfig {
    pub check: LinkCheckKind,
    /// Where report export URLs are sent.
    pub docs_base_url: String,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            check: LinkCheckKind::Http,
            docs_base_url: links::DOCS_BASE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    Telegram,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    pub base_url: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::Log,
            base_url: notify::TELEGRAM_API_BASE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub classes_per_course: usize,
    pub max_units_per_run: usize,
    /// Total attempts per collaborator call.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub login_attempts: u32,
    pub login_delay_ms: u64,
    pub rate_limit_base_ms: u64,
    pub rate_limit_max_ms: u64,
    pub rate_limit_jitter_ms: u64,
    pub refresh_before_append: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classes_per_course: 3,
            max_units_per_run: 50,
            max_retries: 3,
            retry_delay_ms: 2_000,
            login_attempts: 3,
            login_delay_ms: 5_000,
            rate_limit_base_ms: 30_000,
            rate_limit_max_ms: 300_000,
            rate_limit_jitter_ms: 5_000,
            refresh_before_append: true,
        }
    }
}

impl PipelineConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            classes_per_course: self.classes_per_course,
            max_units_per_run: self.max_units_per_run,
            retry: RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms)),
            login: RetryPolicy::new(
                self.login_attempts,
                Duration::from_millis(self.login_delay_ms),
            ),
            rate_limit: RateLimitBackoff {
                base: Duration::from_millis(self.rate_limit_base_ms),
                max: Duration::from_millis(self.rate_limit_max_ms),
                max_jitter: Duration::from_millis(self.rate_limit_jitter_ms),
            },
            refresh_before_append: self.refresh_before_append,
        }
    }
}

/// Loads and validates a config file. Relative paths inside it are resolved
/// against the file's directory.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let mut config: Config =
        serde_yaml::from_str(&contents).with_context(|| format!("parse config: {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);
    validate(&config)?;
    Ok(config)
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl Config {
    fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.manifest);
        resolve(base, &mut self.checkpoint);
        resolve(base, &mut self.session.snapshots_dir);
        if let LedgerConfig::Jsonl { path } = &mut self.ledger {
            resolve(base, path);
        }
        if let Some(path) = &mut self.extraction.instructions_file {
            resolve(base, path);
        }
    }

    pub fn ledger_client(&self) -> anyhow::Result<Arc<dyn LedgerClient>> {
        let client: Arc<dyn LedgerClient> = match &self.ledger {
            LedgerConfig::Sheets {
                spreadsheet_id,
                sheet_name,
                base_url,
            } => {
                let token = require_env(LEDGER_TOKEN_ENV)?;
                Arc::new(SheetsLedger::new(base_url, spreadsheet_id, sheet_name, token)?)
            }
            LedgerConfig::Jsonl { path } => Arc::new(JsonlLedger::new(path)),
        };
        Ok(client)
    }

    pub fn extraction_service(&self) -> anyhow::Result<Arc<dyn ExtractionService>> {
        let cfg = &self.extraction;
        let service: Arc<dyn ExtractionService> = match cfg.engine {
            ExtractionEngine::Noop => Arc::new(NoopExtractor),
            ExtractionEngine::Openai => {
                let api_key = require_env(OPENAI_API_KEY_ENV)?;
                let mut extractor =
                    OpenAiExtractor::new(&cfg.base_url, api_key, cfg.models.clone(), cfg.temperature)?;
                if let Some(path) = &cfg.instructions_file {
                    let instructions = std::fs::read_to_string(path)
                        .with_context(|| format!("read instructions: {}", path.display()))?;
                    extractor = extractor.with_instructions(instructions);
                }
                Arc::new(extractor)
            }
        };
        Ok(service)
    }

    pub fn link_checker(&self) -> anyhow::Result<Arc<dyn LinkChecker>> {
        let checker: Arc<dyn LinkChecker> = match self.links.check {
            LinkCheckKind::Noop => Arc::new(NoopLinkChecker),
            LinkCheckKind::Http => Arc::new(HttpLinkChecker::new(&self.links.docs_base_url)?),
        };
        Ok(checker)
    }

    pub fn notifier(&self) -> anyhow::Result<Arc<dyn NotificationSink>> {
        let sink: Arc<dyn NotificationSink> = match self.notify.kind {
            NotifyKind::Log => Arc::new(LogNotifier),
            NotifyKind::Telegram => {
                let token = require_env(TELEGRAM_BOT_TOKEN_ENV)?;
                let chat_id = require_env(TELEGRAM_CHAT_ID_ENV)?;
                Arc::new(TelegramNotifier::new(&self.notify.base_url, token, chat_id)?)
            }
        };
        Ok(sink)
    }

    pub fn ports(&self, manifest: &Manifest) -> anyhow::Result<Ports> {
        Ok(Ports {
            session: Arc::new(SnapshotDriver::new(
                &self.session.snapshots_dir,
                manifest.candidates().to_vec(),
            )),
            extraction: self.extraction_service().context("configure extraction")?,
            ledger: self.ledger_client().context("configure ledger")?,
            links: self.link_checker().context("configure link checks")?,
            notifier: self.notifier().context("configure notifications")?,
        })
    }
}

fn require_env(name: &str) -> anyhow::Result<String> {
    let value = std::env::var(name).with_context(|| format!("{name} is not set"))?;
    if value.trim().is_empty() {
        anyhow::bail!("{name} is empty");
    }
    Ok(value)
}

pub fn validate(config: &Config) -> anyhow::Result<()> {
    let p = &config.pipeline;
    if p.classes_per_course == 0 {
        anyhow::bail!("pipeline.classes_per_course must be > 0");
    }
    if p.max_units_per_run == 0 {
        anyhow::bail!("pipeline.max_units_per_run must be > 0");
    }
    if p.max_retries == 0 {
        anyhow::bail!("pipeline.max_retries must be > 0");
    }
    if p.login_attempts == 0 {
        anyhow::bail!("pipeline.login_attempts must be > 0");
    }
    if p.rate_limit_max_ms < p.rate_limit_base_ms {
        anyhow::bail!("pipeline.rate_limit_max_ms must be >= pipeline.rate_limit_base_ms");
    }

    if config.extraction.engine == ExtractionEngine::Openai {
        if config.extraction.models.iter().all(|m| m.trim().is_empty()) {
            anyhow::bail!("extraction.models must list at least one model");
        }
        if !(0.0..=2.0).contains(&config.extraction.temperature) {
            anyhow::bail!("extraction.temperature must be within 0.0..=2.0");
        }
    }

    if let LedgerConfig::Sheets {
        spreadsheet_id,
        sheet_name,
        ..
    } = &config.ledger
    {
        if spreadsheet_id.trim().is_empty() {
            anyhow::bail!("ledger.spreadsheet_id must be non-empty");
        }
        if sheet_name.trim().is_empty() {
            anyhow::bail!("ledger.sheet_name must be non-empty");
        }
    }
    Ok(())
}

/// A commented starting point for `lessonsync.yaml`.
pub fn example() -> &'static str {
    r#"manifest: classes.jsonl
checkpoint: processed_classes.json

session:
  snapshots_dir: snapshots

ledger:
  kind: sheets
  spreadsheet_id: "YOUR_SPREADSHEET_ID"
  sheet_name: "Report"

extraction:
  engine: openai
  models: [gpt-4.1-mini, gpt-4.1]

links:
  check: http

notify:
  kind: telegram

pipeline:
  classes_per_course: 3
  max_units_per_run: 50
  max_retries: 3
  retry_delay_ms: 2000
"#
}
