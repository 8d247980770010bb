//! Reachability checks for a lesson's report document and homework links.
//!
//! A lesson whose report cannot be exported or whose homework links are dead
//! is still published, but with `Has Errors` status.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::extraction;
use crate::formats::RawLesson;

pub const DOCS_BASE: &str = "https://docs.google.com";

#[async_trait]
pub trait LinkChecker: Send + Sync {
    /// One human-readable problem per unreachable link; empty when all is well.
    async fn audit(&self, lesson: &RawLesson) -> Vec<String>;
}

/// Skips every check (offline runs).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLinkChecker;

#[async_trait]
impl LinkChecker for NoopLinkChecker {
    async fn audit(&self, _lesson: &RawLesson) -> Vec<String> {
        Vec::new()
    }
}

/// Sends `HEAD` requests, following redirects.
#[derive(Debug, Clone)]
pub struct HttpLinkChecker {
    http: reqwest::Client,
    docs_base: String,
}

impl HttpLinkChecker {
    /// `docs_base` is where Google Docs export URLs are sent.
    pub fn new(docs_base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build link-check http client")?;
        Ok(Self {
            http,
            docs_base: docs_base.trim_end_matches('/').to_owned(),
        })
    }

    async fn head(&self, url: &str) -> Result<u16, String> {
        self.http
            .head(url)
            .send()
            .await
            .map(|response| response.status().as_u16())
            .map_err(|err| err.to_string())
    }

    /// The report must be a Google Docs document whose export is reachable
    /// without signing in.
    pub async fn check_report(&self, reference: &str) -> Result<(), String> {
        if !reference.contains("docs.google.com/document") {
            return Err("not a Google Docs URL".to_owned());
        }
        let doc_id =
            extraction::parse_doc_id(reference).ok_or_else(|| "no document id".to_owned())?;
        let export = format!("{}/document/d/{doc_id}/export?format=pdf", self.docs_base);
        match self.head(&export).await? {
            200 => Ok(()),
            401 | 403 => Err("requires authentication".to_owned()),
            404 => Err("deleted or not found".to_owned()),
            status => Err(format!("HTTP {status}")),
        }
    }

    pub async fn check_link(&self, url: &str) -> Result<(), String> {
        match self.head(url).await? {
            200 => Ok(()),
            status => Err(format!("HTTP {status}")),
        }
    }
}

/// Google-hosted homework attachments sit behind sign-in; they are not checked.
fn is_google_hosted(url: &str) -> bool {
    url.contains("docs.google.com") || url.contains("drive.google.com")
}

#[async_trait]
impl LinkChecker for HttpLinkChecker {
    async fn audit(&self, lesson: &RawLesson) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(reference) = lesson
            .report_reference
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            && let Err(reason) = self.check_report(reference).await
        {
            problems.push(format!("report {reference}: {reason}"));
        }
        for url in lesson.links.iter().filter(|url| !is_google_hosted(url)) {
            if let Err(reason) = self.check_link(url).await {
                problems.push(format!("link {url}: {reason}"));
            }
        }
        problems
    }
}
