use std::fmt;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::StepError;
use crate::formats::LedgerRow;
use crate::ledger::LedgerClient;

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/";

/// Ledger stored in a Google Sheets worksheet, accessed through the values API.
#[derive(Clone)]
pub struct SheetsLedger {
    http: reqwest::Client,
    base_url: Url,
    spreadsheet_id: String,
    sheet_name: String,
    token: String,
}

impl fmt::Debug for SheetsLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetsLedger")
            .field("base_url", &self.base_url)
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("sheet_name", &self.sheet_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl SheetsLedger {
    pub fn new(
        base_url: &str,
        spreadsheet_id: impl Into<String>,
        sheet_name: impl Into<String>,
        token: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("parse sheets base url: {base_url}"))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("lessonsync/0.1")
            .build()
            .context("build sheets http client")?;
        Ok(Self {
            http,
            base_url,
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: sheet_name.into(),
            token: token.into(),
        })
    }

    fn values_url(&self, suffix: &str) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("sheets base url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values"])
            .push(&format!("{}{suffix}", self.sheet_name));
        Ok(url)
    }

    fn fetch_url(&self) -> anyhow::Result<Url> {
        self.values_url("")
    }

    fn append_url(&self) -> anyhow::Result<Url> {
        let mut url = self.values_url(":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        Ok(url)
    }
}

#[async_trait]
impl LedgerClient for SheetsLedger {
    async fn fetch_rows(&self) -> Result<Vec<LedgerRow>, StepError> {
        let url = self.fetch_url()?;
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| StepError::transient(format!("GET {url}: {err}")))?;
        let raw = check_status(response).await?;

        let range: ValueRange = serde_json::from_str(&raw)
            .context("parse sheets values response")
            .map_err(StepError::Other)?;
        let rows = range
            .values
            .iter()
            .filter_map(|cells| {
                let cells: Vec<String> = cells.iter().map(cell_text).collect();
                LedgerRow::from_cells(&cells)
            })
            .collect();
        Ok(rows)
    }

    async fn append_row(&self, row: &LedgerRow) -> Result<(), StepError> {
        let url = self.append_url()?;
        let body = serde_json::json!({ "values": [row.to_cells()] });
        let response = self
            .http
            .post(url.clone())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|err| StepError::transient(format!("POST {url}: {err}")))?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<String, StepError> {
    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|err| StepError::transient(format!("read sheets response: {err}")))?;
    if status.is_success() {
        return Ok(raw);
    }
    let message = format!("sheets API error ({status}): {raw}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(StepError::transient(message))
    } else {
        Err(StepError::Other(anyhow::anyhow!(message)))
    }
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
