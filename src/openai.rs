use reqwest::StatusCode;

use crate::error::StepError;

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

pub async fn responses_text(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    model: &str,
    instructions: &str,
    input: &str,
    temperature: f32,
) -> Result<String, StepError> {
    let mut body = serde_json::json!({
        "model": model,
        "instructions": instructions,
        "input": input,
        "text": { "format": { "type": "text" } },
        "store": false,
    });

    // GPT-5 models reject sampling params like `temperature`.
    if !model.starts_with("gpt-5")
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert("temperature".to_owned(), serde_json::json!(temperature));
    }

    let response = client
        .post(endpoint)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .map_err(|err| StepError::transient(format!("POST {endpoint}: {err}")))?;

    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|err| StepError::transient(format!("read OpenAI response body: {err}")))?;
    if !status.is_success() {
        let (code, message) = parse_error(&raw).unwrap_or_else(|| (None, raw.clone()));
        let message = format!("OpenAI API error ({status}): {message}");
        if status == StatusCode::TOO_MANY_REQUESTS || code.as_deref() == Some("insufficient_quota")
        {
            return Err(StepError::rate_limited(message));
        }
        if status.is_server_error() {
            return Err(StepError::transient(message));
        }
        return Err(StepError::Other(anyhow::anyhow!(message)));
    }

    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| StepError::Other(anyhow::anyhow!("parse OpenAI response: {err}")))?;
    extract_output_text(&value).map_err(StepError::Other)
}

fn parse_error(raw_json: &str) -> Option<(Option<String>, String)> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let error = value.get("error")?;
    let message = error.get("message")?.as_str()?.to_owned();
    let code = error
        .get("code")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    Some((code, message))
}

fn extract_output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let mut text = String::new();
    for item in output {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let Some(content) = item.get("content").and_then(|v| v.as_array()) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(|v| v.as_str()) != Some("output_text") {
                continue;
            }
            let Some(part_text) = part.get("text").and_then(|v| v.as_str()) else {
                continue;
            };
            text.push_str(part_text);
        }
    }

    if text.trim().is_empty() {
        anyhow::bail!("OpenAI output text is empty");
    }
    Ok(text)
}
