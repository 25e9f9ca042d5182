use std::io::{BufRead, BufReader};
use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::{ApiKey, InlineImage, ModelGateway, ModelReply};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const API_KEY_HEADER: &str = "x-goog-api-key";
const ERROR_BODY_MAX_CHARS: usize = 512;

pub struct GeminiGateway {
    api_base: String,
    api_key: Option<ApiKey>,
    model: String,
    http: HttpClient,
}

impl GeminiGateway {
    pub fn new(
        api_base: &str,
        api_key: Option<ApiKey>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let api_base = Some(api_base.trim().trim_end_matches('/'))
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_GEMINI_API_BASE)
            .to_string();
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Transport(error_chain_text(&err, ERROR_BODY_MAX_CHARS)))?;
        Ok(Self {
            api_base,
            api_key,
            model: model.trim().to_string(),
            http,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:{method}", self.api_base, model_path)
    }

    fn api_key(&self) -> Result<&str, GatewayError> {
        self.api_key
            .as_ref()
            .map(ApiKey::expose)
            .ok_or_else(|| GatewayError::MissingApiKey("gemini".to_string()))
    }

    fn post(&self, endpoint: &str, query: &[(&str, &str)], payload: &Value) -> Result<HttpResponse, GatewayError> {
        let api_key = self.api_key()?;
        debug!(endpoint, "gemini request");
        let response = self
            .http
            .post(endpoint)
            .query(query)
            .header(API_KEY_HEADER, api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .map_err(|err| GatewayError::Transport(error_chain_text(&err, ERROR_BODY_MAX_CHARS)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(GatewayError::Status {
            code: status.as_u16(),
            body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
        })
    }
}

impl ModelGateway for GeminiGateway {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn analyze(&self, prompt: &str, images: &[InlineImage]) -> Result<ModelReply, GatewayError> {
        let endpoint = self.endpoint("generateContent");
        let response = self.post(&endpoint, &[], &build_payload(prompt, images))?;
        let body = response
            .text()
            .map_err(|err| GatewayError::Transport(error_chain_text(&err, ERROR_BODY_MAX_CHARS)))?;
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|err| GatewayError::InvalidPayload(err.to_string()))?;
        Ok(ModelReply::from_text(
            extract_text(&parsed),
            empty_reason(&parsed),
        ))
    }

    fn analyze_streamed(
        &self,
        prompt: &str,
        images: &[InlineImage],
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<ModelReply, GatewayError> {
        let endpoint = self.endpoint("streamGenerateContent");
        let response = self.post(&endpoint, &[("alt", "sse")], &build_payload(prompt, images))?;

        let mut text = String::new();
        let mut reason = None;
        read_sse_events(BufReader::new(response), |event| {
            if let Some(err) = stream_error(&event) {
                return Err(err);
            }
            let fragment = extract_text(&event);
            if !fragment.is_empty() {
                on_fragment(&fragment);
                text.push_str(&fragment);
            }
            if let Some(found) = empty_reason(&event) {
                reason = Some(found);
            }
            Ok(())
        })?;
        Ok(ModelReply::from_text(text, reason))
    }
}

pub(crate) fn build_payload(prompt: &str, images: &[InlineImage]) -> Value {
    let mut parts = images
        .iter()
        .map(|image| {
            json!({
                "inlineData": {
                    "mimeType": image.mime,
                    "data": image.data_base64,
                }
            })
        })
        .collect::<Vec<Value>>();
    parts.push(json!({ "text": prompt }));
    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }]
    })
}

/// Concatenate the text parts of the first candidate, skipping thought summaries.
pub(crate) fn extract_text(payload: &Value) -> String {
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = String::new();
    for part in parts {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    out
}

pub(crate) fn empty_reason(payload: &Value) -> Option<String> {
    if let Some(block) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Some(block.to_string());
    }
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str)
        .filter(|reason| *reason != "STOP")
        .map(str::to_string)
}

fn stream_error(event: &Value) -> Option<GatewayError> {
    let error = event.get("error")?.as_object()?;
    let code = error
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or(500);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("stream error");
    Some(GatewayError::Status {
        code,
        body: truncate_text(message, ERROR_BODY_MAX_CHARS),
    })
}

/// Decode a `text/event-stream` body, handing each `data:` payload to `on_event` as JSON.
pub(crate) fn read_sse_events<R, F>(reader: R, mut on_event: F) -> Result<(), GatewayError>
where
    R: BufRead,
    F: FnMut(Value) -> Result<(), GatewayError>,
{
    let mut data = String::new();
    for line in reader.lines() {
        let line = line.map_err(|err| GatewayError::Transport(err.to_string()))?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            dispatch_sse_data(&mut data, &mut on_event)?;
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    dispatch_sse_data(&mut data, &mut on_event)
}

fn dispatch_sse_data<F>(data: &mut String, on_event: &mut F) -> Result<(), GatewayError>
where
    F: FnMut(Value) -> Result<(), GatewayError>,
{
    if data.trim().is_empty() {
        data.clear();
        return Ok(());
    }
    let parsed: Value = serde_json::from_str(data)
        .map_err(|err| GatewayError::InvalidPayload(err.to_string()))?;
    data.clear();
    on_event(parsed)
}

fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && !parts
                .last()
                .map(|existing| existing == trimmed)
                .unwrap_or(false)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
