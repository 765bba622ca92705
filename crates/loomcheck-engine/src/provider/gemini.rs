use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use super::{error_body, GenerateRequest, GenerateResponse, ModelTransport};
use crate::cancel::CancelToken;
use crate::error::InspectError;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `generateContent` client. Each `generate` call is one HTTP attempt.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    api_key: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(api_base: &str, api_key: impl Into<String>, timeout: Duration) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_GEMINI_API_BASE.to_string()
            } else {
                api_base.to_string()
            },
            api_key: api_key.into(),
            timeout,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerateRequest) -> Value {
        let parts: Vec<Value> = request.parts.iter().map(|part| part.to_json()).collect();
        json!({
            "systemInstruction": {
                "parts": [{ "text": request.system_instruction }],
            },
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "temperature": request.temperature,
            },
        })
    }

    /// Concatenated text of the first candidate.
    fn extract_text(response_payload: &Value) -> Option<String> {
        let parts = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        let text: String = parts
            .iter()
            .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if text.trim().is_empty() {
            return None;
        }
        Some(text)
    }

    /// Send on a worker thread so a cancelled inspection stops waiting without
    /// holding the caller until the HTTP timeout.
    fn send_cancellable(
        &self,
        endpoint: String,
        payload: Value,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, InspectError> {
        let http = self.http.clone();
        let api_key = self.api_key.clone();
        let timeout = self.timeout;
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let response = http
                .post(&endpoint)
                .query(&[("key", api_key.as_str())])
                .timeout(timeout)
                .json(&payload)
                .send()
                .map_err(|err| {
                    InspectError::Transport(format!("Gemini request failed ({endpoint}): {err}"))
                });
            let _ = sender.send(response);
        });

        loop {
            cancel.check()?;
            match receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(InspectError::Transport(
                        "Gemini request worker exited without a response".to_string(),
                    ))
                }
            }
        }
    }
}

impl ModelTransport for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancelToken,
    ) -> Result<GenerateResponse, InspectError> {
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = Self::build_payload(request);
        let response = self.send_cancellable(endpoint, payload, cancel)?;
        let response_payload = response_json_or_error(response)?;
        let text = Self::extract_text(&response_payload).ok_or(InspectError::EmptyResponse)?;
        Ok(GenerateResponse {
            text,
            usage: response_payload.get("usageMetadata").cloned(),
        })
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, InspectError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| InspectError::Transport(format!("Gemini response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(InspectError::from_status(code, error_body::describe(&body)));
    }
    serde_json::from_str(&body).map_err(|err| {
        InspectError::Transport(format!("Gemini returned invalid JSON payload: {err}"))
    })
}
