pub mod error_body;
mod gemini;

use serde_json::{json, Value};

use crate::cancel::CancelToken;
use crate::error::InspectError;

pub use gemini::{GeminiClient, DEFAULT_GEMINI_API_BASE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineImage { mime_type: String, data: String },
}

impl ContentPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => json!({ "text": text }),
            Self::InlineImage { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": data,
                }
            }),
        }
    }
}

/// One multimodal generation call: a system instruction plus an ordered
/// sequence of user parts.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub system_instruction: String,
    pub parts: Vec<ContentPart>,
    pub temperature: f64,
}

impl GenerateRequest {
    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, ContentPart::InlineImage { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub text: String,
    pub usage: Option<Value>,
}

/// A model backend. Implementations perform a single attempt; retrying is
/// the caller's business.
pub trait ModelTransport: Send + Sync {
    fn name(&self) -> &str;

    fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancelToken,
    ) -> Result<GenerateResponse, InspectError>;
}
