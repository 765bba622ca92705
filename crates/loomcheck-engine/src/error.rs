use loomcheck_contracts::extraction::ExtractError;
use thiserror::Error;

use crate::cancel::Cancelled;
use crate::images::NormalizeError;
use crate::provider::error_body;

pub const RATE_LIMITED: u16 = 429;
pub const SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("model API key is not configured (set GEMINI_API_KEY or pass --api-key)")]
    MissingApiKey,
    #[error("no inspection images were supplied")]
    NoImages,
    #[error("invalid inspection request: {0}")]
    InvalidRequest(String),
    #[error("inspection image {index} could not be used: {source}")]
    Image {
        index: usize,
        #[source]
        source: NormalizeError,
    },
    #[error("model provider is temporarily unavailable ({status_code}): {message}")]
    Transient { status_code: u16, message: String },
    #[error("model provider rejected the request ({status_code}): {message}")]
    Permanent { status_code: u16, message: String },
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error(transparent)]
    Extraction(#[from] ExtractError),
    #[error("inspection cancelled")]
    Cancelled,
}

impl From<Cancelled> for InspectError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl InspectError {
    /// Typed HTTP status classification at the provider boundary: only rate
    /// limiting and service-unavailable are worth another attempt.
    pub fn from_status(status_code: u16, message: String) -> Self {
        if matches!(status_code, RATE_LIMITED | SERVICE_UNAVAILABLE) {
            Self::Transient {
                status_code,
                message,
            }
        } else {
            Self::Permanent {
                status_code,
                message,
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Transient { status_code, .. } | Self::Permanent { status_code, .. } => {
                Some(*status_code)
            }
            _ => None,
        }
    }

    pub fn is_quota_exhausted(&self) -> bool {
        match self {
            Self::Transient {
                status_code,
                message,
            }
            | Self::Permanent {
                status_code,
                message,
            } => *status_code == RATE_LIMITED || error_body::is_quota_exhausted(message),
            Self::Transport(message) => error_body::is_quota_exhausted(message),
            _ => false,
        }
    }

    /// Single human-readable line for operators. Quota exhaustion gets its
    /// own wording.
    pub fn user_message(&self) -> String {
        if self.is_quota_exhausted() {
            return error_body::USAGE_LIMIT_MESSAGE.to_string();
        }
        match self {
            Self::Extraction(_) => format!(
                "{self}. The inspection was not saved; run the analysis again."
            ),
            _ => self.to_string(),
        }
    }
}
