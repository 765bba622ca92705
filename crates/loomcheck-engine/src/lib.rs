pub mod cancel;
pub mod config;
pub mod error;
pub mod images;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod retry;

pub use cancel::{CancelToken, Cancelled};
pub use config::Config;
pub use error::InspectError;
pub use images::{ImageLimits, ImageSource, NormalizeError, NormalizedImage};
pub use pipeline::{InspectionOutcome, InspectionPipeline};
pub use provider::{ContentPart, GeminiClient, GenerateRequest, GenerateResponse, ModelTransport};
pub use request::ReferenceStandards;
pub use retry::{retry_with_backoff, RetryPolicy};
