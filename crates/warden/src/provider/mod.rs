//! Text generation backends.
//!
//! The pipeline only ever asks for one thing: text for a prompt and an
//! optional system prompt. [`TextGenerator`] is that seam. Async closures
//! implement it directly, which is how tests script model responses:
//!
//! ```
//! use warden::provider::{ProviderError, TextGenerator};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let echo = |prompt: String, _system: Option<String>| async move {
//!     Ok::<_, ProviderError>(prompt.to_uppercase())
//! };
//! assert_eq!(echo.generate("hi", None).await.unwrap(), "HI");
//! # });
//! ```

mod offline;
mod openai;

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

pub use offline::OfflineGenerator;
pub use openai::OpenAiGenerator;

/// Errors from a text generation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The request did not complete
    #[error("transport error: {0}")]
    Transport(String),
    /// The backend answered with a non-success status
    #[error("provider returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
    /// The response body was not in the expected shape
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    /// No API key in the configured environment variable
    #[error("no API key found in ${0}")]
    MissingApiKey(String),
}

/// Generates text for a prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `prompt`, optionally steered by
    /// `system_prompt`.
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
impl<F, Fut> TextGenerator for F
where
    F: Fn(String, Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ProviderError>> + Send,
{
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, ProviderError> {
        self(prompt.to_string(), system_prompt.map(str::to_string)).await
    }
}
