//! Error taxonomy for the generation backend, the conversation store and
//! the request pipeline that ties them together.

use std::time::Duration;

use thiserror::Error;

use crate::domain::ImageRefError;

/// Outcome of a single call to the generation backend.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GenerationError {
  #[error("generation backend is rate limiting requests")]
  RateLimited,
  #[error("generation backend returned HTTP {status}: {message}")]
  Http { status: u16, message: String },
  #[error("malformed generation response: {0}")]
  Malformed(String),
  #[error("generation request timed out")]
  TimedOut,
  #[error("generation transport error: {0}")]
  Transport(String),
  #[error("generation backend unavailable: {0}")]
  Unavailable(String),
}

/// The request URL is stripped first: it can carry an API key as a query parameter.
impl From<reqwest::Error> for GenerationError {
  fn from(e: reqwest::Error) -> Self {
    let e = e.without_url();
    if e.is_timeout() {
      GenerationError::TimedOut
    } else if e.is_decode() {
      GenerationError::Malformed(e.to_string())
    } else {
      GenerationError::Transport(e.to_string())
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
  #[error("conversation {0} not found")]
  NotFound(String),
  #[error("conversation {0} belongs to another user")]
  Forbidden(String),
  #[error("invalid conversation data: {0}")]
  Invalid(String),
  #[error("conversation store unavailable: {0}")]
  Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PipelineError {
  #[error("a prompt or an image is required")]
  EmptyPrompt,
  #[error("invalid image: {0}")]
  InvalidImage(#[from] ImageRefError),
  #[error("too many pending requests (limit {limit}); wait for the current reply")]
  QueueFull { limit: usize },
  #[error("rate limit exceeded after {attempts} attempts; please try again later")]
  RateLimitExhausted { attempts: u32 },
  #[error("the AI assistant took longer than {0:?} to respond")]
  TimedOut(Duration),
  #[error("failed to get a response from the AI assistant: {0}")]
  Backend(GenerationError),
  #[error("request dropped because an earlier request exhausted its retries")]
  Discarded,
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error("conversation session is closed")]
  SessionClosed,
}
