//! Generation backends: the external model that produces chat completions
//! and conversation titles.
//!
//! Provider selection (GENERATION_PROVIDER):
//!   - "openai" : OpenAI-compatible chat.completions
//!   - "gemini" : Google generateContent
//!   - "offline": canned replies, no network
//!   - unset    : first provider with an API key, else offline

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::ImageRef;
use crate::error::GenerationError;

pub mod gemini;
pub mod openai;

pub use gemini::Gemini;
pub use openai::OpenAI;

/// One call to the generation backend.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
  pub prompt: String,
  pub image: Option<ImageRef>,
  pub system: Option<String>,
  /// Short, low-temperature call used to name a conversation.
  pub is_title_request: bool,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
  fn name(&self) -> &'static str;

  /// Produce the completion text. Rate limiting must surface as `GenerationError::RateLimited`.
  async fn generate(&self, req: &GenerationRequest) -> Result<String, GenerationError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
  OpenAI,
  Gemini,
  Offline,
}

impl FromStr for Provider {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "openai" => Ok(Provider::OpenAI),
      "gemini" | "google" => Ok(Provider::Gemini),
      "offline" | "none" => Ok(Provider::Offline),
      other => Err(format!("Unsupported generation provider: '{}'", other)),
    }
  }
}

impl fmt::Display for Provider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Provider::OpenAI => "openai",
      Provider::Gemini => "gemini",
      Provider::Offline => "offline",
    };
    f.write_str(s)
  }
}

/// Build the backend selected by the environment. Never fails: a missing key
/// or unknown provider degrades to the offline backend.
pub fn from_env() -> Arc<dyn GenerationBackend> {
  let requested = match std::env::var("GENERATION_PROVIDER") {
    Ok(raw) => match raw.parse::<Provider>() {
      Ok(p) => Some(p),
      Err(e) => {
        warn!(target: "studyquest", error = %e, "Ignoring GENERATION_PROVIDER");
        None
      }
    },
    Err(_) => None,
  };

  let openai = || OpenAI::from_env().map(|oa| Arc::new(oa) as Arc<dyn GenerationBackend>);
  let gemini = || Gemini::from_env().map(|g| Arc::new(g) as Arc<dyn GenerationBackend>);

  let chosen = match requested {
    Some(Provider::OpenAI) => openai(),
    Some(Provider::Gemini) => gemini(),
    Some(Provider::Offline) => None,
    None => openai().or_else(gemini),
  };

  match chosen {
    Some(backend) => {
      info!(target: "studyquest", backend = backend.name(), "Generation backend enabled.");
      backend
    }
    None => {
      info!(target: "studyquest", "No generation API key configured. Using offline replies.");
      Arc::new(OfflineBackend)
    }
  }
}

/// Stand-in used when no provider is configured, so chat stays usable.
pub struct OfflineBackend;

#[async_trait]
impl GenerationBackend for OfflineBackend {
  fn name(&self) -> &'static str { "offline" }

  async fn generate(&self, req: &GenerationRequest) -> Result<String, GenerationError> {
    if req.is_title_request {
      return Err(GenerationError::Unavailable("offline backend does not generate titles".into()));
    }
    Ok(offline_reply(&req.prompt, req.image.is_some()))
  }
}

fn offline_reply(prompt: &str, has_image: bool) -> String {
  let lower = prompt.to_lowercase();
  if has_image {
    "I can't look at images while offline. Try describing what's in the picture.".into()
  } else if lower.starts_with("explain") || lower.starts_with("what is") {
    "The AI tutor is offline right now. Try breaking the topic into smaller questions and check your course notes.".into()
  } else {
    "The AI tutor is offline right now. Ask again once the assistant is back.".into()
  }
}

/// Pull `error.message` out of a provider error body, if it has one.
pub(crate) fn extract_error_message(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn provider_parses_case_insensitively() {
    assert_eq!("OpenAI".parse::<Provider>(), Ok(Provider::OpenAI));
    assert_eq!(" google ".parse::<Provider>(), Ok(Provider::Gemini));
    assert_eq!("offline".parse::<Provider>(), Ok(Provider::Offline));
    assert!("llama".parse::<Provider>().is_err());
    assert_eq!(Provider::Gemini.to_string(), "gemini");
  }

  #[test]
  fn extracts_provider_error_message() {
    let body = r#"{"error": {"message": "quota exceeded", "code": 429}}"#;
    assert_eq!(extract_error_message(body).as_deref(), Some("quota exceeded"));
    assert_eq!(extract_error_message("<html>bad gateway</html>"), None);
  }

  #[tokio::test]
  async fn offline_backend_refuses_titles() {
    let req = GenerationRequest {
      prompt: "name this".into(),
      image: None,
      system: None,
      is_title_request: true,
    };
    assert!(matches!(OfflineBackend.generate(&req).await, Err(GenerationError::Unavailable(_))));

    let req = GenerationRequest { is_title_request: false, prompt: "Explain recursion".into(), ..req };
    let reply = OfflineBackend.generate(&req).await.unwrap();
    assert!(reply.contains("offline"));

    let req = GenerationRequest { prompt: "hello".into(), ..req };
    let reply = OfflineBackend.generate(&req).await.unwrap();
    assert!(reply.contains("offline"));
    assert!(!reply.contains("saved"));
  }
}
