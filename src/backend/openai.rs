//! OpenAI-compatible chat.completions backend.
//!
//! One request per call: optional system message plus the user prompt, with
//! an inline image sent as an `image_url` content part.
//! Calls are instrumented and log model names, latencies and token usage (not contents).
//!
//! NOTE: We never log the API key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{extract_error_message, GenerationBackend, GenerationRequest};
use crate::error::GenerationError;

/// Hard ceiling for the HTTP client; the pipeline applies tighter per-call timeouts.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const TITLE_MAX_TOKENS: u32 = 60;

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub model: String,
  pub title_model: String,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let title_model = std::env::var("OPENAI_TITLE_MODEL").unwrap_or_else(|_| model.clone());
    match Self::new(api_key, base_url, model, title_model) {
      Ok(oa) => Some(oa),
      Err(e) => {
        warn!(target: "studyquest", error = %e, "Failed to build OpenAI client");
        None
      }
    }
  }

  pub fn new(
    api_key: String,
    base_url: String,
    model: String,
    title_model: String,
  ) -> Result<Self, GenerationError> {
    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let base_url = base_url.trim_end_matches('/').to_string();
    Ok(Self { client, api_key, base_url, model, title_model })
  }

  fn build_request(&self, req: &GenerationRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &req.system {
      messages.push(ChatMessageReq { role: "system".into(), content: ChatContent::Text(system.clone()) });
    }
    let content = match &req.image {
      Some(img) if !req.is_title_request => ChatContent::Parts(vec![
        ContentPart::Text { text: req.prompt.clone() },
        ContentPart::ImageUrl { image_url: ImageUrl { url: img.to_data_url() } },
      ]),
      _ => ChatContent::Text(req.prompt.clone()),
    };
    messages.push(ChatMessageReq { role: "user".into(), content });

    let (model, temperature, max_tokens) = if req.is_title_request {
      (self.title_model.clone(), 0.2, Some(TITLE_MAX_TOKENS))
    } else {
      (self.model.clone(), 0.7, None)
    };
    ChatCompletionRequest { model, messages, temperature, max_tokens }
  }
}

#[async_trait]
impl GenerationBackend for OpenAI {
  fn name(&self) -> &'static str { "openai" }

  #[instrument(
    level = "info",
    skip(self, req),
    fields(title = req.is_title_request, has_image = req.image.is_some(), prompt_len = req.prompt.len())
  )]
  async fn generate(&self, req: &GenerationRequest) -> Result<String, GenerationError> {
    let url = format!("{}/chat/completions", self.base_url);
    let body = self.build_request(req);
    let start = Instant::now();

    let res = self.client.post(&url)
      .header(USER_AGENT, "studyquest-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&body).send().await?;

    let status = res.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
      warn!(elapsed = ?start.elapsed(), model = %body.model, "OpenAI rate limited");
      return Err(GenerationError::RateLimited);
    }
    if !status.is_success() {
      let text = res.text().await.unwrap_or_default();
      let message = extract_error_message(&text).unwrap_or(text);
      return Err(GenerationError::Http { status: status.as_u16(), message });
    }

    let parsed: ChatCompletionResponse = res
      .json()
      .await
      .map_err(GenerationError::from)?;
    if let Some(usage) = &parsed.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = parsed.choices.first()
      .and_then(|c| c.message.content.as_deref())
      .map(str::trim)
      .unwrap_or_default();
    if text.is_empty() {
      return Err(GenerationError::Malformed("response contained no text".into()));
    }
    info!(elapsed = ?start.elapsed(), model = %body.model, reply_len = text.len(), "OpenAI reply received");
    Ok(text.to_string())
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: ChatContent }
#[derive(Serialize)]
#[serde(untagged)]
enum ChatContent {
  Text(String),
  Parts(Vec<ContentPart>),
}
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
  Text { text: String },
  ImageUrl { image_url: ImageUrl },
}
#[derive(Serialize)]
struct ImageUrl { url: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}
