//! Google Gemini `generateContent` backend.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{extract_error_message, GenerationBackend, GenerationRequest};
use crate::error::GenerationError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Gemini {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub model: String,
}

impl Gemini {
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url = std::env::var("GEMINI_BASE_URL")
      .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into());
    let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".into());
    match Self::new(api_key, base_url, model) {
      Ok(g) => Some(g),
      Err(e) => {
        warn!(target: "studyquest", error = %e, "Failed to build Gemini client");
        None
      }
    }
  }

  pub fn new(api_key: String, base_url: String, model: String) -> Result<Self, GenerationError> {
    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let base_url = base_url.trim_end_matches('/').to_string();
    Ok(Self { client, api_key, base_url, model })
  }

  fn build_request(req: &GenerationRequest) -> GenerateContentRequest {
    let mut parts = vec![Part::text(req.prompt.clone())];
    if let Some(img) = req.image.as_ref().filter(|_| !req.is_title_request) {
      parts.push(Part {
        text: None,
        inline_data: Some(InlineData { mime_type: img.mime().to_string(), data: img.data().to_string() }),
      });
    }

    let generation_config = req.is_title_request.then(|| GenerationConfig {
      temperature: 0.2,
      top_k: 40,
      top_p: 0.95,
      max_output_tokens: 60,
      response_mime_type: "text/plain".into(),
    });

    GenerateContentRequest {
      contents: vec![Content { role: "user".into(), parts }],
      system_instruction: req.system.as_ref().map(|s| SystemInstruction { parts: vec![Part::text(s.clone())] }),
      generation_config,
    }
  }
}

#[async_trait]
impl GenerationBackend for Gemini {
  fn name(&self) -> &'static str { "gemini" }

  #[instrument(
    level = "info",
    skip(self, req),
    fields(model = %self.model, title = req.is_title_request, has_image = req.image.is_some(), prompt_len = req.prompt.len())
  )]
  async fn generate(&self, req: &GenerationRequest) -> Result<String, GenerationError> {
    let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
    let body = Self::build_request(req);
    let start = Instant::now();

    let res = self.client.post(&url)
      .query(&[("key", self.api_key.as_str())])
      .header(USER_AGENT, "studyquest-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .json(&body).send().await?;

    let status = res.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
      warn!(elapsed = ?start.elapsed(), "Gemini rate limited");
      return Err(GenerationError::RateLimited);
    }
    if !status.is_success() {
      let text = res.text().await.unwrap_or_default();
      let message = extract_error_message(&text).unwrap_or(text);
      return Err(GenerationError::Http { status: status.as_u16(), message });
    }

    let parsed: GenerateContentResponse = res
      .json()
      .await
      .map_err(GenerationError::from)?;
    let text = parsed.candidates.first()
      .and_then(|c| c.content.parts.first())
      .and_then(|p| p.text.as_deref())
      .map(str::trim)
      .unwrap_or_default();
    if text.is_empty() {
      return Err(GenerationError::Malformed("the AI model did not return any text".into()));
    }
    info!(elapsed = ?start.elapsed(), reply_len = text.len(), "Gemini reply received");
    Ok(text.to_string())
  }
}

// --- generateContent DTOs ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
  contents: Vec<Content>,
  #[serde(skip_serializing_if = "Option::is_none")]
  system_instruction: Option<SystemInstruction>,
  #[serde(skip_serializing_if = "Option::is_none")]
  generation_config: Option<GenerationConfig>,
}
#[derive(Serialize)]
struct Content { role: String, parts: Vec<Part> }
#[derive(Serialize)]
struct SystemInstruction { parts: Vec<Part> }
#[derive(Serialize)]
struct Part {
  #[serde(skip_serializing_if = "Option::is_none")]
  text: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  inline_data: Option<InlineData>,
}
impl Part {
  fn text(s: String) -> Self { Self { text: Some(s), inline_data: None } }
}
#[derive(Serialize)]
struct InlineData { mime_type: String, data: String }
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
  temperature: f32,
  top_k: u32,
  top_p: f32,
  max_output_tokens: u32,
  response_mime_type: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
  #[serde(default)] candidates: Vec<Candidate>,
}
#[derive(Deserialize)]
struct Candidate {
  #[serde(default)] content: CandidateContent,
}
#[derive(Deserialize, Default)]
struct CandidateContent {
  #[serde(default)] parts: Vec<CandidatePart>,
}
#[derive(Deserialize)]
struct CandidatePart {
  #[serde(default)] text: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::ImageRef;
  use serde_json::{json, Value};
  use wiremock::matchers::{method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  const ROUTE: &str = "/models/gemini-test:generateContent";

  fn client(server: &MockServer) -> Gemini {
    Gemini::new("g-key".into(), server.uri(), "gemini-test".into()).unwrap()
  }

  fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest { prompt: prompt.into(), image: None, system: None, is_title_request: false }
  }

  fn reply(text: &str) -> Value {
    json!({ "candidates": [{ "content": { "parts": [{ "text": text }], "role": "model" } }] })
  }

  #[tokio::test]
  async fn reads_first_candidate_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path(ROUTE))
      .and(query_param("key", "g-key"))
      .respond_with(ResponseTemplate::new(200).set_body_json(reply("A function calling itself.\n")))
      .expect(1)
      .mount(&server)
      .await;

    let text = client(&server).generate(&request("Explain recursion")).await.unwrap();
    assert_eq!(text, "A function calling itself.");
  }

  #[tokio::test]
  async fn inline_image_and_title_config() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path(ROUTE))
      .respond_with(ResponseTemplate::new(200).set_body_json(reply("ok")))
      .mount(&server)
      .await;

    let g = client(&server);
    let mut req = request("describe");
    req.image = Some(ImageRef::parse("data:image/jpeg;base64,aGVsbG8=").unwrap());
    req.system = Some("tutor".into());
    g.generate(&req).await.unwrap();
    req.is_title_request = true;
    g.generate(&req).await.unwrap();

    let bodies: Vec<Value> = server.received_requests().await.unwrap_or_default()
      .iter()
      .map(|r| serde_json::from_slice(&r.body).unwrap())
      .collect();

    let parts = &bodies[0]["contents"][0]["parts"];
    assert_eq!(parts[0]["text"], "describe");
    assert_eq!(parts[1]["inline_data"]["mime_type"], "image/jpeg");
    assert_eq!(parts[1]["inline_data"]["data"], "aGVsbG8=");
    assert_eq!(bodies[0]["systemInstruction"]["parts"][0]["text"], "tutor");
    assert!(bodies[0].get("generationConfig").is_none());

    assert_eq!(bodies[1]["contents"][0]["parts"].as_array().unwrap().len(), 1);
    assert_eq!(bodies[1]["generationConfig"]["maxOutputTokens"], 60);
    assert_eq!(bodies[1]["generationConfig"]["responseMimeType"], "text/plain");
  }

  #[tokio::test]
  async fn status_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(429))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(503).set_body_json(json!({ "error": { "message": "overloaded" } })),
      )
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
      .mount(&server)
      .await;

    let g = client(&server);
    assert_eq!(g.generate(&request("a")).await, Err(GenerationError::RateLimited));
    assert_eq!(
      g.generate(&request("b")).await,
      Err(GenerationError::Http { status: 503, message: "overloaded".into() })
    );
    assert!(matches!(g.generate(&request("c")).await, Err(GenerationError::Malformed(_))));
  }

  #[tokio::test]
  async fn transport_errors_never_carry_the_key() {
    // nothing listens on port 1
    let g = Gemini::new("SECRET-KEY-123".into(), "http://127.0.0.1:1".into(), "m".into()).unwrap();
    let err = g.generate(&request("hi")).await.unwrap_err();
    assert!(matches!(err, GenerationError::Transport(_)));
    assert!(!err.to_string().contains("SECRET-KEY-123"));

    let surfaced = crate::error::PipelineError::Backend(err).to_string();
    assert!(!surfaced.contains("SECRET-KEY-123"));
    assert!(!surfaced.contains("key="));
  }

  #[tokio::test]
  async fn slow_response_is_timed_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(reply("late")).set_delay(Duration::from_secs(2)))
      .mount(&server)
      .await;

    let mut g = client(&server);
    g.client = reqwest::Client::builder().timeout(Duration::from_millis(100)).build().unwrap();
    assert_eq!(g.generate(&request("hi")).await, Err(GenerationError::TimedOut));
  }
}
