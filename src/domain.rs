//! Domain models: roles, inline images, messages, conversations and the
//! transient pending request handed to the generation backend.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prompt text used when the learner only sends an image.
pub const IMAGE_ONLY_PROMPT: &str = "Image analysis request";

/// Who authored a message?
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  User,
  Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ImageRefError {
  #[error("image must be a data:image/...;base64 URL")]
  NotDataUrl,
  #[error("image data URL is not base64 encoded")]
  NotBase64,
  #[error("image payload is empty")]
  Empty,
  #[error("image payload is not valid base64: {0}")]
  Decode(String),
}

/// Inline image attached to a prompt, kept as mime type + base64 payload.
/// Serialized back to its `data:` URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
  mime: String,
  data: String,
}

impl ImageRef {
  /// Parse `data:image/<subtype>;base64,<payload>`.
  pub fn parse(data_url: &str) -> Result<Self, ImageRefError> {
    let rest = data_url.trim().strip_prefix("data:").ok_or(ImageRefError::NotDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(ImageRefError::NotDataUrl)?;
    let mut params = header.split(';');
    let mime = params.next().unwrap_or_default();
    if !mime.starts_with("image/") || mime.len() == "image/".len() {
      return Err(ImageRefError::NotDataUrl);
    }
    if !params.any(|p| p.eq_ignore_ascii_case("base64")) {
      return Err(ImageRefError::NotBase64);
    }
    if payload.is_empty() {
      return Err(ImageRefError::Empty);
    }
    STANDARD.decode(payload).map_err(|e| ImageRefError::Decode(e.to_string()))?;
    Ok(Self { mime: mime.to_string(), data: payload.to_string() })
  }

  pub fn mime(&self) -> &str { &self.mime }

  /// Base64 payload without the data URL header.
  pub fn data(&self) -> &str { &self.data }

  pub fn to_data_url(&self) -> String {
    format!("data:{};base64,{}", self.mime, self.data)
  }
}

impl TryFrom<String> for ImageRef {
  type Error = ImageRefError;
  fn try_from(value: String) -> Result<Self, Self::Error> { ImageRef::parse(&value) }
}

impl From<ImageRef> for String {
  fn from(value: ImageRef) -> Self { value.to_data_url() }
}

/// A single chat message. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  pub id: String,
  pub role: Role,
  pub text: String,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_ref: Option<ImageRef>,
}

impl Message {
  pub fn user(text: impl Into<String>, image_ref: Option<ImageRef>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      role: Role::User,
      text: text.into(),
      created_at: Utc::now(),
      image_ref,
    }
  }

  /// Assistant reply; never timestamped before `after`.
  pub fn assistant(text: impl Into<String>, after: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      role: Role::Assistant,
      text: text.into(),
      created_at: Utc::now().max(after),
      image_ref: None,
    }
  }
}

/// A titled, ordered list of messages owned by one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
  pub id: String,
  pub owner_id: String,
  pub title: String,
  pub messages: Vec<Message>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Conversation {
  /// Refresh `updated_at`. It always advances, even if the wall clock did not.
  pub fn touch(&mut self) {
    self.updated_at = next_timestamp(self.updated_at);
  }
}

/// Current time, or 1ms past `prev` if the clock has not moved past it.
pub fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
  let now = Utc::now();
  if now > prev { now } else { prev + Duration::milliseconds(1) }
}

/// One outstanding call to the generation backend. In-memory only.
#[derive(Clone, Debug)]
pub struct PendingRequest {
  pub prompt: String,
  pub image_ref: Option<ImageRef>,
  pub attempt: u32,
}
