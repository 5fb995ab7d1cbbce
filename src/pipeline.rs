//! The conversation request pipeline.
//!
//! One `Pipeline` per learner. It queues prompts, sends them one at a time to
//! the generation backend (retrying rate limits with a linear backoff), appends
//! each successful exchange to the active conversation, then names and saves
//! the conversation in the store.
//!
//! The pipeline itself holds no locks; the owning session task serializes
//! access (see `session.rs`).

use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{GenerationBackend, GenerationRequest};
use crate::config::{AppConfig, PipelineSettings, Prompts};
use crate::domain::{next_timestamp, Conversation, ImageRef, Message, PendingRequest, IMAGE_ONLY_PROMPT};
use crate::error::{GenerationError, PipelineError, StoreError};
use crate::store::{ConversationStore, NewConversation};
use crate::title::{clean_generated_title, fallback_title, title_prompt, DEFAULT_TITLE};
use crate::util::trunc_for_log;

pub const SAVE_FAILED_NOTICE: &str =
  "Your message was sent but couldn't be saved for later. You can continue chatting.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
  Info,
  Warning,
  Error,
}

/// Transient notification for the learner (rendered as a toast by the UI).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
  pub level: NoticeLevel,
  pub message: String,
}

impl Notice {
  pub fn info(message: impl Into<String>) -> Self {
    Self { level: NoticeLevel::Info, message: message.into() }
  }
  pub fn warning(message: impl Into<String>) -> Self {
    Self { level: NoticeLevel::Warning, message: message.into() }
  }
  pub fn error(message: impl Into<String>) -> Self {
    Self { level: NoticeLevel::Error, message: message.into() }
  }
}

/// In-memory view of the conversation being chatted in.
/// `id` is `None` until the first successful save.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActiveConversation {
  pub id: Option<String>,
  pub title: Option<String>,
  pub messages: Vec<Message>,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
}

impl From<Conversation> for ActiveConversation {
  fn from(c: Conversation) -> Self {
    Self {
      id: Some(c.id),
      title: Some(c.title),
      messages: c.messages,
      created_at: Some(c.created_at),
      updated_at: Some(c.updated_at),
    }
  }
}

/// A completed user/assistant pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Exchange {
  pub user: Message,
  pub assistant: Message,
}

/// Terminal outcome of one queued request.
#[derive(Debug)]
pub struct Processed {
  pub ticket: u64,
  pub result: Result<Exchange, PipelineError>,
  /// Tickets dropped from the queue because this request exhausted its retries.
  pub discarded: Vec<u64>,
}

/// Runs one request against the backend: timeout per call, linear backoff on 429.
/// Owns its own handles so it can run while the pipeline keeps accepting work.
#[derive(Clone)]
pub struct Completion {
  backend: Arc<dyn GenerationBackend>,
  system: String,
  settings: PipelineSettings,
}

impl Completion {
  #[instrument(level = "debug", target = "pipeline", skip_all, fields(prompt = %trunc_for_log(&request.prompt, 60)))]
  pub async fn run(self, mut request: PendingRequest) -> (PendingRequest, Result<String, PipelineError>) {
    let limit = self.settings.completion_timeout();
    let call = GenerationRequest {
      prompt: request.prompt.clone(),
      image: request.image_ref.clone(),
      system: Some(self.system.clone()),
      is_title_request: false,
    };

    loop {
      request.attempt += 1;
      let attempt = request.attempt;
      let outcome = match timeout(limit, self.backend.generate(&call)).await {
        Ok(outcome) => outcome,
        Err(_) => {
          warn!(target: "pipeline", attempt, ?limit, "Completion timed out");
          return (request, Err(PipelineError::TimedOut(limit)));
        }
      };
      match outcome {
        Ok(text) => {
          debug!(target: "pipeline", attempt, reply_len = text.len(), "Completion succeeded");
          return (request, Ok(text));
        }
        Err(GenerationError::RateLimited) if attempt < self.settings.max_attempts => {
          let delay = self.settings.retry_delay(attempt);
          warn!(target: "pipeline", attempt, delay_ms = delay.as_millis() as u64, "Rate limited; retrying");
          sleep(delay).await;
        }
        Err(GenerationError::RateLimited) => {
          error!(target: "pipeline", attempts = attempt, "Rate limit retries exhausted");
          return (request, Err(PipelineError::RateLimitExhausted { attempts: attempt }));
        }
        Err(GenerationError::TimedOut) => {
          warn!(target: "pipeline", attempt, "Backend transport timed out");
          return (request, Err(PipelineError::TimedOut(limit)));
        }
        Err(e) => {
          error!(target: "pipeline", attempt, error = %e, "Completion failed");
          return (request, Err(PipelineError::Backend(e)));
        }
      }
    }
  }
}

pub struct Pipeline {
  owner_id: String,
  backend: Arc<dyn GenerationBackend>,
  store: Arc<dyn ConversationStore>,
  prompts: Prompts,
  settings: PipelineSettings,
  active: ActiveConversation,
  queue: VecDeque<(u64, PendingRequest)>,
  next_ticket: u64,
  /// An exchange was appended since the last `persist`.
  dirty: bool,
  notices: Vec<Notice>,
}

impl Pipeline {
  pub fn new(
    owner_id: impl Into<String>,
    backend: Arc<dyn GenerationBackend>,
    store: Arc<dyn ConversationStore>,
    config: &AppConfig,
  ) -> Self {
    Self {
      owner_id: owner_id.into(),
      backend,
      store,
      prompts: config.prompts.clone(),
      settings: config.pipeline.clone(),
      active: ActiveConversation::default(),
      queue: VecDeque::new(),
      next_ticket: 1,
      dirty: false,
      notices: Vec::new(),
    }
  }

  pub fn owner_id(&self) -> &str { &self.owner_id }
  pub fn active(&self) -> &ActiveConversation { &self.active }
  pub fn pending(&self) -> usize { self.queue.len() }
  pub fn settings(&self) -> &PipelineSettings { &self.settings }

  pub fn take_notices(&mut self) -> Vec<Notice> {
    std::mem::take(&mut self.notices)
  }

  /// Validate and queue a request. Returns its ticket.
  pub fn enqueue(&mut self, prompt: &str, image: Option<ImageRef>) -> Result<u64, PipelineError> {
    let prompt = prompt.trim();
    if prompt.is_empty() && image.is_none() {
      return Err(PipelineError::EmptyPrompt);
    }
    if self.queue.len() >= self.settings.max_pending {
      return Err(PipelineError::QueueFull { limit: self.settings.max_pending });
    }
    let prompt = if prompt.is_empty() { IMAGE_ONLY_PROMPT } else { prompt };
    let ticket = self.next_ticket;
    self.next_ticket += 1;
    self.queue.push_back((ticket, PendingRequest { prompt: prompt.to_string(), image_ref: image, attempt: 0 }));
    debug!(target: "pipeline", owner_id = %self.owner_id, ticket, queued = self.queue.len(), "Request queued");
    Ok(ticket)
  }

  /// Pop the queue head for the caller to run with `completion()`.
  pub fn take_next(&mut self) -> Option<(u64, PendingRequest)> {
    self.queue.pop_front()
  }

  pub fn completion(&self) -> Completion {
    Completion {
      backend: self.backend.clone(),
      system: self.prompts.assistant_system.clone(),
      settings: self.settings.clone(),
    }
  }

  /// Apply the outcome of a request taken with `take_next`.
  pub fn finish(&mut self, ticket: u64, request: PendingRequest, outcome: Result<String, PipelineError>) -> Processed {
    match outcome {
      Ok(text) => {
        let exchange = self.append_exchange(request, text);
        Processed { ticket, result: Ok(exchange), discarded: Vec::new() }
      }
      Err(e) => {
        let discarded = if matches!(e, PipelineError::RateLimitExhausted { .. }) {
          let dropped: Vec<u64> = self.queue.drain(..).map(|(t, _)| t).collect();
          if !dropped.is_empty() {
            warn!(target: "pipeline", owner_id = %self.owner_id, count = dropped.len(), "Discarding queued requests");
            self.notices.push(Notice::error(format!(
              "{} queued message(s) were dropped because the assistant is rate limited. Please send them again later.",
              dropped.len()
            )));
          }
          dropped
        } else {
          Vec::new()
        };
        Processed { ticket, result: Err(e), discarded }
      }
    }
  }

  /// Run the queue head to a terminal outcome.
  pub async fn process_next(&mut self) -> Option<Processed> {
    let (ticket, request) = self.take_next()?;
    let (request, outcome) = self.completion().run(request).await;
    Some(self.finish(ticket, request, outcome))
  }

  fn append_exchange(&mut self, request: PendingRequest, reply: String) -> Exchange {
    let user = Message::user(request.prompt, request.image_ref);
    let assistant = Message::assistant(reply, user.created_at);
    self.active.messages.push(user.clone());
    self.active.messages.push(assistant.clone());
    let prev = self.active.updated_at.unwrap_or(user.created_at);
    self.active.updated_at = Some(next_timestamp(prev.max(assistant.created_at)));
    self.dirty = true;
    info!(target: "pipeline", owner_id = %self.owner_id, attempts = request.attempt, messages = self.active.messages.len(), "Exchange appended");
    Exchange { user, assistant }
  }

  /// Title + store write for the exchanges appended since the last call.
  /// Store failures never propagate; they become a warning notice.
  #[instrument(level = "debug", target = "pipeline", skip(self), fields(owner_id = %self.owner_id))]
  pub async fn persist(&mut self) {
    if !self.dirty {
      return;
    }
    self.dirty = false;

    if self.active.title.is_none() && self.active.messages.len() >= 2 {
      let title = self.generate_title(&self.active.messages).await;
      self.active.title = Some(title);
    }
    let title = self.active.title.clone().unwrap_or_else(|| DEFAULT_TITLE.to_string());

    let saved = match self.active.id.clone() {
      Some(id) => match self.store.update(&self.owner_id, &id, &title, &self.active.messages).await {
        Err(StoreError::NotFound(_)) => {
          warn!(target: "pipeline", %id, "Conversation vanished from the store; creating a new record");
          self.notices.push(Notice::info("This conversation was saved again as a new copy."));
          self.create_record(&title).await
        }
        other => other,
      },
      None => self.create_record(&title).await,
    };

    match saved {
      Ok(conv) => {
        debug!(target: "pipeline", id = %conv.id, messages = conv.messages.len(), "Conversation saved");
        self.active.id = Some(conv.id);
        self.active.created_at.get_or_insert(conv.created_at);
        self.active.updated_at = self.active.updated_at.max(Some(conv.updated_at));
      }
      Err(e) => {
        error!(target: "pipeline", error = %e, "Failed to save conversation");
        self.notices.push(Notice::warning(SAVE_FAILED_NOTICE));
      }
    }
  }

  async fn create_record(&self, title: &str) -> Result<Conversation, StoreError> {
    self.store
      .create(NewConversation {
        owner_id: self.owner_id.clone(),
        title: title.to_string(),
        messages: self.active.messages.clone(),
      })
      .await
  }

  /// Enqueue, run until this request resolves, then persist.
  pub async fn submit(&mut self, prompt: &str, image: Option<ImageRef>) -> Result<Message, PipelineError> {
    let ticket = self.enqueue(prompt, image)?;
    while let Some(processed) = self.process_next().await {
      if processed.result.is_ok() {
        self.persist().await;
      }
      if processed.ticket == ticket {
        return processed.result.map(|ex| ex.assistant);
      }
      if processed.discarded.contains(&ticket) {
        return Err(PipelineError::Discarded);
      }
    }
    Err(PipelineError::Discarded)
  }

  /// Ask the backend for a title; any failure falls back to the first user message.
  #[instrument(level = "debug", target = "pipeline", skip_all, fields(messages = messages.len()))]
  pub async fn generate_title(&self, messages: &[Message]) -> String {
    let req = GenerationRequest {
      prompt: title_prompt(&self.prompts.title_user_template, messages, self.settings.title_context_messages),
      image: None,
      system: Some(self.prompts.title_system.clone()),
      is_title_request: true,
    };
    let limit = self.settings.title_timeout();
    match timeout(limit, self.backend.generate(&req)).await {
      Ok(Ok(raw)) => match clean_generated_title(&raw) {
        Some(title) => {
          info!(target: "pipeline", %title, "Generated conversation title");
          title
        }
        None => fallback_title(messages),
      },
      Ok(Err(e)) => {
        warn!(target: "pipeline", error = %e, "Title generation failed; using fallback");
        fallback_title(messages)
      }
      Err(_) => {
        warn!(target: "pipeline", ?limit, "Title generation timed out; using fallback");
        fallback_title(messages)
      }
    }
  }

  pub async fn list_conversations(&self) -> Result<Vec<Conversation>, PipelineError> {
    Ok(self.store.list(&self.owner_id).await?)
  }

  pub async fn get_conversation(&self, id: &str) -> Result<Conversation, PipelineError> {
    Ok(self.store.get(&self.owner_id, id).await?)
  }

  /// Make a stored conversation the active one.
  pub async fn open_conversation(&mut self, id: &str) -> Result<&ActiveConversation, PipelineError> {
    let conv = self.store.get(&self.owner_id, id).await?;
    info!(target: "pipeline", %id, messages = conv.messages.len(), "Conversation opened");
    self.active = conv.into();
    self.dirty = false;
    Ok(&self.active)
  }

  pub fn new_conversation(&mut self) -> &ActiveConversation {
    self.active = ActiveConversation::default();
    self.dirty = false;
    &self.active
  }

  pub async fn delete_conversation(&mut self, id: &str) -> Result<(), PipelineError> {
    self.store.delete(&self.owner_id, id).await?;
    if self.active.id.as_deref() == Some(id) {
      self.active = ActiveConversation::default();
      self.dirty = false;
    }
    info!(target: "pipeline", %id, "Conversation deleted");
    Ok(())
  }

  /// Set an explicit title, or regenerate one from the stored messages.
  pub async fn rename_conversation(&mut self, id: &str, title: Option<String>) -> Result<Conversation, PipelineError> {
    let title = match title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
      Some(t) => t,
      None => {
        let conv = self.store.get(&self.owner_id, id).await?;
        self.generate_title(&conv.messages).await
      }
    };
    let updated = self.store.update_title(&self.owner_id, id, &title).await?;
    if self.active.id.as_deref() == Some(id) {
      self.active.title = Some(updated.title.clone());
    }
    Ok(updated)
  }
}
