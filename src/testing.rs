//! Test doubles shared by the pipeline, session and route tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{GenerationBackend, GenerationRequest};
use crate::domain::{Conversation, Message};
use crate::error::{GenerationError, StoreError};
use crate::store::{ConversationStore, NewConversation};

/// One scripted completion step.
pub enum Step {
  Reply(&'static str),
  Fail(GenerationError),
  /// Never answers; used to trip the client-side timeout.
  Hang,
}

/// Backend that plays back scripted completions and a fixed title outcome.
/// Once the script runs out it echoes the prompt.
pub struct ScriptedBackend {
  steps: Mutex<VecDeque<Step>>,
  title: Mutex<Result<String, GenerationError>>,
  delay: Duration,
  pub calls: Mutex<Vec<GenerationRequest>>,
  in_flight: AtomicUsize,
  pub max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
  pub fn new(steps: Vec<Step>) -> Arc<Self> {
    Arc::new(Self::build(steps, Duration::ZERO))
  }

  /// Every completion takes `delay` (virtual time under a paused clock).
  pub fn slow(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
    Arc::new(Self::build(steps, delay))
  }

  fn build(steps: Vec<Step>, delay: Duration) -> Self {
    Self {
      steps: Mutex::new(steps.into()),
      title: Mutex::new(Ok("Recursion Basics".into())),
      delay,
      calls: Mutex::new(Vec::new()),
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
    }
  }

  pub fn with_title(self: Arc<Self>, title: Result<String, GenerationError>) -> Arc<Self> {
    *self.title.lock().unwrap() = title;
    self
  }

  pub fn completion_calls(&self) -> usize {
    self.calls.lock().unwrap().iter().filter(|r| !r.is_title_request).count()
  }

  pub fn title_calls(&self) -> usize {
    self.calls.lock().unwrap().iter().filter(|r| r.is_title_request).count()
  }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
  fn name(&self) -> &'static str { "scripted" }

  async fn generate(&self, req: &GenerationRequest) -> Result<String, GenerationError> {
    self.calls.lock().unwrap().push(req.clone());
    if req.is_title_request {
      return self.title.lock().unwrap().clone();
    }

    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    let step = self.steps.lock().unwrap().pop_front();
    let out = match step {
      Some(Step::Reply(text)) => Ok(text.to_string()),
      Some(Step::Fail(e)) => Err(e),
      Some(Step::Hang) => std::future::pending().await,
      None => Ok(format!("echo: {}", req.prompt)),
    };
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    out
  }
}

/// Store whose writes always fail; reads see nothing.
pub struct UnavailableStore;

#[async_trait]
impl ConversationStore for UnavailableStore {
  async fn list(&self, _owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
    Ok(Vec::new())
  }
  async fn get(&self, _owner_id: &str, id: &str) -> Result<Conversation, StoreError> {
    Err(StoreError::NotFound(id.to_string()))
  }
  async fn create(&self, _new: NewConversation) -> Result<Conversation, StoreError> {
    Err(StoreError::Unavailable("database offline".into()))
  }
  async fn update(&self, _o: &str, _id: &str, _t: &str, _m: &[Message]) -> Result<Conversation, StoreError> {
    Err(StoreError::Unavailable("database offline".into()))
  }
  async fn update_title(&self, _o: &str, _id: &str, _t: &str) -> Result<Conversation, StoreError> {
    Err(StoreError::Unavailable("database offline".into()))
  }
  async fn delete(&self, _o: &str, _id: &str) -> Result<(), StoreError> {
    Err(StoreError::Unavailable("database offline".into()))
  }
}
