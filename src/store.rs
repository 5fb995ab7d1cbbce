//! Conversation persistence: the store seam and its in-memory implementation.
//!
//! Every operation is scoped to an owner id; touching another user's
//! conversation is `Forbidden`, an unknown id is `NotFound`.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{Conversation, Message};
use crate::error::StoreError;

/// Fields needed to create a conversation record.
#[derive(Clone, Debug)]
pub struct NewConversation {
  pub owner_id: String,
  pub title: String,
  pub messages: Vec<Message>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
  /// The owner's conversations, most recently updated first.
  async fn list(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError>;
  async fn get(&self, owner_id: &str, id: &str) -> Result<Conversation, StoreError>;
  async fn create(&self, new: NewConversation) -> Result<Conversation, StoreError>;
  /// Replace title and messages.
  async fn update(
    &self,
    owner_id: &str,
    id: &str,
    title: &str,
    messages: &[Message],
  ) -> Result<Conversation, StoreError>;
  async fn update_title(&self, owner_id: &str, id: &str, title: &str) -> Result<Conversation, StoreError>;
  async fn delete(&self, owner_id: &str, id: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryStore {
  by_id: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }
}

fn owned<'a>(
  map: &'a mut HashMap<String, Conversation>,
  owner_id: &str,
  id: &str,
) -> Result<&'a mut Conversation, StoreError> {
  let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
  if conv.owner_id != owner_id {
    return Err(StoreError::Forbidden(id.to_string()));
  }
  Ok(conv)
}

#[async_trait]
impl ConversationStore for MemoryStore {
  #[instrument(level = "debug", skip(self))]
  async fn list(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
    let by_id = self.by_id.read().await;
    let mut list: Vec<Conversation> = by_id.values().filter(|c| c.owner_id == owner_id).cloned().collect();
    list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(list)
  }

  #[instrument(level = "debug", skip(self))]
  async fn get(&self, owner_id: &str, id: &str) -> Result<Conversation, StoreError> {
    let by_id = self.by_id.read().await;
    let conv = by_id.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    if conv.owner_id != owner_id {
      return Err(StoreError::Forbidden(id.to_string()));
    }
    Ok(conv.clone())
  }

  #[instrument(level = "debug", skip(self, new), fields(owner_id = %new.owner_id, messages = new.messages.len()))]
  async fn create(&self, new: NewConversation) -> Result<Conversation, StoreError> {
    if new.owner_id.trim().is_empty() {
      return Err(StoreError::Invalid("owner id is required".into()));
    }
    if new.messages.is_empty() {
      return Err(StoreError::Invalid("a conversation needs at least one message".into()));
    }
    let now = Utc::now();
    let conv = Conversation {
      id: Uuid::new_v4().to_string(),
      owner_id: new.owner_id,
      title: new.title,
      messages: new.messages,
      created_at: now,
      updated_at: now,
    };
    self.by_id.write().await.insert(conv.id.clone(), conv.clone());
    debug!(id = %conv.id, "Conversation created");
    Ok(conv)
  }

  #[instrument(level = "debug", skip(self, title, messages), fields(messages = messages.len()))]
  async fn update(
    &self,
    owner_id: &str,
    id: &str,
    title: &str,
    messages: &[Message],
  ) -> Result<Conversation, StoreError> {
    if messages.is_empty() {
      return Err(StoreError::Invalid("a conversation needs at least one message".into()));
    }
    let mut by_id = self.by_id.write().await;
    let conv = owned(&mut by_id, owner_id, id)?;
    conv.title = title.to_string();
    conv.messages = messages.to_vec();
    conv.touch();
    Ok(conv.clone())
  }

  #[instrument(level = "debug", skip(self))]
  async fn update_title(&self, owner_id: &str, id: &str, title: &str) -> Result<Conversation, StoreError> {
    let title = title.trim();
    if title.is_empty() {
      return Err(StoreError::Invalid("title is required".into()));
    }
    let mut by_id = self.by_id.write().await;
    let conv = owned(&mut by_id, owner_id, id)?;
    conv.title = title.to_string();
    conv.touch();
    Ok(conv.clone())
  }

  #[instrument(level = "debug", skip(self))]
  async fn delete(&self, owner_id: &str, id: &str) -> Result<(), StoreError> {
    let mut by_id = self.by_id.write().await;
    owned(&mut by_id, owner_id, id)?;
    by_id.remove(id);
    debug!(%id, "Conversation deleted");
    Ok(())
  }
}
