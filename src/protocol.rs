//! Public protocol structs for the HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Conversation, Message};
use crate::pipeline::Notice;
use crate::session::{ChatReply, SessionSnapshot};

#[derive(Deserialize)]
pub struct ChatIn {
    #[serde(default)]
    pub prompt: String,
    /// `data:image/...;base64,...` URL.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOut {
    pub message: Message,
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub notices: Vec<Notice>,
}

impl From<ChatReply> for ChatOut {
    fn from(r: ChatReply) -> Self {
        Self {
            message: r.message,
            conversation_id: r.conversation_id,
            title: r.title,
            notices: r.notices,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOut {
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pending: usize,
    pub notices: Vec<Notice>,
}

impl From<SessionSnapshot> for SessionOut {
    fn from(s: SessionSnapshot) -> Self {
        Self {
            conversation_id: s.conversation_id,
            title: s.title,
            messages: s.messages,
            updated_at: s.updated_at,
            pending: s.pending,
            notices: s.notices,
        }
    }
}

/// Conversation list entry (no messages).
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummaryOut {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Convert a stored `Conversation` to its list entry.
pub fn to_summary(c: &Conversation) -> ConversationSummaryOut {
    ConversationSummaryOut {
        id: c.id.clone(),
        title: c.title.clone(),
        message_count: c.messages.len(),
        updated_at: c.updated_at,
    }
}

#[derive(Deserialize, Default)]
pub struct RenameIn {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Serialize)]
pub struct DeleteOut {
    pub success: bool,
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub backend: &'static str,
}

#[derive(Serialize)]
pub struct ErrorOut {
    pub error: String,
}
