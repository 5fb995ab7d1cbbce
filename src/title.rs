//! Conversation titles: the prompt sent to the backend, cleanup of what it
//! returns, and the truncation fallback used when generation fails.

use crate::domain::{Message, Role};
use crate::util::{fill_template, truncate_with_ellipsis};

pub const DEFAULT_TITLE: &str = "New Conversation";

/// Per-message excerpt length inside the title prompt.
const EXCERPT_CHARS: usize = 100;
const TITLE_MAX_CHARS: usize = 50;
const FALLBACK_MAX_CHARS: usize = 30;

const TITLE_PREFIXES: [&str; 3] = ["conversation title:", "suggested title:", "title:"];

/// Build the title prompt from the first `limit` messages.
pub fn title_prompt(template: &str, messages: &[Message], limit: usize) -> String {
  let transcript = messages
    .iter()
    .take(limit)
    .map(|m| {
      let who = match m.role {
        Role::User => "User",
        Role::Assistant => "AI",
      };
      let excerpt: String = m.text.chars().take(EXCERPT_CHARS).collect();
      let more = if m.text.chars().count() > EXCERPT_CHARS { "..." } else { "" };
      format!("{}: {}{}", who, excerpt, more)
    })
    .collect::<Vec<_>>()
    .join("\n");
  fill_template(template, &[("conversation", &transcript)])
}

/// Strip label prefixes and quotes from a generated title. `None` if nothing is left.
pub fn clean_generated_title(raw: &str) -> Option<String> {
  let mut title = raw.trim();
  for prefix in TITLE_PREFIXES {
    let matches = title
      .get(..prefix.len())
      .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
    if matches {
      title = title[prefix.len()..].trim_start();
      break;
    }
  }
  let title = title
    .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’'))
    .trim();
  if title.is_empty() {
    None
  } else {
    Some(truncate_with_ellipsis(title, TITLE_MAX_CHARS))
  }
}

/// Title derived from the first user message, at most 30 characters.
pub fn fallback_title(messages: &[Message]) -> String {
  messages
    .iter()
    .find(|m| m.role == Role::User)
    .map(|m| m.text.trim())
    .filter(|t| !t.is_empty())
    .map(|t| truncate_with_ellipsis(t, FALLBACK_MAX_CHARS))
    .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}
