//! Loading service configuration (prompts + pipeline tuning) from TOML.
//!
//! Every key is optional; see `Prompts` and `PipelineSettings` for defaults.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub pipeline: PipelineSettings,
}

/// Prompts sent to the generation backend. Override them in TOML to tune tone.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub assistant_system: String,
  pub title_system: String,
  /// `{conversation}` is replaced by the first few exchanged messages.
  pub title_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      assistant_system: "You are StudyQuest's study assistant. Explain concepts clearly and encourage the learner. Keep answers focused and friendly.".into(),
      title_system: "You name conversations. Reply with the title only.".into(),
      title_user_template: "Based on this conversation, generate a concise and descriptive title (max 40 characters):\n\n{conversation}".into(),
    }
  }
}

/// Retry, timeout and queue limits of the conversation pipeline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
  /// Total backend calls allowed per request while rate limited.
  pub max_attempts: u32,
  pub retry_base_delay_ms: u64,
  pub completion_timeout_secs: u64,
  pub title_timeout_secs: u64,
  /// How many leading messages feed title generation.
  pub title_context_messages: usize,
  /// Requests allowed to wait per session.
  pub max_pending: usize,
  /// A session with no commands for this long shuts down and is evicted.
  pub session_idle_secs: u64,
}

impl Default for PipelineSettings {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      retry_base_delay_ms: 2000,
      completion_timeout_secs: 30,
      title_timeout_secs: 5,
      title_context_messages: 5,
      max_pending: 8,
      session_idle_secs: 900,
    }
  }
}

impl PipelineSettings {
  /// Delay before retrying after the given (1-based) failed attempt.
  pub fn retry_delay(&self, attempt: u32) -> Duration {
    Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
  }

  pub fn completion_timeout(&self) -> Duration {
    Duration::from_secs(self.completion_timeout_secs)
  }

  pub fn title_timeout(&self) -> Duration {
    Duration::from_secs(self.title_timeout_secs)
  }

  pub fn session_idle(&self) -> Duration {
    Duration::from_secs(self.session_idle_secs)
  }
}

pub fn parse_config(s: &str) -> Result<AppConfig, toml::de::Error> {
  toml::from_str::<AppConfig>(s)
}

/// Load `AppConfig` from STUDYQUEST_CONFIG_PATH. Falls back to defaults on any error.
pub fn load_config_from_env() -> AppConfig {
  let Ok(path) = std::env::var("STUDYQUEST_CONFIG_PATH") else {
    return AppConfig::default();
  };
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_config(&s) {
      Ok(cfg) => {
        info!(target: "studyquest", %path, "Loaded config (TOML)");
        cfg
      }
      Err(e) => {
        error!(target: "studyquest", %path, error = %e, "Failed to parse TOML config; using defaults");
        AppConfig::default()
      }
    },
    Err(e) => {
      error!(target: "studyquest", %path, error = %e, "Failed to read TOML config file; using defaults");
      AppConfig::default()
    }
  }
}
