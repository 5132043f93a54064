use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ASSISTANT_ROLE: &str = "assistant";
pub const USER_ROLE: &str = "user";

const TITLE_MAX_CHARS: usize = 50;
const HISTORY_CONTENT_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub created_at: String,
}

/// File-backed conversation record: title, accumulated style preferences,
/// and the ordered message history. The persisted file is the unit of
/// consistency; every mutation rewrites it in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStore {
    #[serde(skip)]
    path: PathBuf,
    pub session_id: String,
    pub created_at: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    preferred_styles: Vec<String>,
    #[serde(default)]
    messages: Vec<MessageRecord>,
}

impl SessionStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(mut loaded) = read_session(&path) {
            loaded.path = path;
            return loaded;
        }
        Self {
            path,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            title: None,
            preferred_styles: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Titles the conversation from its first user message.
    pub fn auto_title(&mut self, text: &str) {
        if self.title.is_some() {
            return;
        }
        let trimmed = text.trim();
        let title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        if title.is_empty() {
            return;
        }
        if trimmed.chars().count() > TITLE_MAX_CHARS {
            self.title = Some(format!("{title}..."));
        } else {
            self.title = Some(title);
        }
    }

    pub fn preferred_styles(&self) -> &[String] {
        &self.preferred_styles
    }

    /// Unions new styles into the preference set. Entries are never removed.
    /// Returns the styles that were actually new.
    pub fn add_styles(&mut self, styles: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for style in styles {
            let normalized = style.trim().to_lowercase();
            if normalized.is_empty() || self.preferred_styles.contains(&normalized) {
                continue;
            }
            self.preferred_styles.push(normalized.clone());
            added.push(normalized);
        }
        added
    }

    pub fn push_user_message(&mut self, content: &str) {
        self.messages.push(MessageRecord {
            role: USER_ROLE.to_string(),
            content: content.to_string(),
            intent: None,
            artifacts: Vec::new(),
            created_at: now_utc_iso(),
        });
    }

    pub fn push_assistant_message(
        &mut self,
        content: &str,
        intent: &str,
        artifacts: Vec<String>,
    ) {
        self.messages.push(MessageRecord {
            role: ASSISTANT_ROLE.to_string(),
            content: content.to_string(),
            intent: Some(intent.to_string()),
            artifacts,
            created_at: now_utc_iso(),
        });
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    /// The most recent turns as (role, truncated content), oldest first.
    pub fn recent_messages(&self, limit: usize) -> Vec<(String, String)> {
        let start = self.messages.len().saturating_sub(limit);
        self.messages[start..]
            .iter()
            .map(|message| {
                (
                    message.role.clone(),
                    truncate_chars(&message.content, HISTORY_CONTENT_MAX_CHARS),
                )
            })
            .collect()
    }

    /// Resolved intent of the most recent assistant message, if any.
    pub fn last_assistant_intent(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == ASSISTANT_ROLE)
            .and_then(|message| message.intent.clone())
    }

    /// Location of the most recent assistant artifact, if any.
    pub fn last_assistant_artifact(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|message| message.role == ASSISTANT_ROLE)
            .find_map(|message| message.artifacts.last().cloned())
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == USER_ROLE)
            .map(|message| message.content.clone())
    }
}

fn read_session(path: &Path) -> Option<SessionStore> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
