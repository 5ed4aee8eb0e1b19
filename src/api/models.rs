use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sender id used for every message written by the support team.
pub const ADMIN_SENDER_ID: &str = "admin";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    New,
    Open,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    /// `resolved -> open` only happens through a user send, which forces `open`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Open)
                | (Self::Open, Self::Open)
                | (Self::Open, Self::Resolved)
                | (Self::Resolved, Self::Open)
        )
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
}

/// The `{collection}/{userId}` document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub user_email: Option<String>,
    pub last_message: String,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    pub unread_by_admin: bool,
}

impl ConversationSummary {
    /// Local view of a conversation that has never been written.
    pub fn unwritten(id: &str, user_email: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            user_email: user_email.map(str::to_string),
            ..Self::default()
        }
    }
}

/// Merge-upsert payload. Only `Some` fields are written; the store always
/// stamps `lastUpdatedAt` with its own clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryUpdate {
    pub user_email: Option<String>,
    pub last_message: Option<String>,
    pub status: Option<ConversationStatus>,
    pub unread_by_admin: Option<bool>,
}

impl SummaryUpdate {
    /// What every user send writes after its message lands.
    pub fn user_sent(text: &str, user_email: Option<&str>) -> Self {
        Self {
            user_email: user_email.map(str::to_string),
            last_message: Some(text.to_string()),
            status: Some(ConversationStatus::Open),
            unread_by_admin: Some(true),
        }
    }

    pub fn apply_to(&self, summary: &mut ConversationSummary) {
        if let Some(email) = &self.user_email {
            summary.user_email = Some(email.clone());
        }
        if let Some(text) = &self.last_message {
            summary.last_message = text.clone();
        }
        if let Some(status) = self.status {
            summary.status = status;
        }
        if let Some(unread) = self.unread_by_admin {
            summary.unread_by_admin = unread;
        }
    }
}

/// Claims handed over by the identity provider for a signed-in user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Session {
    pub uid: String,
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
    pub is_admin: bool,
}

impl Identity {
    pub fn user(id: &str, email: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            email: email.map(str::to_string),
            is_admin: false,
        }
    }
}
