use serde::{Deserialize, Serialize};
use std::fmt;

/// "New recipe" event as published by the content platform.
///
/// The producer serializes Go-style keys (`CreatorID`, `RecipeID`); the
/// snake_case names are accepted as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContentPublishedEvent {
    #[serde(rename = "CreatorID", alias = "creator_id")]
    pub creator_id: i64,
    #[serde(rename = "RecipeID", alias = "content_id")]
    pub content_id: i64,
}

/// `subscriber_id` follows `creator_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub creator_id: i64,
    pub subscriber_id: i64,
}

/// Site user linked to a Telegram chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkedAccount {
    pub subscriber_id: i64,
    pub external_recipient_id: i64,
}

/// Markup dialect the body is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupFormat {
    MarkdownV2,
}

/// One message for one recipient; built per (event, subscriber) and dropped after sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedNotification {
    pub recipient: i64,
    pub body: String,
    pub format: MarkupFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
