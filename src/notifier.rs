//! Single-message delivery to Telegram. One attempt per call, no retries.
use async_trait::async_trait;
use std::time::Duration;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::RequestError;
use thiserror::Error;
use tracing::debug;

use crate::model::{MarkupFormat, RenderedNotification};

#[derive(Debug, Error)]
pub enum SendErrorKind {
    #[error("{0}")]
    Request(#[from] RequestError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("failed to send notification to {recipient}: {kind}")]
pub struct SendError {
    pub recipient: i64,
    #[source]
    pub kind: SendErrorKind,
}

impl SendError {
    pub fn new(recipient: i64, kind: impl Into<SendErrorKind>) -> Self {
        Self {
            recipient,
            kind: kind.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &RenderedNotification) -> Result<(), SendError>;
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    bot: Bot,
    timeout: Duration,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, timeout: Duration) -> Self {
        Self { bot, timeout }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, notification: &RenderedNotification) -> Result<(), SendError> {
        let chat = ChatId(notification.recipient);
        let parse_mode = match notification.format {
            MarkupFormat::MarkdownV2 => ParseMode::MarkdownV2,
        };
        let request = self
            .bot
            .send_message(chat, notification.body.clone())
            .parse_mode(parse_mode);
        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(message)) => {
                debug!(recipient = notification.recipient, message_id = message.id.0, "sent");
                Ok(())
            }
            Ok(Err(err)) => Err(SendError::new(notification.recipient, err)),
            Err(_) => Err(SendError::new(
                notification.recipient,
                SendErrorKind::Timeout(self.timeout),
            )),
        }
    }
}
