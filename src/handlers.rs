//! Chat commands for linking a Telegram chat to a site account.
//!
//! `/login` puts the chat into a pending state; the next plain text message is
//! treated as the one-time code issued by the site and checked against the
//! backend.
use crate::db;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{info, instrument, warn};

const SERVER_ERROR: &str = "Oops! Something went wrong on the server, please try again a bit later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    Valid { user_id: i64 },
    Invalid,
    Failed,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn check(&self, token: &str) -> TokenCheck;
}

/// Checks login codes with `POST {base}/auth/checktgtoken`.
#[derive(Debug, Clone)]
pub struct BackendAuth {
    http: Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct CheckTokenResponse {
    user_id: i64,
}

impl BackendAuth {
    pub fn new(base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        let http = Client::builder()
            .user_agent("tg-recipe-relay/0.1")
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/auth/checktgtoken", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TokenVerifier for BackendAuth {
    async fn check(&self, token: &str) -> TokenCheck {
        let res = match self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
        {
            Ok(res) => res,
            Err(err) => {
                warn!(?err, "token check request failed");
                return TokenCheck::Failed;
            }
        };
        match res.status() {
            StatusCode::OK => match res.json::<CheckTokenResponse>().await {
                Ok(body) => TokenCheck::Valid {
                    user_id: body.user_id,
                },
                Err(err) => {
                    warn!(?err, "invalid token check response");
                    TokenCheck::Failed
                }
            },
            StatusCode::BAD_REQUEST => TokenCheck::Invalid,
            status => {
                warn!(%status, "unexpected token check status");
                TokenCheck::Failed
            }
        }
    }
}

#[instrument(skip_all)]
pub async fn handle_update(
    bot: &Bot,
    pool: &db::Pool,
    verifier: &dyn TokenVerifier,
    msg: &Message,
) -> Result<()> {
    let (Some(user), Some(text)) = (msg.from(), msg.text()) else {
        return Ok(());
    };
    let tg_user_id = user.id.0 as i64;
    if let Some(reply) = handle_text(pool, verifier, tg_user_id, &user.first_name, text).await? {
        bot.send_message(msg.chat.id, reply).await?;
    }
    Ok(())
}

/// Decide the reply for one text message. `None` means stay silent.
pub async fn handle_text(
    pool: &db::Pool,
    verifier: &dyn TokenVerifier,
    tg_user_id: i64,
    first_name: &str,
    text: &str,
) -> Result<Option<String>> {
    let trimmed = text.trim();
    // "/login@recipe_bot" in group chats
    let command = trimmed
        .strip_prefix('/')
        .map(|c| c.split(['@', ' ']).next().unwrap_or(c));

    match command {
        Some("start") => {
            db::clear_pending_login(pool, tg_user_id).await?;
            let reply = if db::linked_account_by_telegram(pool, tg_user_id).await?.is_some() {
                format!(
                    "Hi, {}! As soon as someone you follow posts a recipe, I will let you know.",
                    first_name
                )
            } else {
                format!(
                    "Hi, {}! Please generate a login code on the site and send it to me using the /login command.",
                    first_name
                )
            };
            Ok(Some(reply))
        }
        Some("login") => {
            db::clear_pending_login(pool, tg_user_id).await?;
            if db::linked_account_by_telegram(pool, tg_user_id).await?.is_some() {
                return Ok(Some(
                    "You are already logged in. To log out, send /logout.".into(),
                ));
            }
            db::begin_pending_login(pool, tg_user_id).await?;
            Ok(Some("Send me the code you generated:".into()))
        }
        Some("logout") => {
            db::clear_pending_login(pool, tg_user_id).await?;
            if db::unlink_account(pool, tg_user_id).await? {
                info!(tg_user_id, "account unlinked");
                Ok(Some(
                    "You have logged out. To log in again, send /login.".into(),
                ))
            } else {
                Ok(Some("You are not logged in.".into()))
            }
        }
        Some(_) => Ok(Some("Unknown command.".into())),
        None if trimmed.is_empty() => Ok(None),
        None => {
            if !db::has_pending_login(pool, tg_user_id).await? {
                return Ok(None);
            }
            match verifier.check(trimmed).await {
                TokenCheck::Valid { user_id } => {
                    if let Err(err) = db::link_account(pool, user_id, tg_user_id).await {
                        warn!(?err, user_id, tg_user_id, "failed to link account");
                        db::clear_pending_login(pool, tg_user_id).await?;
                        return Ok(Some(SERVER_ERROR.into()));
                    }
                    info!(user_id, tg_user_id, "account linked");
                    Ok(Some("You have logged in successfully!".into()))
                }
                // stay pending so the user can retry
                TokenCheck::Invalid => Ok(Some(
                    "This code is not valid, please try again.".into(),
                )),
                TokenCheck::Failed => {
                    db::clear_pending_login(pool, tg_user_id).await?;
                    Ok(Some(SERVER_ERROR.into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    struct FixedVerifier(TokenCheck);

    #[async_trait]
    impl TokenVerifier for FixedVerifier {
        async fn check(&self, _token: &str) -> TokenCheck {
            self.0
        }
    }

    async fn setup_pool() -> db::Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn login_flow_links_account() {
        let pool = setup_pool().await;
        let ok = FixedVerifier(TokenCheck::Valid { user_id: 3 });

        let reply = handle_text(&pool, &ok, 1003, "Anna", "/start").await.unwrap();
        assert!(reply.unwrap().contains("/login"));

        // plain text without /login is ignored
        assert!(handle_text(&pool, &ok, 1003, "Anna", "abc").await.unwrap().is_none());

        let reply = handle_text(&pool, &ok, 1003, "Anna", "/login").await.unwrap();
        assert_eq!(reply.as_deref(), Some("Send me the code you generated:"));

        let reply = handle_text(&pool, &ok, 1003, "Anna", " code-123 ").await.unwrap();
        assert_eq!(reply.as_deref(), Some("You have logged in successfully!"));

        let acc = db::linked_account_of(&pool, 3).await.unwrap().unwrap();
        assert_eq!(acc.external_recipient_id, 1003);
        assert!(!db::has_pending_login(&pool, 1003).await.unwrap());

        let reply = handle_text(&pool, &ok, 1003, "Anna", "/login@recipe_bot").await.unwrap();
        assert!(reply.unwrap().contains("already logged in"));
    }

    #[tokio::test]
    async fn invalid_code_keeps_pending_state() {
        let pool = setup_pool().await;
        let bad = FixedVerifier(TokenCheck::Invalid);
        handle_text(&pool, &bad, 5, "Bo", "/login").await.unwrap();
        let reply = handle_text(&pool, &bad, 5, "Bo", "nope").await.unwrap();
        assert!(reply.unwrap().contains("not valid"));
        assert!(db::has_pending_login(&pool, 5).await.unwrap());
    }

    #[tokio::test]
    async fn server_failure_clears_pending_state() {
        let pool = setup_pool().await;
        let failed = FixedVerifier(TokenCheck::Failed);
        handle_text(&pool, &failed, 6, "Cy", "/login").await.unwrap();
        let reply = handle_text(&pool, &failed, 6, "Cy", "code").await.unwrap();
        assert_eq!(reply.as_deref(), Some(SERVER_ERROR));
        assert!(!db::has_pending_login(&pool, 6).await.unwrap());
    }

    #[tokio::test]
    async fn logout_and_unknown_commands() {
        let pool = setup_pool().await;
        let ok = FixedVerifier(TokenCheck::Valid { user_id: 9 });
        let reply = handle_text(&pool, &ok, 1009, "Di", "/logout").await.unwrap();
        assert_eq!(reply.as_deref(), Some("You are not logged in."));

        db::link_account(&pool, 9, 1009).await.unwrap();
        let reply = handle_text(&pool, &ok, 1009, "Di", "/logout").await.unwrap();
        assert!(reply.unwrap().starts_with("You have logged out."));
        assert!(db::linked_account_of(&pool, 9).await.unwrap().is_none());

        let reply = handle_text(&pool, &ok, 1009, "Di", "/help").await.unwrap();
        assert_eq!(reply.as_deref(), Some("Unknown command."));
    }
}
