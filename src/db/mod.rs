//! Persistence layer: linked Telegram accounts, subscriptions and pending logins.
//!
//! - `model`: row types returned by queries.
//! - `repo`: SQL-only functions over a `SqlitePool`.
//!
//! The relay only reads through the [`SubscriptionResolver`] and
//! [`AccountResolver`] seams; [`Directory`] implements both on top of `repo`.

pub mod model;
pub mod repo;

pub use repo::*;

use crate::model::{LinkedAccount, Subscription};
use anyhow::Result;
use async_trait::async_trait;

/// Who follows a creator. `Ok(vec![])` means no subscribers; `Err` is a query failure.
#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    async fn subscribers_of(&self, creator_id: i64) -> Result<Vec<Subscription>>;
}

/// Maps a site user to their Telegram chat. `Ok(None)` means not linked.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn linked_account_of(&self, subscriber_id: i64) -> Result<Option<LinkedAccount>>;
}

/// Pool-backed resolver; every lookup checks a connection out for a single query.
#[derive(Debug, Clone)]
pub struct Directory {
    pool: Pool,
}

impl Directory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionResolver for Directory {
    async fn subscribers_of(&self, creator_id: i64) -> Result<Vec<Subscription>> {
        repo::subscribers_of(&self.pool, creator_id).await
    }
}

#[async_trait]
impl AccountResolver for Directory {
    async fn linked_account_of(&self, subscriber_id: i64) -> Result<Option<LinkedAccount>> {
        repo::linked_account_of(&self.pool, subscriber_id).await
    }
}
