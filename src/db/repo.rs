use super::model::TgUserRow;
use crate::model::{LinkedAccount, Subscription};
use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, create the parent directory and make sure the
/// file gets created on first open. Other URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) if q.contains("mode=") => format!("sqlite://{}?{}", path, q),
        Some(q) => format!("sqlite://{}?{}&mode=rwc", path, q),
        None => format!("sqlite://{}?mode=rwc", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Distinct subscribers of `creator_id`. Repeated rows collapse into one.
#[instrument(skip_all)]
pub async fn subscribers_of(pool: &Pool, creator_id: i64) -> Result<Vec<Subscription>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT DISTINCT subscriber_id FROM subscriptions WHERE creator_id = ? ORDER BY subscriber_id",
    )
    .bind(creator_id)
    .fetch_all(pool)
    .await?;
    Ok(ids
        .into_iter()
        .map(|subscriber_id| Subscription {
            creator_id,
            subscriber_id,
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn linked_account_of(pool: &Pool, subscriber_id: i64) -> Result<Option<LinkedAccount>> {
    let row = sqlx::query_as::<_, TgUserRow>(
        "SELECT id, user_id, telegram_user_id FROM tgusers WHERE user_id = ?",
    )
    .bind(subscriber_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(LinkedAccount::from))
}

#[instrument(skip_all)]
pub async fn linked_account_by_telegram(
    pool: &Pool,
    telegram_user_id: i64,
) -> Result<Option<LinkedAccount>> {
    let row = sqlx::query_as::<_, TgUserRow>(
        "SELECT id, user_id, telegram_user_id FROM tgusers WHERE telegram_user_id = ?",
    )
    .bind(telegram_user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(LinkedAccount::from))
}

/// Link a site user to a Telegram chat. Both sides are unique; a conflicting
/// link is reported as an error and nothing is written.
#[instrument(skip_all)]
pub async fn link_account(pool: &Pool, subscriber_id: i64, telegram_user_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    let taken: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM tgusers WHERE user_id = ? OR telegram_user_id = ?",
    )
    .bind(subscriber_id)
    .bind(telegram_user_id)
    .fetch_optional(&mut *tx)
    .await?;
    if taken.is_some() {
        return Err(anyhow!(
            "account already linked (user {}, telegram {})",
            subscriber_id,
            telegram_user_id
        ));
    }
    sqlx::query("INSERT INTO tgusers (user_id, telegram_user_id) VALUES (?, ?)")
        .bind(subscriber_id)
        .bind(telegram_user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM pending_logins WHERE telegram_user_id = ?")
        .bind(telegram_user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Returns whether a link existed.
#[instrument(skip_all)]
pub async fn unlink_account(pool: &Pool, telegram_user_id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM tgusers WHERE telegram_user_id = ?")
        .bind(telegram_user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Idempotent: an existing (creator, subscriber) pair is left as is.
#[instrument(skip_all)]
pub async fn add_subscription(pool: &Pool, creator_id: i64, subscriber_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO subscriptions (creator_id, subscriber_id)
         SELECT ?, ?
         WHERE NOT EXISTS (SELECT 1 FROM subscriptions WHERE creator_id = ? AND subscriber_id = ?)",
    )
    .bind(creator_id)
    .bind(subscriber_id)
    .bind(creator_id)
    .bind(subscriber_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn remove_subscription(pool: &Pool, creator_id: i64, subscriber_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM subscriptions WHERE creator_id = ? AND subscriber_id = ?")
        .bind(creator_id)
        .bind(subscriber_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn begin_pending_login(pool: &Pool, telegram_user_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO pending_logins (telegram_user_id) VALUES (?)
         ON CONFLICT(telegram_user_id) DO UPDATE SET created_at = CURRENT_TIMESTAMP",
    )
    .bind(telegram_user_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn has_pending_login(pool: &Pool, telegram_user_id: i64) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT telegram_user_id FROM pending_logins WHERE telegram_user_id = ?")
            .bind(telegram_user_id)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

#[instrument(skip_all)]
pub async fn clear_pending_login(pool: &Pool, telegram_user_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM pending_logins WHERE telegram_user_id = ?")
        .bind(telegram_user_id)
        .execute(pool)
        .await?;
    Ok(())
}
