//! Row types returned by repositories.

use crate::model::LinkedAccount;

/// A `tgusers` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TgUserRow {
    pub id: i64,
    pub user_id: i64,
    pub telegram_user_id: i64,
}

impl From<TgUserRow> for LinkedAccount {
    fn from(row: TgUserRow) -> Self {
        LinkedAccount {
            subscriber_id: row.user_id,
            external_recipient_id: row.telegram_user_id,
        }
    }
}
