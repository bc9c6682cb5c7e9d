//! Transaction facts and the balance movements they record.
//!
//! A transaction row is written only together with the balance changes it
//! describes, inside the caller's database transaction. Rows are never
//! updated or deleted afterwards.

use jiff_sqlx::ToSqlx;
use payloads::{
    AccountId, LeagueId, Transaction, TransactionCategory, TransactionId,
    UserId, responses::TransactionPage,
};
use sqlx::{PgPool, Postgres};

use super::StoreError;
use super::account::lock_accounts_tx;
use crate::time::TimeSource;

pub const MAX_PAGE_SIZE: i64 = 100;

const TRANSACTION_SELECT: &str = r#"
    SELECT
        t.id,
        t.league_id,
        t.from_account_id,
        t.to_account_id,
        from_names.owner_name AS from_name,
        to_names.owner_name AS to_name,
        t.amount,
        t.category,
        t.description,
        t.created_by,
        t.created_at
    FROM transactions t
    JOIN account_owner_names from_names
        ON from_names.account_id = t.from_account_id
    JOIN account_owner_names to_names
        ON to_names.account_id = t.to_account_id
"#;

/// A transfer that has passed validation and authorization.
#[derive(Debug, Clone)]
pub(crate) struct NewTransaction<'a> {
    pub league_id: LeagueId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub category: TransactionCategory,
    pub description: Option<&'a str>,
    pub created_by: Option<UserId>,
}

/// Move `amount` between two accounts and record the fact.
///
/// With `use_balance` the source is debited first and the call fails with
/// [`StoreError::InsufficientBalance`] if that would take it below zero. The
/// caller must then drop the transaction. Without it, nothing is debited and
/// the amount is newly issued.
pub(crate) async fn create_transaction_tx(
    new: &NewTransaction<'_>,
    use_balance: bool,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, Postgres>,
) -> Result<Transaction, StoreError> {
    let now = time_source.now().to_sqlx();

    lock_accounts_tx(&[new.from_account_id, new.to_account_id], tx).await?;

    if use_balance {
        let remaining: i64 = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET balance = balance - $2, updated_at = $3
            WHERE id = $1
            RETURNING balance
            "#,
        )
        .bind(new.from_account_id)
        .bind(new.amount)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        if remaining < 0 {
            return Err(StoreError::InsufficientBalance);
        }
    }

    sqlx::query(
        r#"
        UPDATE accounts
        SET balance = balance + $2, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(new.to_account_id)
    .bind(new.amount)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let transaction_id: TransactionId = sqlx::query_scalar(
        r#"
        INSERT INTO transactions (
            league_id,
            from_account_id,
            to_account_id,
            amount,
            category,
            description,
            created_by,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(new.league_id)
    .bind(new.from_account_id)
    .bind(new.to_account_id)
    .bind(new.amount)
    .bind(new.category)
    .bind(new.description)
    .bind(new.created_by)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;

    get_transaction_tx(&transaction_id, tx).await
}

pub(crate) async fn get_transaction_tx(
    transaction_id: &TransactionId,
    tx: &mut sqlx::Transaction<'_, Postgres>,
) -> Result<Transaction, StoreError> {
    let transaction = sqlx::query_as::<_, Transaction>(&format!(
        "{TRANSACTION_SELECT} WHERE t.id = $1"
    ))
    .bind(transaction_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(transaction)
}

/// Normalize a 1-based page request. Returns (page, page_size, offset).
pub fn page_bounds(page: i64, page_size: i64) -> (i64, i64, i64) {
    let page = page.max(1);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1).saturating_mul(page_size);
    (page, page_size, offset)
}

/// All transactions of a league, newest first.
pub async fn list_league_transactions(
    league_id: &LeagueId,
    page: i64,
    page_size: i64,
    pool: &PgPool,
) -> Result<TransactionPage, StoreError> {
    let (page, page_size, offset) = page_bounds(page, page_size);

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transactions WHERE league_id = $1",
    )
    .bind(league_id)
    .fetch_one(pool)
    .await?;

    let transactions = sqlx::query_as::<_, Transaction>(&format!(
        r#"{TRANSACTION_SELECT}
        WHERE t.league_id = $1
        ORDER BY t.created_at DESC, t.id DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(league_id)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(TransactionPage {
        transactions,
        total,
        page,
        page_size,
    })
}

/// Transactions touching one account on either side, newest first.
pub async fn list_account_transactions(
    account_id: &AccountId,
    page: i64,
    page_size: i64,
    pool: &PgPool,
) -> Result<TransactionPage, StoreError> {
    let (page, page_size, offset) = page_bounds(page, page_size);

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
            .bind(account_id)
            .fetch_one(pool)
            .await?;
    if !exists {
        return Err(StoreError::AccountNotFound);
    }

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM transactions
        WHERE from_account_id = $1 OR to_account_id = $1
        "#,
    )
    .bind(account_id)
    .fetch_one(pool)
    .await?;

    let transactions = sqlx::query_as::<_, Transaction>(&format!(
        r#"{TRANSACTION_SELECT}
        WHERE t.from_account_id = $1 OR t.to_account_id = $1
        ORDER BY t.created_at DESC, t.id DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(account_id)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(TransactionPage {
        transactions,
        total,
        page,
        page_size,
    })
}
