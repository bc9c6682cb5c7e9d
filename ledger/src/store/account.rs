//! Accounts: one balance per (league, owner).
//!
//! Accounts are created lazily and idempotently. The system account of a
//! league is keyed by the league id, so creating it twice yields the same row.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use payloads::{
    Account, AccountId, AccountOwner, AccountOwnerType, LeagueId,
    ParticipantId, TeamId,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{StoreError, begin, ensure_league_exists_tx};
use crate::time::TimeSource;

/// Row shape of an account joined with its resolved owner name.
#[derive(Debug, Clone, FromRow)]
struct DbAccount {
    id: AccountId,
    league_id: LeagueId,
    owner_type: AccountOwnerType,
    owner_id: Uuid,
    owner_name: String,
    balance: i64,
    #[sqlx(try_from = "SqlxTs")]
    created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    updated_at: Timestamp,
}

impl From<DbAccount> for Account {
    fn from(db: DbAccount) -> Self {
        Account {
            id: db.id,
            league_id: db.league_id,
            owner: AccountOwner::from_parts(db.owner_type, db.owner_id),
            owner_name: db.owner_name,
            balance: db.balance,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

const ACCOUNT_SELECT: &str = r#"
    SELECT
        a.id,
        a.league_id,
        a.owner_type,
        a.owner_id,
        n.owner_name,
        a.balance,
        a.created_at,
        a.updated_at
    FROM accounts a
    JOIN account_owner_names n ON n.account_id = a.id
"#;

/// An account row held under `FOR UPDATE` for the rest of the transaction.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct LockedAccount {
    pub id: AccountId,
    pub league_id: LeagueId,
    pub owner_type: AccountOwnerType,
    pub owner_id: Uuid,
    pub balance: i64,
}

impl LockedAccount {
    pub fn owner(&self) -> AccountOwner {
        AccountOwner::from_parts(self.owner_type, self.owner_id)
    }
}

pub async fn get_account(
    account_id: &AccountId,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let mut tx = pool.begin().await?;
    get_account_tx(account_id, &mut tx).await
}

pub(crate) async fn get_account_tx(
    account_id: &AccountId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Account, StoreError> {
    let db_account = sqlx::query_as::<_, DbAccount>(&format!(
        "{ACCOUNT_SELECT} WHERE a.id = $1"
    ))
    .bind(account_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::AccountNotFound)?;

    Ok(db_account.into())
}

pub async fn get_account_by_owner(
    league_id: &LeagueId,
    owner: AccountOwner,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let mut tx = pool.begin().await?;
    get_account_by_owner_tx(league_id, owner, &mut tx)
        .await?
        .ok_or(StoreError::AccountNotFound)
}

pub(crate) async fn get_account_by_owner_tx(
    league_id: &LeagueId,
    owner: AccountOwner,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<Account>, StoreError> {
    let db_account = sqlx::query_as::<_, DbAccount>(&format!(
        "{ACCOUNT_SELECT} WHERE a.league_id = $1 AND a.owner_type = $2 AND a.owner_id = $3"
    ))
    .bind(league_id)
    .bind(owner.owner_type())
    .bind(owner.owner_id(league_id))
    .fetch_optional(&mut **tx)
    .await?;

    Ok(db_account.map(Account::from))
}

/// Insert a new account with a zero balance.
///
/// Fails with [`StoreError::NotUnique`] if the owner already has an account in
/// the league; use [`ensure_account_tx`] for get-or-create.
pub async fn create_account_tx(
    league_id: &LeagueId,
    owner: AccountOwner,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Account, StoreError> {
    let now = time_source.now();

    let account_id: AccountId = sqlx::query_scalar(
        r#"
        INSERT INTO accounts (
            league_id,
            owner_id,
            owner_type,
            balance,
            created_at,
            updated_at
        )
        VALUES ($1, $2, $3, 0, $4, $4)
        RETURNING id
        "#,
    )
    .bind(league_id)
    .bind(owner.owner_id(league_id))
    .bind(owner.owner_type())
    .bind(now.to_sqlx())
    .fetch_one(&mut **tx)
    .await?;

    get_account_tx(&account_id, tx).await
}

/// Get-or-create the account of `owner` in `league_id`.
///
/// A concurrent creator wins the insert and this call reads its row.
pub(crate) async fn ensure_account_tx(
    league_id: &LeagueId,
    owner: AccountOwner,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Account, StoreError> {
    if let Some(account) = get_account_by_owner_tx(league_id, owner, tx).await?
    {
        return Ok(account);
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO accounts (
            league_id,
            owner_id,
            owner_type,
            balance,
            created_at,
            updated_at
        )
        VALUES ($1, $2, $3, 0, $4, $4)
        ON CONFLICT ON CONSTRAINT accounts_owner_unique DO NOTHING
        "#,
    )
    .bind(league_id)
    .bind(owner.owner_id(league_id))
    .bind(owner.owner_type())
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if inserted > 0 {
        tracing::debug!(%league_id, ?owner, "created account");
    }

    // Either our insert or the concurrent one is visible now.
    get_account_by_owner_tx(league_id, owner, tx)
        .await?
        .ok_or(StoreError::AccountNotFound)
}

#[tracing::instrument(skip(pool, time_source))]
pub async fn get_or_create_system_account(
    league_id: &LeagueId,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let mut tx = begin(pool).await?;
    ensure_league_exists_tx(league_id, &mut tx).await?;
    let account =
        ensure_account_tx(league_id, AccountOwner::System, time_source, &mut tx)
            .await?;
    tx.commit().await?;
    Ok(account)
}

/// Called when a participant is approved.
#[tracing::instrument(skip(pool, time_source))]
pub async fn ensure_participant_account(
    league_id: &LeagueId,
    participant_id: &ParticipantId,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let mut tx = begin(pool).await?;
    let participant = super::get_participant_tx(participant_id, &mut tx).await?;
    if participant.league_id != *league_id {
        return Err(StoreError::ParticipantNotFound);
    }
    let account = ensure_account_tx(
        league_id,
        AccountOwner::Participant(*participant_id),
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;
    Ok(account)
}

/// Called when a team is created.
#[tracing::instrument(skip(pool, time_source))]
pub async fn ensure_team_account(
    league_id: &LeagueId,
    team_id: &TeamId,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let mut tx = begin(pool).await?;
    let team_in_league: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM teams WHERE id = $1 AND league_id = $2)",
    )
    .bind(team_id)
    .bind(league_id)
    .fetch_one(&mut *tx)
    .await?;
    if !team_in_league {
        return Err(StoreError::TeamNotFound);
    }
    let account = ensure_account_tx(
        league_id,
        AccountOwner::Team(*team_id),
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;
    Ok(account)
}

/// Overwrite an account's balance. Administrative correction; no transaction
/// record is written.
#[tracing::instrument(skip(pool, time_source))]
pub async fn set_account_balance(
    account_id: &AccountId,
    balance: i64,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    if balance < 0 {
        return Err(StoreError::NegativeBalance);
    }

    let mut tx = begin(pool).await?;
    let updated = sqlx::query(
        "UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1",
    )
    .bind(account_id)
    .bind(balance)
    .bind(time_source.now().to_sqlx())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(StoreError::AccountNotFound);
    }

    let account = get_account_tx(account_id, &mut tx).await?;
    tx.commit().await?;

    tracing::info!(%account_id, balance, "account balance overwritten");
    Ok(account)
}

/// Every account of a league: system first, then teams, then participants.
pub async fn list_accounts(
    league_id: &LeagueId,
    pool: &PgPool,
) -> Result<Vec<Account>, StoreError> {
    let mut tx = pool.begin().await?;
    ensure_league_exists_tx(league_id, &mut tx).await?;

    let accounts = sqlx::query_as::<_, DbAccount>(&format!(
        r#"{ACCOUNT_SELECT}
        WHERE a.league_id = $1
        ORDER BY
            CASE a.owner_type
                WHEN 'system' THEN 0
                WHEN 'team' THEN 1
                ELSE 2
            END,
            n.owner_name,
            a.id
        "#
    ))
    .bind(league_id)
    .fetch_all(&mut *tx)
    .await?;

    Ok(accounts.into_iter().map(Account::from).collect())
}

/// Lock accounts in ascending id order and return them in that order.
///
/// Every path that touches more than one account goes through here, so two
/// transfers in opposite directions can't deadlock on each other.
pub(crate) async fn lock_accounts_tx(
    account_ids: &[AccountId],
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Vec<LockedAccount>, StoreError> {
    let mut ids = account_ids.to_vec();
    ids.sort();
    ids.dedup();

    let mut locked = Vec::with_capacity(ids.len());
    for account_id in &ids {
        let account = sqlx::query_as::<_, LockedAccount>(
            r#"
            SELECT id, league_id, owner_type, owner_id, balance
            FROM accounts
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::AccountNotFound)?;
        locked.push(account);
    }

    Ok(locked)
}
