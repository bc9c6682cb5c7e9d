//! Transfers and league-wide finance reporting.
//!
//! Two entry points move money:
//! - [`create_transaction`] for league administrators. May issue new currency
//!   from the system account.
//! - [`create_transaction_as_user`] for participants. Always spends an
//!   existing balance and is checked by
//!   [`authorize_transfer`](super::authorization::authorize_transfer).

use jiff::{SignedDuration, Timestamp, civil::Date, tz::TimeZone};
use jiff_sqlx::ToSqlx;
use payloads::{
    AccountId, AccountOwner, AccountOwnerType, LeagueId, ParticipantStatus,
    Transaction, UserId,
    requests::{CreateTransaction, DESCRIPTION_MAX_LEN, UserTransfer},
    responses::{CategoryTotal, DailyFlow, FinanceStats, TeamBalance},
};
use sqlx::{FromRow, PgPool, Postgres};
use std::collections::HashMap;

use super::account::{LockedAccount, ensure_account_tx, lock_accounts_tx};
use super::authorization::{TransferDenied, authorize_transfer, load_actor_tx};
use super::transaction::{NewTransaction, create_transaction_tx};
use super::{StoreError, begin, ensure_league_exists_tx};
use crate::time::TimeSource;

/// Length of the daily income/expense series in [`FinanceStats`].
pub const STATS_WINDOW_DAYS: i64 = 7;

fn validate_transfer(
    from_account_id: Option<&AccountId>,
    to_account_id: &AccountId,
    amount: i64,
    description: Option<&str>,
) -> Result<(), StoreError> {
    if amount <= 0 {
        return Err(StoreError::AmountMustBePositive);
    }
    if from_account_id == Some(to_account_id) {
        return Err(StoreError::SameAccountTransfer);
    }
    if description.is_some_and(|d| d.chars().count() > DESCRIPTION_MAX_LEN) {
        return Err(StoreError::FieldTooLong);
    }
    Ok(())
}

/// Lock both sides and check they belong to `league_id`. Returns (from, to).
async fn lock_league_accounts_tx(
    league_id: &LeagueId,
    from_account_id: &AccountId,
    to_account_id: &AccountId,
    tx: &mut sqlx::Transaction<'_, Postgres>,
) -> Result<(LockedAccount, LockedAccount), StoreError> {
    let locked =
        lock_accounts_tx(&[*from_account_id, *to_account_id], tx).await?;
    if locked.iter().any(|a| a.league_id != *league_id) {
        return Err(StoreError::AccountNotInLeague);
    }

    let mut by_id: HashMap<AccountId, LockedAccount> =
        locked.into_iter().map(|a| (a.id, a)).collect();
    let from = by_id
        .remove(from_account_id)
        .ok_or(StoreError::AccountNotFound)?;
    let to = by_id
        .remove(to_account_id)
        .ok_or(StoreError::AccountNotFound)?;
    Ok((from, to))
}

/// Privileged transfer between any two accounts of a league.
#[tracing::instrument(skip(pool, time_source))]
pub async fn create_transaction(
    league_id: &LeagueId,
    request: &CreateTransaction,
    created_by: Option<UserId>,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Transaction, StoreError> {
    validate_transfer(
        Some(&request.from_account_id),
        &request.to_account_id,
        request.amount,
        request.description.as_deref(),
    )?;
    let use_balance = request.use_balance.unwrap_or(true);

    let mut tx = begin(pool).await?;
    ensure_league_exists_tx(league_id, &mut tx).await?;

    let (from, to) = lock_league_accounts_tx(
        league_id,
        &request.from_account_id,
        &request.to_account_id,
        &mut tx,
    )
    .await?;
    if !use_balance && from.owner_type != AccountOwnerType::System {
        return Err(StoreError::IssuanceRequiresSystemAccount);
    }

    let transaction = create_transaction_tx(
        &NewTransaction {
            league_id: *league_id,
            from_account_id: from.id,
            to_account_id: to.id,
            amount: request.amount,
            category: request.category,
            description: request.description.as_deref(),
            created_by,
        },
        use_balance,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    if !use_balance {
        tracing::info!(
            %league_id,
            amount = request.amount,
            to = %transaction.to_account_id,
            "issued currency"
        );
    }

    Ok(transaction)
}

/// Self-service transfer by a league participant.
///
/// Without an explicit source the caller's own participant account is used,
/// created on first use once the participant is approved.
#[tracing::instrument(skip(pool, time_source))]
pub async fn create_transaction_as_user(
    league_id: &LeagueId,
    user_id: &UserId,
    request: &UserTransfer,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Transaction, StoreError> {
    validate_transfer(
        request.from_account_id.as_ref(),
        &request.to_account_id,
        request.amount,
        request.description.as_deref(),
    )?;

    let mut tx = begin(pool).await?;
    ensure_league_exists_tx(league_id, &mut tx).await?;
    let actor = load_actor_tx(league_id, user_id, &mut tx).await?;

    let from_account_id = match request.from_account_id {
        Some(account_id) => account_id,
        None => {
            let (participant_id, status) =
                actor.participant.ok_or(StoreError::ParticipantNotFound)?;
            if status != ParticipantStatus::Approved {
                return Err(TransferDenied::NotApproved.into());
            }
            ensure_account_tx(
                league_id,
                AccountOwner::Participant(participant_id),
                time_source,
                &mut tx,
            )
            .await?
            .id
        }
    };
    if from_account_id == request.to_account_id {
        return Err(StoreError::SameAccountTransfer);
    }

    let (from, to) = lock_league_accounts_tx(
        league_id,
        &from_account_id,
        &request.to_account_id,
        &mut tx,
    )
    .await?;
    authorize_transfer(&from.owner(), &actor)?;

    let transaction = create_transaction_tx(
        &NewTransaction {
            league_id: *league_id,
            from_account_id: from.id,
            to_account_id: to.id,
            amount: request.amount,
            category: request.category,
            description: request.description.as_deref(),
            created_by: Some(*user_id),
        },
        true,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    Ok(transaction)
}

#[derive(Debug, FromRow)]
struct DailyFlowRow {
    #[sqlx(try_from = "jiff_sqlx::Date")]
    day: Date,
    income: i64,
    expense: i64,
}

/// Start of `date` in UTC.
fn utc_midnight(date: Date) -> Result<Timestamp, StoreError> {
    let zoned = date
        .to_zoned(TimeZone::UTC)
        .map_err(|e| StoreError::UnexpectedError(e.into()))?;
    Ok(zoned.timestamp())
}

/// Zero-filled, oldest-first series of `days` days ending on `today`.
fn fill_daily_flows(
    today: Date,
    days: i64,
    rows: Vec<DailyFlowRow>,
) -> Vec<DailyFlow> {
    let by_day: HashMap<Date, (i64, i64)> = rows
        .into_iter()
        .map(|r| (r.day, (r.income, r.expense)))
        .collect();

    (0..days)
        .rev()
        .filter_map(|back| today.checked_sub(jiff::Span::new().days(back)).ok())
        .map(|date| {
            let (income, expense) =
                by_day.get(&date).copied().unwrap_or((0, 0));
            DailyFlow {
                date,
                income,
                expense,
            }
        })
        .collect()
}

/// Read-only snapshot of a league's economy. Computed on every call.
#[tracing::instrument(skip(pool, time_source))]
pub async fn get_finance_stats(
    league_id: &LeagueId,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<FinanceStats, StoreError> {
    let mut tx = pool.begin().await?;
    ensure_league_exists_tx(league_id, &mut tx).await?;

    let (total_transacted, transaction_count): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0)::BIGINT, COUNT(*)
        FROM transactions
        WHERE league_id = $1
        "#,
    )
    .bind(league_id)
    .fetch_one(&mut *tx)
    .await?;

    let team_balances: Vec<(AccountId, String, i64)> = sqlx::query_as(
        r#"
        SELECT a.id, t.name, a.balance
        FROM accounts a
        JOIN teams t ON t.id = a.owner_id
        WHERE a.league_id = $1 AND a.owner_type = 'team'
        ORDER BY a.balance DESC, t.name
        "#,
    )
    .bind(league_id)
    .fetch_all(&mut *tx)
    .await?;

    let category_totals: Vec<(payloads::TransactionCategory, i64, i64)> =
        sqlx::query_as(
            r#"
            SELECT category, SUM(amount)::BIGINT, COUNT(*)
            FROM transactions
            WHERE league_id = $1
            GROUP BY category
            ORDER BY category
            "#,
        )
        .bind(league_id)
        .fetch_all(&mut *tx)
        .await?;

    let today = time_source.today_utc();
    let first_day = today
        .checked_sub(jiff::Span::new().days(STATS_WINDOW_DAYS - 1))
        .map_err(|e| StoreError::UnexpectedError(e.into()))?;
    let window_start = utc_midnight(first_day)?;
    let window_end = utc_midnight(today)? + SignedDuration::from_hours(24);

    let flow_rows = sqlx::query_as::<_, DailyFlowRow>(
        r#"
        SELECT
            (t.created_at AT TIME ZONE 'UTC')::DATE AS day,
            COALESCE(SUM(t.amount) FILTER (WHERE src.owner_type = 'system'), 0)::BIGINT
                AS income,
            COALESCE(SUM(t.amount) FILTER (WHERE dst.owner_type = 'system'), 0)::BIGINT
                AS expense
        FROM transactions t
        JOIN accounts src ON src.id = t.from_account_id
        JOIN accounts dst ON dst.id = t.to_account_id
        WHERE t.league_id = $1
          AND t.created_at >= $2
          AND t.created_at < $3
        GROUP BY day
        "#,
    )
    .bind(league_id)
    .bind(window_start.to_sqlx())
    .bind(window_end.to_sqlx())
    .fetch_all(&mut *tx)
    .await?;

    Ok(FinanceStats {
        total_transacted,
        transaction_count,
        team_balances: team_balances
            .into_iter()
            .map(|(account_id, team_name, balance)| TeamBalance {
                account_id,
                team_name,
                balance,
            })
            .collect(),
        category_totals: category_totals
            .into_iter()
            .map(|(category, total, count)| CategoryTotal {
                category,
                total,
                count,
            })
            .collect(),
        daily_flows: fill_daily_flows(today, STATS_WINDOW_DAYS, flow_rows),
    })
}
