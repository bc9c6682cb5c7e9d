//! Subscription lifecycle.
//!
//! ```text
//!            subscribe                 sweep (expires_at <= now)
//!   (none) ------------> active ---------------------------------> expired
//!                        |    ^
//!                        |    | subscribe / renew: same row, expires_at
//!                        |    | pushed out by the product's duration
//!                        +----+
//!                        |
//!                        +--- cancel_subscription ---------------> cancelled
//! ```
//!
//! While a user holds an active subscription, their permission set contains
//! the product's [`ProductPermission`] key. The key is added by the purchase
//! that creates the row and removed by whatever ends it, always in the same
//! database transaction as the status change.
//!
//! A purchase charges the buyer, moves the subscription and records any coupon
//! usage as one unit. Locks are taken in a fixed order: buyer and seller
//! accounts (by id), coupon, subscription row, user row.

use anyhow::anyhow;
use jiff::{SignedDuration, Timestamp};
use jiff_sqlx::ToSqlx;
use payloads::{
    AccountOwner, ParticipantStatus, ProductId, ProductOptionId,
    ProductPermission, ProductStatus, Subscription, SubscriptionId,
    SubscriptionStatus, TransactionCategory, UserId,
    requests::Subscribe,
    responses::{ActiveSubscription, Purchase},
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use super::account::{ensure_account_tx, lock_accounts_tx};
use super::authorization::TransferDenied;
use super::coupon::{
    calculate_discount, lock_redeemable_coupon_tx, record_usage_tx,
};
use super::transaction::{NewTransaction, create_transaction_tx};
use super::{
    StoreError, begin, get_participant_by_user_tx, get_product_option_tx,
    get_product_tx,
};
use crate::time::TimeSource;

/// Subscription length of a product.
fn subscription_duration(days: i32) -> SignedDuration {
    SignedDuration::from_hours(i64::from(days) * 24)
}

/// Buy or extend a subscription to a product.
#[tracing::instrument(skip(pool, time_source))]
pub async fn subscribe(
    user_id: &UserId,
    request: &Subscribe,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Purchase, StoreError> {
    let mut tx = begin(pool).await?;
    let purchase = purchase_tx(
        user_id,
        &request.product_id,
        request.option_id.as_ref(),
        request.coupon_code.as_deref(),
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;
    Ok(purchase)
}

/// Pay for another period of an existing subscription.
///
/// Uses the option recorded on the subscription unless `option_override` is
/// given. Coupons don't apply to renewals. Renewing an expired or cancelled
/// subscription starts a new one.
#[tracing::instrument(skip(pool, time_source))]
pub async fn renew(
    user_id: &UserId,
    subscription_id: &SubscriptionId,
    option_override: Option<ProductOptionId>,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Purchase, StoreError> {
    let mut tx = begin(pool).await?;

    let subscription = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE id = $1 AND user_id = $2",
    )
    .bind(subscription_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::SubscriptionNotFound)?;

    let option_id = option_override.or(subscription.option_id);
    let purchase = purchase_tx(
        user_id,
        &subscription.product_id,
        option_id.as_ref(),
        None,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;
    Ok(purchase)
}

/// The whole purchase flow on an open transaction. Any error leaves the
/// transaction to be rolled back by the caller.
async fn purchase_tx(
    user_id: &UserId,
    product_id: &ProductId,
    option_id: Option<&ProductOptionId>,
    coupon_code: Option<&str>,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Purchase, StoreError> {
    let now = time_source.now();
    let option_id = option_id.copied();

    let product = get_product_tx(product_id, tx).await?;
    if product.status != ProductStatus::Active {
        return Err(StoreError::ProductInactive);
    }
    if product.subscription_days <= 0 {
        return Err(StoreError::NotASubscriptionProduct);
    }
    let additional_price = match &option_id {
        Some(option_id) => {
            get_product_option_tx(product_id, option_id, tx)
                .await?
                .additional_price
        }
        None => 0,
    };
    let total = product
        .price
        .checked_add(additional_price)
        .ok_or_else(|| anyhow!("price of product {} overflows", product.id))?;

    let league_id = product.league_id;
    let buyer = get_participant_by_user_tx(&league_id, user_id, tx)
        .await?
        .ok_or(StoreError::ParticipantNotFound)?;
    if buyer.status != ParticipantStatus::Approved {
        return Err(TransferDenied::NotApproved.into());
    }
    let seller = get_participant_by_user_tx(&league_id, &product.seller_id, tx)
        .await?
        .ok_or(StoreError::SellerNotParticipant)?;

    let buyer_account = ensure_account_tx(
        &league_id,
        AccountOwner::Participant(buyer.id),
        time_source,
        tx,
    )
    .await?;
    let seller_account = ensure_account_tx(
        &league_id,
        AccountOwner::Participant(seller.id),
        time_source,
        tx,
    )
    .await?;

    // Taken even for free purchases so that concurrent purchases by the same
    // buyer run one after the other.
    let locked =
        lock_accounts_tx(&[buyer_account.id, seller_account.id], tx).await?;
    let buyer_balance = locked
        .iter()
        .find(|a| a.id == buyer_account.id)
        .map(|a| a.balance)
        .ok_or(StoreError::AccountNotFound)?;

    let coupon = match coupon_code {
        Some(code) => Some(
            lock_redeemable_coupon_tx(product_id, code, user_id, now, tx)
                .await?,
        ),
        None => None,
    };
    let discount = coupon
        .as_ref()
        .map(|c| calculate_discount(c, total))
        .unwrap_or(0);
    let price = total - discount;

    if buyer_balance < price {
        return Err(StoreError::InsufficientBalance);
    }

    let transaction = if price > 0 {
        if buyer_account.id == seller_account.id {
            return Err(StoreError::SameAccountTransfer);
        }
        let description = format!("Subscription: {}", product.name);
        Some(
            create_transaction_tx(
                &NewTransaction {
                    league_id,
                    from_account_id: buyer_account.id,
                    to_account_id: seller_account.id,
                    amount: price,
                    category: TransactionCategory::Purchase,
                    description: Some(&description),
                    created_by: Some(*user_id),
                },
                true,
                time_source,
                tx,
            )
            .await?,
        )
    } else {
        None
    };
    let transaction_id = transaction.as_ref().map(|t| t.id);
    let duration = subscription_duration(product.subscription_days);

    let active = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE user_id = $1 AND product_id = $2 AND status = 'active'
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .bind(product_id)
    .fetch_optional(&mut **tx)
    .await?;

    let renewed = active.is_some();
    let subscription = match active {
        Some(active) => {
            let expires_at = active
                .expires_at
                .checked_add(duration)
                .map_err(|e| anyhow!("expiry of {} overflows: {e}", active.id))?;
            sqlx::query_as::<_, Subscription>(
                r#"
                UPDATE subscriptions
                SET expires_at = $2,
                    transaction_id = COALESCE($3, transaction_id),
                    option_id = $4,
                    updated_at = $5
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(active.id)
            .bind(expires_at.to_sqlx())
            .bind(transaction_id)
            .bind(option_id)
            .bind(now.to_sqlx())
            .fetch_one(&mut **tx)
            .await?
        }
        None => {
            let expires_at = now.checked_add(duration).map_err(|e| {
                anyhow!("expiry of product {} overflows: {e}", product.id)
            })?;
            sqlx::query_as::<_, Subscription>(
                r#"
                INSERT INTO subscriptions (
                    user_id,
                    product_id,
                    league_id,
                    transaction_id,
                    option_id,
                    status,
                    started_at,
                    expires_at,
                    created_at,
                    updated_at
                )
                VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $6, $6)
                RETURNING *
                "#,
            )
            .bind(user_id)
            .bind(product_id)
            .bind(league_id)
            .bind(transaction_id)
            .bind(option_id)
            .bind(now.to_sqlx())
            .bind(expires_at.to_sqlx())
            .fetch_one(&mut **tx)
            .await?
        }
    };

    if !renewed {
        grant_permission_tx(user_id, ProductPermission(*product_id), now, tx)
            .await?;
    }

    if let Some(coupon) = &coupon {
        record_usage_tx(&coupon.id, user_id, &subscription.id, time_source, tx)
            .await?;
    }

    tracing::info!(
        %user_id,
        %product_id,
        subscription_id = %subscription.id,
        price,
        discount,
        renewed,
        "subscription purchased"
    );

    Ok(Purchase {
        subscription,
        transaction,
        price,
        discount,
        renewed,
    })
}

/// Add `permission` to the user's set unless it is already there.
async fn grant_permission_tx(
    user_id: &UserId,
    permission: ProductPermission,
    now: Timestamp,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE users
        SET permissions = array_append(permissions, $2),
            updated_at = $3
        WHERE id = $1 AND NOT ($2 = ANY(permissions))
        "#,
    )
    .bind(user_id)
    .bind(permission.key())
    .bind(now.to_sqlx())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Remove `permission` unless the user still holds an active subscription to
/// the product.
async fn revoke_permission_tx(
    user_id: &UserId,
    permission: ProductPermission,
    now: Timestamp,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE users
        SET permissions = array_remove(permissions, $2),
            updated_at = $4
        WHERE id = $1
          AND NOT EXISTS (
              SELECT 1 FROM subscriptions
              WHERE user_id = $1 AND product_id = $3 AND status = 'active'
          )
        "#,
    )
    .bind(user_id)
    .bind(permission.key())
    .bind(permission.0)
    .bind(now.to_sqlx())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// End an active subscription early. No refund is made.
#[tracing::instrument(skip(pool, time_source))]
pub async fn cancel_subscription(
    user_id: &UserId,
    subscription_id: &SubscriptionId,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Subscription, StoreError> {
    let now = time_source.now();
    let mut tx = begin(pool).await?;

    let subscription = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE id = $1 AND user_id = $2 FOR UPDATE",
    )
    .bind(subscription_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::SubscriptionNotFound)?;
    if subscription.status != SubscriptionStatus::Active {
        return Err(StoreError::SubscriptionNotActive);
    }

    let cancelled = sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions
        SET status = 'cancelled', updated_at = $2
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(now.to_sqlx())
    .fetch_one(&mut *tx)
    .await?;
    revoke_permission_tx(
        user_id,
        ProductPermission(subscription.product_id),
        now,
        &mut tx,
    )
    .await?;

    tx.commit().await?;
    tracing::info!(%user_id, %subscription_id, "subscription cancelled");
    Ok(cancelled)
}

#[derive(Debug, FromRow)]
struct DueSubscription {
    id: SubscriptionId,
    user_id: UserId,
    product_id: ProductId,
}

/// Expire every active subscription whose time is up and revoke the matching
/// permissions. Returns how many subscriptions were expired.
pub async fn sweep_expired_subscriptions(
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<u64, StoreError> {
    let now = time_source.now();
    let mut tx = begin(pool).await?;

    let mut due = sqlx::query_as::<_, DueSubscription>(
        r#"
        SELECT id, user_id, product_id
        FROM subscriptions
        WHERE status = 'active' AND expires_at <= $1
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(now.to_sqlx())
    .fetch_all(&mut *tx)
    .await?;

    if due.is_empty() {
        return Ok(0);
    }

    for subscription in &due {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(now.to_sqlx())
        .execute(&mut *tx)
        .await?;
    }

    // User rows in a stable order across concurrent sweeps.
    due.sort_by_key(|s| (s.user_id.0, s.product_id.0));
    for subscription in &due {
        revoke_permission_tx(
            &subscription.user_id,
            ProductPermission(subscription.product_id),
            now,
            &mut tx,
        )
        .await?;
    }

    tx.commit().await?;
    Ok(due.len() as u64)
}

/// Whether the user may currently use the product.
pub async fn check_access(
    user_id: &UserId,
    product_id: &ProductId,
    pool: &PgPool,
) -> Result<bool, StoreError> {
    let permissions: Vec<String> =
        sqlx::query_scalar("SELECT permissions FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?
            .ok_or(StoreError::UserNotFound)?;
    if ProductPermission(*product_id).is_granted(&permissions) {
        return Ok(true);
    }

    let active: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM subscriptions
            WHERE user_id = $1 AND product_id = $2 AND status = 'active'
        )
        "#,
    )
    .bind(user_id)
    .bind(product_id)
    .fetch_one(pool)
    .await?;
    Ok(active)
}

#[derive(Debug, FromRow)]
struct ActiveSubscriptionRow {
    #[sqlx(flatten)]
    subscription: Subscription,
    product_name: String,
}

/// A user's active subscriptions, soonest expiry first.
pub async fn list_active_subscriptions(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<Vec<ActiveSubscription>, StoreError> {
    let rows = sqlx::query_as::<_, ActiveSubscriptionRow>(
        r#"
        SELECT s.*, p.name AS product_name
        FROM subscriptions s
        JOIN products p ON p.id = s.product_id
        WHERE s.user_id = $1 AND s.status = 'active'
        ORDER BY s.expires_at, s.id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ActiveSubscription {
            subscription: row.subscription,
            product_name: row.product_name,
        })
        .collect())
}
