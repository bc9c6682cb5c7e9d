//! Coupon discounts.
//!
//! A coupon belongs to one product and is identified by its code within that
//! product. Redeeming one happens inside a purchase: the coupon row is locked,
//! checked, and its usage recorded in the same database transaction that
//! charges the buyer.

use jiff::Timestamp;
use jiff_sqlx::ToSqlx;
use payloads::{
    Coupon, CouponId, DiscountType, ProductId, SubscriptionId, UserId,
    requests::{COUPON_CODE_MAX_LEN, CreateCoupon},
    responses::CouponQuote,
};
use sqlx::{PgPool, Postgres, Transaction};

use super::{StoreError, begin, get_product_tx};
use crate::time::TimeSource;

/// Amount taken off `base_price`. Never more than `base_price`.
///
/// Percentage discounts truncate toward zero.
pub fn calculate_discount(coupon: &Coupon, base_price: i64) -> i64 {
    let base_price = base_price.max(0);
    let discount = match coupon.discount_type {
        DiscountType::Fixed => coupon.discount_value,
        DiscountType::Percentage => {
            let scaled =
                i128::from(base_price) * i128::from(coupon.discount_value) / 100;
            i64::try_from(scaled).unwrap_or(base_price)
        }
    };
    discount.clamp(0, base_price)
}

/// Checks that don't depend on who is redeeming.
pub fn validate(coupon: &Coupon, now: Timestamp) -> Result<(), StoreError> {
    if now > coupon.expires_at {
        return Err(StoreError::CouponExpired);
    }
    if coupon.max_uses > 0 && coupon.used_count >= coupon.max_uses {
        return Err(StoreError::CouponMaxUsed);
    }
    Ok(())
}

async fn get_coupon_by_code_tx(
    product_id: &ProductId,
    code: &str,
    for_update: bool,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Coupon, StoreError> {
    let query = if for_update {
        "SELECT * FROM coupons WHERE product_id = $1 AND code = $2 FOR UPDATE"
    } else {
        "SELECT * FROM coupons WHERE product_id = $1 AND code = $2"
    };
    sqlx::query_as::<_, Coupon>(query)
        .bind(product_id)
        .bind(code)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::CouponNotFound)
}

/// Lock a coupon for redemption by `user_id` and check it can be used.
pub(crate) async fn lock_redeemable_coupon_tx(
    product_id: &ProductId,
    code: &str,
    user_id: &UserId,
    now: Timestamp,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Coupon, StoreError> {
    let coupon = get_coupon_by_code_tx(product_id, code, true, tx).await?;
    validate(&coupon, now)?;
    check_user_eligibility_tx(&coupon, user_id, tx).await?;
    Ok(coupon)
}

async fn check_user_eligibility_tx(
    coupon: &Coupon,
    user_id: &UserId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    if !coupon.once_per_user {
        return Ok(());
    }
    let used: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM coupon_usages WHERE coupon_id = $1 AND user_id = $2
        )
        "#,
    )
    .bind(coupon.id)
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;
    if used {
        return Err(StoreError::CouponAlreadyUsed);
    }
    Ok(())
}

/// Record one redemption. The coupon row must already be locked by this
/// transaction.
pub(crate) async fn record_usage_tx(
    coupon_id: &CouponId,
    user_id: &UserId,
    subscription_id: &SubscriptionId,
    time_source: &TimeSource,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO coupon_usages (coupon_id, user_id, subscription_id, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(coupon_id)
    .bind(user_id)
    .bind(subscription_id)
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE coupons SET used_count = used_count + 1 WHERE id = $1")
        .bind(coupon_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Preview a coupon against a product's base price without redeeming it.
///
/// With a `user_id` the per-user limit is checked too.
pub async fn validate_coupon(
    code: &str,
    product_id: &ProductId,
    user_id: Option<&UserId>,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<CouponQuote, StoreError> {
    let mut tx = pool.begin().await?;
    let product = get_product_tx(product_id, &mut tx).await?;
    let coupon = get_coupon_by_code_tx(product_id, code, false, &mut tx).await?;
    validate(&coupon, time_source.now())?;
    if let Some(user_id) = user_id {
        check_user_eligibility_tx(&coupon, user_id, &mut tx).await?;
    }

    let discount = calculate_discount(&coupon, product.price);
    Ok(CouponQuote {
        coupon,
        base_price: product.price,
        discount,
        final_price: product.price - discount,
    })
}

fn map_coupon_code_unique_error(e: sqlx::Error, code: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e
        && db_err.is_unique_violation()
        && db_err.constraint() == Some("coupons_product_code_unique")
    {
        return StoreError::CouponCodeTaken {
            code: code.to_string(),
        };
    }
    e.into()
}

#[tracing::instrument(skip(pool, time_source))]
pub async fn create_coupon(
    product_id: &ProductId,
    request: &CreateCoupon,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Coupon, StoreError> {
    if request.code.chars().count() > COUPON_CODE_MAX_LEN {
        return Err(StoreError::FieldTooLong);
    }
    let valid_value = match request.discount_type {
        DiscountType::Fixed => request.discount_value >= 0,
        DiscountType::Percentage => (0..=100).contains(&request.discount_value),
    };
    if !valid_value || request.max_uses < 0 {
        return Err(StoreError::InvalidDiscount);
    }

    let mut tx = begin(pool).await?;
    get_product_tx(product_id, &mut tx).await?;

    let coupon = sqlx::query_as::<_, Coupon>(
        r#"
        INSERT INTO coupons (
            product_id,
            code,
            discount_type,
            discount_value,
            max_uses,
            used_count,
            once_per_user,
            expires_at,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(product_id)
    .bind(&request.code)
    .bind(request.discount_type)
    .bind(request.discount_value)
    .bind(request.max_uses)
    .bind(request.once_per_user)
    .bind(request.expires_at.to_sqlx())
    .bind(time_source.now().to_sqlx())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| map_coupon_code_unique_error(e, &request.code))?;

    tx.commit().await?;
    Ok(coupon)
}

pub async fn list_coupons(
    product_id: &ProductId,
    pool: &PgPool,
) -> Result<Vec<Coupon>, StoreError> {
    let coupons = sqlx::query_as::<_, Coupon>(
        "SELECT * FROM coupons WHERE product_id = $1 ORDER BY created_at, code",
    )
    .bind(product_id)
    .fetch_all(pool)
    .await?;
    Ok(coupons)
}
