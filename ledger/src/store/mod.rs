//! Database store for the league economy.
//!
//! ## Design Decisions
//!
//! ### Atomic units
//! - **One sqlx transaction per operation**: every public mutation opens a
//!   transaction with [`begin`], performs all of its steps on it, and commits
//!   at the end. Returning early with an error drops the transaction, which
//!   rolls back every step, so a failed operation never leaves a partial
//!   balance change, an orphaned transaction row, or a subscription extended
//!   without its funding.
//! - **Bounded lock waits**: [`begin`] sets a transaction-local
//!   `lock_timeout`. Lock timeouts, deadlocks and serialization failures
//!   surface as the retryable [`StoreError::Contention`]; the store never
//!   retries on its own.
//!
//! ### Lock order
//! - Account rows are locked in ascending id order.
//! - A purchase locks accounts, then the subscription row, then the user row.
//! - The expiry sweep locks subscription rows, then user rows.
//!
//! ### Idempotent creation
//! - Accounts are created with `INSERT ... ON CONFLICT DO NOTHING` against
//!   the (league_id, owner_id, owner_type) constraint and then re-read, so
//!   concurrent callers converge on the same row without an application lock.
//!
//! ### Collaborator tables
//! - Leagues, teams, participants, products and users belong to the CRUD
//!   layer. The store only reads them, except for the `permissions` column of
//!   users, which subscriptions grant and revoke.

use derive_more::Display;
use payloads::{
    LeagueId, ParticipantId, ParticipantStatus, ProductId, ProductOptionId,
    ProductStatus, UserId,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

pub mod account;
pub mod authorization;
pub mod coupon;
pub mod finance;
pub mod subscription;
pub mod transaction;

pub use authorization::TransferDenied;

/// Longest time a statement waits for a row lock before giving up.
pub const LOCK_TIMEOUT: &str = "5s";

/// Open an atomic unit with a bounded lock wait.
pub(crate) async fn begin(
    pool: &PgPool,
) -> Result<Transaction<'static, Postgres>, StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(LOCK_TIMEOUT)
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

#[derive(Debug, Clone, FromRow)]
pub struct Participant {
    pub id: ParticipantId,
    pub league_id: LeagueId,
    pub user_id: UserId,
    pub display_name: String,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, FromRow)]
pub struct Product {
    pub id: ProductId,
    pub league_id: LeagueId,
    pub seller_id: UserId,
    pub name: String,
    pub price: i64,
    pub status: ProductStatus,
    /// 0 for products that are not sold as subscriptions.
    pub subscription_days: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProductOption {
    pub id: ProductOptionId,
    pub product_id: ProductId,
    pub name: String,
    pub additional_price: i64,
}

pub(crate) async fn ensure_league_exists_tx(
    league_id: &LeagueId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM leagues WHERE id = $1)")
            .bind(league_id)
            .fetch_one(&mut **tx)
            .await?;
    if !exists {
        return Err(StoreError::LeagueNotFound);
    }
    Ok(())
}

/// The participant record of a user in a league, if any.
pub(crate) async fn get_participant_by_user_tx(
    league_id: &LeagueId,
    user_id: &UserId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<Participant>, StoreError> {
    let participant = sqlx::query_as::<_, Participant>(
        r#"
        SELECT id, league_id, user_id, display_name, status
        FROM participants
        WHERE league_id = $1 AND user_id = $2
        "#,
    )
    .bind(league_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(participant)
}

pub(crate) async fn get_participant_tx(
    participant_id: &ParticipantId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Participant, StoreError> {
    sqlx::query_as::<_, Participant>(
        r#"
        SELECT id, league_id, user_id, display_name, status
        FROM participants
        WHERE id = $1
        "#,
    )
    .bind(participant_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::ParticipantNotFound)
}

pub(crate) async fn get_product_tx(
    product_id: &ProductId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Product, StoreError> {
    sqlx::query_as::<_, Product>(
        r#"
        SELECT id, league_id, seller_id, name, price, status, subscription_days
        FROM products
        WHERE id = $1
        "#,
    )
    .bind(product_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::ProductNotFound)
}

/// An option of a specific product. Options of other products are treated as
/// unknown.
pub(crate) async fn get_product_option_tx(
    product_id: &ProductId,
    option_id: &ProductOptionId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<ProductOption, StoreError> {
    sqlx::query_as::<_, ProductOption>(
        r#"
        SELECT id, product_id, name, additional_price
        FROM product_options
        WHERE id = $1 AND product_id = $2
        "#,
    )
    .bind(option_id)
    .bind(product_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::UnknownOption)
}

/// Caller-facing grouping of [`StoreError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    NotFound,
    InsufficientBalance,
    InvalidRequest,
    Forbidden,
    Conflict,
    CouponExpired,
    CouponMaxUsed,
    CouponAlreadyUsed,
    /// Lock contention; the same call may succeed if retried.
    Retryable,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("League not found")]
    LeagueNotFound,
    #[error("Account not found")]
    AccountNotFound,
    #[error("Product not found")]
    ProductNotFound,
    #[error("Participant not found")]
    ParticipantNotFound,
    #[error("Team not found")]
    TeamNotFound,
    #[error("Subscription not found")]
    SubscriptionNotFound,
    #[error("Coupon not found")]
    CouponNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Amount must be positive")]
    AmountMustBePositive,
    #[error("Cannot transfer from an account to itself")]
    SameAccountTransfer,
    #[error("Account does not belong to this league")]
    AccountNotInLeague,
    #[error("Balance cannot be negative")]
    NegativeBalance,
    #[error("Only the league system account can issue currency")]
    IssuanceRequiresSystemAccount,
    #[error("Unknown product option")]
    UnknownOption,
    #[error("Product is not active")]
    ProductInactive,
    #[error("Product is not sold as a subscription")]
    NotASubscriptionProduct,
    #[error("Seller is not a participant of the product's league")]
    SellerNotParticipant,
    #[error("Subscription is not active")]
    SubscriptionNotActive,
    #[error("Invalid discount")]
    InvalidDiscount,
    #[error("Field too long")]
    FieldTooLong,
    #[error("Forbidden: {0}")]
    Forbidden(#[from] TransferDenied),
    #[error("Coupon has expired")]
    CouponExpired,
    #[error("Coupon has reached its usage limit")]
    CouponMaxUsed,
    #[error("Coupon already used by this user")]
    CouponAlreadyUsed,
    #[error("A coupon with the code '{code}' already exists for this product")]
    CouponCodeTaken { code: String },
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Lock contention, retry the operation")]
    Contention(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        use StoreError::*;
        match self {
            LeagueNotFound | AccountNotFound | ProductNotFound
            | ParticipantNotFound | TeamNotFound | SubscriptionNotFound
            | CouponNotFound | UserNotFound => ErrorKind::NotFound,
            InsufficientBalance => ErrorKind::InsufficientBalance,
            AmountMustBePositive
            | SameAccountTransfer
            | AccountNotInLeague
            | NegativeBalance
            | IssuanceRequiresSystemAccount
            | UnknownOption
            | ProductInactive
            | NotASubscriptionProduct
            | SubscriptionNotActive
            | InvalidDiscount
            | FieldTooLong => ErrorKind::InvalidRequest,
            Forbidden(_) | SellerNotParticipant => ErrorKind::Forbidden,
            CouponExpired => ErrorKind::CouponExpired,
            CouponMaxUsed => ErrorKind::CouponMaxUsed,
            CouponAlreadyUsed => ErrorKind::CouponAlreadyUsed,
            CouponCodeTaken { .. } | NotUnique(_) => ErrorKind::Conflict,
            Contention(_) => ErrorKind::Retryable,
            Database(_) | UnexpectedError(_) => ErrorKind::Internal,
        }
    }
}

/// Postgres error codes that mean "another transaction got there first".
const CONTENTION_CODES: [&str; 3] = [
    "55P03", // lock_not_available (lock_timeout)
    "40P01", // deadlock_detected
    "40001", // serialization_failure
];

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return StoreError::NotUnique(e);
            }
            if db_err
                .code()
                .is_some_and(|code| CONTENTION_CODES.contains(&code.as_ref()))
            {
                return StoreError::Contention(e);
            }
        }
        StoreError::Database(e)
    }
}
