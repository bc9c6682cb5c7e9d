//! Types shared between the ledger engine and its callers.
//!
//! Ids are thin newtypes over UUIDs so they can't be mixed up at call sites.
//! With the `use-sqlx` feature they bind directly in queries.

pub mod requests;
pub mod responses;

use derive_more::Display;
use jiff::Timestamp;
#[cfg(feature = "use-sqlx")]
use jiff_sqlx::Timestamp as SqlxTs;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct LeagueId(pub Uuid);

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct AccountId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct TeamId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct ParticipantId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct UserId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct ProductId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct ProductOptionId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct TransactionId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct SubscriptionId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct CouponId(pub Uuid);

/// Database discriminant for [`AccountOwner`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "account_owner_type", rename_all = "snake_case")
)]
pub enum AccountOwnerType {
    Team,
    Participant,
    System,
}

/// Who holds an account.
///
/// Stored as an (owner_type, owner_id) pair. The system account of a league
/// uses the league's own id as its owner_id, which makes it unique per league
/// under the (league_id, owner_id, owner_type) constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AccountOwner {
    Team(TeamId),
    Participant(ParticipantId),
    System,
}

impl AccountOwner {
    pub fn owner_type(&self) -> AccountOwnerType {
        match self {
            Self::Team(_) => AccountOwnerType::Team,
            Self::Participant(_) => AccountOwnerType::Participant,
            Self::System => AccountOwnerType::System,
        }
    }

    /// The owner_id column value for an account in `league_id`.
    pub fn owner_id(&self, league_id: &LeagueId) -> Uuid {
        match self {
            Self::Team(team_id) => team_id.0,
            Self::Participant(participant_id) => participant_id.0,
            Self::System => league_id.0,
        }
    }

    pub fn from_parts(owner_type: AccountOwnerType, owner_id: Uuid) -> Self {
        match owner_type {
            AccountOwnerType::Team => Self::Team(TeamId(owner_id)),
            AccountOwnerType::Participant => {
                Self::Participant(ParticipantId(owner_id))
            }
            AccountOwnerType::System => Self::System,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub league_id: LeagueId,
    pub owner: AccountOwner,
    /// Resolved from the owner tables when the account is read.
    pub owner_name: String,
    pub balance: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "transaction_category", rename_all = "snake_case")
)]
pub enum TransactionCategory {
    Prize,
    Transfer,
    Penalty,
    Sponsorship,
    Purchase,
    Other,
}

/// A recorded movement of funds, annotated with the current display names of
/// both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct Transaction {
    pub id: TransactionId,
    pub league_id: LeagueId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub from_name: String,
    pub to_name: String,
    pub amount: i64,
    pub category: TransactionCategory,
    pub description: Option<String>,
    pub created_by: Option<UserId>,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub created_at: Timestamp,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "participant_status", rename_all = "snake_case")
)]
pub enum ParticipantStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "product_status", rename_all = "snake_case")
)]
pub enum ProductStatus {
    Active,
    Inactive,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "subscription_status", rename_all = "snake_case")
)]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub league_id: LeagueId,
    /// None only when a coupon brought the price down to zero.
    pub transaction_id: Option<TransactionId>,
    pub option_id: Option<ProductOptionId>,
    pub status: SubscriptionStatus,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub started_at: Timestamp,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub expires_at: Timestamp,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub updated_at: Timestamp,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "discount_type", rename_all = "snake_case")
)]
pub enum DiscountType {
    Fixed,
    Percentage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct Coupon {
    pub id: CouponId,
    pub product_id: ProductId,
    pub code: String,
    pub discount_type: DiscountType,
    /// Currency units for fixed coupons, 0-100 for percentage coupons.
    pub discount_value: i64,
    /// 0 means unlimited.
    pub max_uses: i32,
    pub used_count: i32,
    pub once_per_user: bool,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub expires_at: Timestamp,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub created_at: Timestamp,
}

/// Capability granted to a user while they hold a subscription to a product.
///
/// Rendered as `product.<uuid>` inside the user's permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("product.{_0}")]
pub struct ProductPermission(pub ProductId);

impl ProductPermission {
    const PREFIX: &'static str = "product.";

    pub fn key(&self) -> String {
        self.to_string()
    }

    /// True if `permissions` contains this capability.
    pub fn is_granted<S: AsRef<str>>(&self, permissions: &[S]) -> bool {
        permissions.iter().any(|p| {
            p.as_ref()
                .parse::<ProductPermission>()
                .is_ok_and(|parsed| parsed == *self)
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("not a product permission: {0}")]
pub struct InvalidPermission(String);

impl FromStr for ProductPermission {
    type Err = InvalidPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .strip_prefix(Self::PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .ok_or_else(|| InvalidPermission(s.to_string()))?;
        Ok(Self(ProductId(id)))
    }
}
