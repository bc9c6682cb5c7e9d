use crate::{AccountId, DiscountType, ProductId, ProductOptionId, TransactionCategory};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

pub const DESCRIPTION_MAX_LEN: usize = 500;
pub const COUPON_CODE_MAX_LEN: usize = 64;

/// A privileged (league administrator) transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransaction {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub category: TransactionCategory,
    pub description: Option<String>,
    /// Defaults to true. False requests issuance, which only the league's
    /// system account may originate.
    #[serde(default)]
    pub use_balance: Option<bool>,
}

/// A self-service transfer by a league participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTransfer {
    /// None sends from the caller's own participant account.
    pub from_account_id: Option<AccountId>,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub category: TransactionCategory,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    pub product_id: ProductId,
    pub option_id: Option<ProductOptionId>,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCoupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    /// 0 means unlimited.
    pub max_uses: i32,
    pub once_per_user: bool,
    pub expires_at: Timestamp,
}
