use crate::{
    AccountId, Coupon, Subscription, TransactionCategory, Transaction,
};
use jiff::civil::Date;
use serde::{Deserialize, Serialize};

/// One page of transactions, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    /// Total number of matching transactions across all pages.
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamBalance {
    pub account_id: AccountId,
    pub team_name: String,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category: TransactionCategory,
    pub total: i64,
    pub count: i64,
}

/// Money entering (income) and leaving (expense) circulation on one day, seen
/// from the league's system account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyFlow {
    pub date: Date,
    pub income: i64,
    pub expense: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinanceStats {
    pub total_transacted: i64,
    pub transaction_count: i64,
    pub team_balances: Vec<TeamBalance>,
    pub category_totals: Vec<CategoryTotal>,
    /// One entry per day of the recent window, oldest first, zero-filled.
    pub daily_flows: Vec<DailyFlow>,
}

/// Outcome of a subscribe or renew call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub subscription: Subscription,
    /// None when a coupon brought the price to zero.
    pub transaction: Option<Transaction>,
    pub price: i64,
    pub discount: i64,
    /// True if an existing active subscription was extended.
    pub renewed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    pub subscription: Subscription,
    pub product_name: String,
}

/// Preview of what a coupon would do for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponQuote {
    pub coupon: Coupon,
    pub base_price: i64,
    pub discount: i64,
    pub final_price: i64,
}
