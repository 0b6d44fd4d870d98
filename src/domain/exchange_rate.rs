//! Cached NGN prices used when quoting crypto withdrawals.

use crate::domain::{Decimal, TimeMs};
use serde::{Deserialize, Serialize};

/// The single active exchange-rate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRate {
    pub id: i64,
    /// Price of 1 USDT in NGN.
    pub ngn_per_usdt: Decimal,
    /// Price of 1 BNB in NGN.
    pub ngn_per_bnb: Decimal,
    pub fetched_at: TimeMs,
    pub active: bool,
}
