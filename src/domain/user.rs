//! Users and their withdrawal recipients.

use crate::domain::{Handle, UserId};
use serde::{Deserialize, Serialize};

/// A beneficiary of commissions.
///
/// `referrer_handle`, when set, names the user who referred this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub handle: Handle,
    pub referrer_handle: Option<Handle>,
    #[serde(default)]
    pub withdrawals_suspended: bool,
}

impl User {
    pub fn new(id: impl Into<String>, handle: impl Into<String>, referrer: Option<&str>) -> Self {
        Self {
            id: UserId::new(id),
            handle: Handle::new(handle),
            referrer_handle: referrer.map(Handle::new),
            withdrawals_suspended: false,
        }
    }
}

/// Bank account a user withdraws to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankAccount {
    pub account_number: String,
    pub bank_code: String,
    pub bank_name: String,
    pub account_name: String,
    pub verified: bool,
}

/// BNB Smart Chain wallet a user withdraws to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoWallet {
    pub address: String,
    pub verified: bool,
}

/// Returns true for a `0x`-prefixed, 20-byte hex address.
pub fn is_valid_evm_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .map(|rest| rest.len() == 40 && rest.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}
