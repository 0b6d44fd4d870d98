//! Withdrawal requests, their lifecycle states, and settlement debits.

use crate::domain::{Decimal, TimeMs, UserId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Settlement path for a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rail {
    Bank,
    Crypto,
}

impl Rail {
    /// Prefix used in client references.
    pub fn reference_prefix(&self) -> &'static str {
        match self {
            Rail::Bank => "WD",
            Rail::Crypto => "CWD",
        }
    }
}

impl std::fmt::Display for Rail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rail::Bank => write!(f, "bank"),
            Rail::Crypto => write!(f, "crypto"),
        }
    }
}

impl FromStr for Rail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bank" => Ok(Rail::Bank),
            "crypto" => Ok(Rail::Crypto),
            other => Err(format!("unknown rail: {}", other)),
        }
    }
}

/// How a rail is settled: by an adapter, or by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementMode {
    Instant,
    Manual,
}

impl std::fmt::Display for SettlementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlementMode::Instant => write!(f, "instant"),
            SettlementMode::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for SettlementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instant" => Ok(SettlementMode::Instant),
            "manual" => Ok(SettlementMode::Manual),
            other => Err(format!("unknown settlement mode: {}", other)),
        }
    }
}

/// Lifecycle state of a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalState {
    Pending,
    Approved,
    Processing,
    Paid,
    Failed,
    Rejected,
}

impl WithdrawalState {
    /// States that hold a reservation and block a new request.
    pub const ACTIVE: [WithdrawalState; 3] = [
        WithdrawalState::Pending,
        WithdrawalState::Approved,
        WithdrawalState::Processing,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalState::Pending => "pending",
            WithdrawalState::Approved => "approved",
            WithdrawalState::Processing => "processing",
            WithdrawalState::Paid => "paid",
            WithdrawalState::Failed => "failed",
            WithdrawalState::Rejected => "rejected",
        }
    }

    /// Which reservation bucket an active state's amount sits in.
    pub fn reservation_bucket(&self) -> Option<ReservationBucket> {
        match self {
            WithdrawalState::Pending | WithdrawalState::Approved => {
                Some(ReservationBucket::Pending)
            }
            WithdrawalState::Processing => Some(ReservationBucket::Processing),
            _ => None,
        }
    }
}

impl std::fmt::Display for WithdrawalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WithdrawalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalState::Pending),
            "approved" => Ok(WithdrawalState::Approved),
            "processing" => Ok(WithdrawalState::Processing),
            "paid" => Ok(WithdrawalState::Paid),
            "failed" => Ok(WithdrawalState::Failed),
            "rejected" => Ok(WithdrawalState::Rejected),
            other => Err(format!("unknown withdrawal state: {}", other)),
        }
    }
}

/// Balance-sheet bucket holding an in-flight reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationBucket {
    Pending,
    Processing,
}

/// Recipient snapshot taken when the withdrawal is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "lowercase")]
pub enum RecipientDetails {
    #[serde(rename_all = "camelCase")]
    Bank {
        account_number: String,
        bank_code: String,
        bank_name: String,
        account_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Crypto { wallet_address: String },
}

impl RecipientDetails {
    pub fn rail(&self) -> Rail {
        match self {
            RecipientDetails::Bank { .. } => Rail::Bank,
            RecipientDetails::Crypto { .. } => Rail::Crypto,
        }
    }
}

/// Exchange-rate snapshot and derived token amount for crypto withdrawals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoQuote {
    pub ngn_per_usdt: Decimal,
    pub amount_usdt: Decimal,
}

impl CryptoQuote {
    /// Quote `amount_ngn` at the given rate, truncated to 6 decimal places.
    ///
    /// Returns `None` when the rate is not positive.
    pub fn at_rate(amount_ngn: Decimal, ngn_per_usdt: Decimal) -> Option<Self> {
        if !ngn_per_usdt.is_positive() {
            return None;
        }
        let amount_usdt = amount_ngn.checked_div(ngn_per_usdt)?.truncate_dp(6);
        Some(Self {
            ngn_per_usdt,
            amount_usdt,
        })
    }
}

/// Build a client reference: `<rail-prefix>-<user-suffix>-<timestamp>`.
pub fn make_client_ref(rail: Rail, user_id: &UserId, at: TimeMs) -> String {
    format!(
        "{}-{}-{}",
        rail.reference_prefix(),
        user_id.reference_suffix(),
        at.as_ms()
    )
}

/// A user-initiated withdrawal request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub id: String,
    pub user_id: UserId,
    /// Always NGN.
    pub amount: Decimal,
    pub rail: Rail,
    pub mode: SettlementMode,
    pub state: WithdrawalState,
    pub client_ref: String,
    pub external_ref: Option<String>,
    pub payload: RecipientDetails,
    pub quote: Option<CryptoQuote>,
    pub reason_on_failure: Option<String>,
    pub created_at: TimeMs,
    pub submitted_at: Option<TimeMs>,
    pub approved_at: Option<TimeMs>,
    pub processing_at: Option<TimeMs>,
    pub paid_at: Option<TimeMs>,
    pub failed_at: Option<TimeMs>,
    pub rejected_at: Option<TimeMs>,
    pub updated_at: TimeMs,
}

/// Immutable debit recorded when a withdrawal is paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalDebit {
    pub id: String,
    pub user_id: UserId,
    pub amount: Decimal,
    pub withdrawal_id: String,
    pub external_ref: String,
    pub created_at: TimeMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ref_shape() {
        let r = make_client_ref(Rail::Bank, &UserId::new("user-00af31"), TimeMs::new(1700000000000));
        assert_eq!(r, "WD-00af31-1700000000000");
        let c = make_client_ref(Rail::Crypto, &UserId::new("x"), TimeMs::new(5));
        assert_eq!(c, "CWD-x-5");
    }

    #[test]
    fn test_quote_at_rate() {
        let q = CryptoQuote::at_rate(Decimal::from_i64(10_000), Decimal::from_i64(1_650)).unwrap();
        assert_eq!(q.amount_usdt.to_canonical_string(), "6.060606");
        assert!(CryptoQuote::at_rate(Decimal::from_i64(1), Decimal::zero()).is_none());
    }

    #[test]
    fn test_state_buckets() {
        assert_eq!(
            WithdrawalState::Approved.reservation_bucket(),
            Some(ReservationBucket::Pending)
        );
        assert_eq!(
            WithdrawalState::Processing.reservation_bucket(),
            Some(ReservationBucket::Processing)
        );
        assert_eq!(WithdrawalState::Paid.reservation_bucket(), None);
        assert!(WithdrawalState::Rejected.is_terminal());
    }

    #[test]
    fn test_recipient_payload_json() {
        let details = RecipientDetails::Crypto {
            wallet_address: "0xabc".to_string(),
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["rail"], "crypto");
        assert_eq!(json["walletAddress"], "0xabc");
        let back: RecipientDetails = serde_json::from_value(json).unwrap();
        assert_eq!(back.rail(), Rail::Crypto);
    }
}
