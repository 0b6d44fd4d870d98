//! Purchase events, the only source of commission credits.

use crate::domain::{Currency, Decimal, TimeMs, UserId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What was bought. Carried through to credits for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseKind {
    Regular,
    Cofounder,
}

impl std::fmt::Display for PurchaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PurchaseKind::Regular => write!(f, "regular"),
            PurchaseKind::Cofounder => write!(f, "cofounder"),
        }
    }
}

impl FromStr for PurchaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(PurchaseKind::Regular),
            "cofounder" => Ok(PurchaseKind::Cofounder),
            other => Err(format!("unknown purchase kind: {}", other)),
        }
    }
}

/// A purchase as recorded by the share-sale flow.
///
/// `completed_at` is `None` until payment clears; only completed purchases
/// produce commissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: String,
    pub buyer_id: UserId,
    pub kind: PurchaseKind,
    pub gross_amount: Decimal,
    pub currency: Currency,
    pub shares: i64,
    pub completed_at: Option<TimeMs>,
}

impl Purchase {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}
