//! Commission credits: immutable ledger entries on the earning side.

use crate::domain::{Currency, Decimal, PurchaseKind, TimeMs, UserId};
use serde::{Deserialize, Serialize};

/// Deepest generation that earns commission.
pub const MAX_GENERATION: u8 = 3;

/// Referral distance from buyer to beneficiary (1..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u8);

impl Generation {
    /// Returns `None` outside 1..=MAX_GENERATION.
    pub fn new(g: u8) -> Option<Self> {
        (1..=MAX_GENERATION).contains(&g).then_some(Generation(g))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Zero-based index into per-generation arrays.
    pub fn index(&self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn all() -> impl Iterator<Item = Generation> {
        (1..=MAX_GENERATION).map(Generation)
    }
}

/// A credit the engine proposes for one ancestor; becomes a
/// [`CommissionCredit`] once the ledger accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditProposal {
    pub beneficiary_id: UserId,
    pub descendant_id: UserId,
    pub generation: Generation,
    pub purchase_id: String,
    pub kind: PurchaseKind,
    pub amount: Decimal,
    pub currency: Currency,
    pub rate_at_post: Decimal,
}

/// "beneficiary earned `amount` because `descendant` completed `purchase` at
/// `generation`". Unique per `(beneficiary, purchase, generation)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionCredit {
    pub id: String,
    pub beneficiary_id: UserId,
    pub descendant_id: UserId,
    pub generation: Generation,
    pub purchase_id: String,
    pub kind: PurchaseKind,
    pub amount: Decimal,
    pub currency: Currency,
    pub rate_at_post: Decimal,
    pub created_at: TimeMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_bounds() {
        assert!(Generation::new(0).is_none());
        assert!(Generation::new(4).is_none());
        assert_eq!(Generation::new(3).map(|g| g.index()), Some(2));
        assert_eq!(Generation::all().count(), 3);
    }
}
