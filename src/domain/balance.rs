//! Per-user balance aggregate.

use crate::domain::{Decimal, Generation, ReservationBucket, UserId};
use serde::{Deserialize, Serialize};

/// Count and sum of credits for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationBucket {
    pub count: i64,
    pub earnings: Decimal,
}

/// Denormalised balance of one user, kept in lockstep with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSheet {
    pub user_id: UserId,
    pub total_earnings: Decimal,
    pub total_withdrawn: Decimal,
    pub pending_withdrawals: Decimal,
    pub processing_withdrawals: Decimal,
    pub generations: [GenerationBucket; 3],
}

impl BalanceSheet {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            total_earnings: Decimal::zero(),
            total_withdrawn: Decimal::zero(),
            pending_withdrawals: Decimal::zero(),
            processing_withdrawals: Decimal::zero(),
            generations: [GenerationBucket::default(); 3],
        }
    }

    /// `totalEarnings - totalWithdrawn - pending - processing`.
    pub fn available(&self) -> Decimal {
        self.total_earnings
            - self.total_withdrawn
            - self.pending_withdrawals
            - self.processing_withdrawals
    }

    pub fn generation(&self, g: Generation) -> &GenerationBucket {
        &self.generations[g.index()]
    }

    pub fn reserved(&self, bucket: ReservationBucket) -> Decimal {
        match bucket {
            ReservationBucket::Pending => self.pending_withdrawals,
            ReservationBucket::Processing => self.processing_withdrawals,
        }
    }

    pub(crate) fn reserved_mut(&mut self, bucket: ReservationBucket) -> &mut Decimal {
        match bucket {
            ReservationBucket::Pending => &mut self.pending_withdrawals,
            ReservationBucket::Processing => &mut self.processing_withdrawals,
        }
    }

    /// Field-by-field differences against `other`, for drift logging.
    pub fn diff(&self, other: &BalanceSheet) -> Vec<String> {
        let mut out = Vec::new();
        let mut cmp = |name: &str, a: Decimal, b: Decimal| {
            if a != b {
                out.push(format!("{}: {} -> {}", name, a, b));
            }
        };
        cmp("totalEarnings", self.total_earnings, other.total_earnings);
        cmp("totalWithdrawn", self.total_withdrawn, other.total_withdrawn);
        cmp(
            "pendingWithdrawals",
            self.pending_withdrawals,
            other.pending_withdrawals,
        );
        cmp(
            "processingWithdrawals",
            self.processing_withdrawals,
            other.processing_withdrawals,
        );
        for g in Generation::all() {
            let (a, b) = (self.generation(g), other.generation(g));
            if a.count != b.count {
                out.push(format!("gen{}.count: {} -> {}", g.get(), a.count, b.count));
            }
            if a.earnings != b.earnings {
                out.push(format!(
                    "gen{}.earnings: {} -> {}",
                    g.get(),
                    a.earnings,
                    b.earnings
                ));
            }
        }
        out
    }
}
