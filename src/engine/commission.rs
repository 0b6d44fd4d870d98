//! Multi-generation referral commission rules.
//!
//! Pure: given a completed purchase and the buyer's resolved upline, derive
//! the credits owed to up to three ancestors. Lookups happen before this runs
//! (see `Ledger::resolve_upline`), so the rules can be tested without storage.

use crate::config::CommissionRates;
use crate::domain::{CreditProposal, Decimal, Generation, Purchase, User};

/// Compute the credit proposals for `purchase`.
///
/// `upline[i]` is the ancestor at generation `i + 1`, as found by following
/// `referrer_handle` links from the buyer. Entries past the third are ignored.
///
/// A generation is skipped, without stopping the walk, when its ancestor is
/// the buyer or the same user as the previous link (self-referral).
pub fn compute_credits(
    purchase: &Purchase,
    upline: &[User],
    rates: &CommissionRates,
) -> Vec<CreditProposal> {
    if !purchase.gross_amount.is_positive() {
        return Vec::new();
    }

    let mut credits = Vec::with_capacity(upline.len().min(3));
    let mut previous_id = &purchase.buyer_id;

    for (ancestor, generation) in upline.iter().zip(Generation::all()) {
        let suppressed = ancestor.id == purchase.buyer_id || &ancestor.id == previous_id;
        previous_id = &ancestor.id;
        if suppressed {
            tracing::debug!(
                purchase_id = %purchase.id,
                beneficiary = %ancestor.id,
                generation = generation.get(),
                "Suppressing self-referral credit"
            );
            continue;
        }

        let rate = rates.rate(generation);
        let Some(amount) = purchase
            .gross_amount
            .checked_mul(rate)
            .and_then(|scaled| scaled.checked_div(Decimal::hundred()))
        else {
            tracing::warn!(
                purchase_id = %purchase.id,
                beneficiary = %ancestor.id,
                generation = generation.get(),
                gross_amount = %purchase.gross_amount,
                "Commission overflows decimal range, skipping credit"
            );
            continue;
        };
        if !amount.is_positive() {
            continue;
        }

        credits.push(CreditProposal {
            beneficiary_id: ancestor.id.clone(),
            descendant_id: purchase.buyer_id.clone(),
            generation,
            purchase_id: purchase.id.clone(),
            kind: purchase.kind,
            amount,
            currency: purchase.currency.clone(),
            rate_at_post: rate,
        });
    }

    credits
}
