//! Withdrawal lifecycle transition table.
//!
//! Every state change goes through [`plan`], which names the ledger effect
//! that must commit together with the new state.

use crate::domain::{ReservationBucket, WithdrawalState};
use thiserror::Error;

/// Something that happened to a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Provider accepted the request and will settle asynchronously.
    AcceptedAsync,
    /// Provider or chain reports the payout completed.
    Settled,
    /// Provider, chain, or local validation reports a terminal failure.
    Failed,
    AdminApprove,
    AdminReject,
    AdminMarkPaid,
}

/// Ledger side effect of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    None,
    /// Move the reservation from `pending` to `processing`.
    Promote,
    /// Debit the balance and drop the reservation from the bucket.
    Settle(ReservationBucket),
    /// Drop the reservation from the bucket without debiting.
    Release(ReservationBucket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: WithdrawalState,
    pub to: WithdrawalState,
    pub effect: LedgerEffect,
}

impl Transition {
    /// A repeated report that changes nothing (e.g. a second async ack).
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {event:?} to a {from} withdrawal")]
pub struct InvalidTransition {
    pub from: WithdrawalState,
    pub event: LifecycleEvent,
}

/// Resolve `event` against `from`.
pub fn plan(from: WithdrawalState, event: LifecycleEvent) -> Result<Transition, InvalidTransition> {
    use LedgerEffect as E;
    use LifecycleEvent as Ev;
    use ReservationBucket as B;
    use WithdrawalState as S;

    let (to, effect) = match (from, event) {
        (S::Pending, Ev::AcceptedAsync) => (S::Processing, E::Promote),
        (S::Processing, Ev::AcceptedAsync) => (S::Processing, E::None),
        (S::Pending, Ev::Settled) => (S::Paid, E::Settle(B::Pending)),
        (S::Processing, Ev::Settled) => (S::Paid, E::Settle(B::Processing)),
        (S::Pending, Ev::Failed) => (S::Failed, E::Release(B::Pending)),
        (S::Processing, Ev::Failed) => (S::Failed, E::Release(B::Processing)),
        (S::Pending, Ev::AdminApprove) => (S::Approved, E::None),
        (S::Pending | S::Approved, Ev::AdminReject) => (S::Rejected, E::Release(B::Pending)),
        (S::Approved, Ev::AdminMarkPaid) => (S::Paid, E::Settle(B::Pending)),
        _ => return Err(InvalidTransition { from, event }),
    };

    Ok(Transition { from, to, effect })
}

#[cfg(test)]
mod tests {
    use super::*;
    use WithdrawalState as S;

    #[test]
    fn instant_rail_paths() {
        let t = plan(S::Pending, LifecycleEvent::AcceptedAsync).unwrap();
        assert_eq!((t.to, t.effect), (S::Processing, LedgerEffect::Promote));

        let t = plan(S::Processing, LifecycleEvent::Settled).unwrap();
        assert_eq!(
            (t.to, t.effect),
            (S::Paid, LedgerEffect::Settle(ReservationBucket::Processing))
        );

        let t = plan(S::Pending, LifecycleEvent::Settled).unwrap();
        assert_eq!(t.effect, LedgerEffect::Settle(ReservationBucket::Pending));
    }

    #[test]
    fn failures_release_the_right_bucket() {
        let t = plan(S::Pending, LifecycleEvent::Failed).unwrap();
        assert_eq!(t.effect, LedgerEffect::Release(ReservationBucket::Pending));
        let t = plan(S::Processing, LifecycleEvent::Failed).unwrap();
        assert_eq!(t.effect, LedgerEffect::Release(ReservationBucket::Processing));
    }

    #[test]
    fn manual_rail_paths() {
        let t = plan(S::Pending, LifecycleEvent::AdminApprove).unwrap();
        assert_eq!((t.to, t.effect), (S::Approved, LedgerEffect::None));
        let t = plan(S::Approved, LifecycleEvent::AdminMarkPaid).unwrap();
        assert_eq!(t.effect, LedgerEffect::Settle(ReservationBucket::Pending));
        let t = plan(S::Approved, LifecycleEvent::AdminReject).unwrap();
        assert_eq!(t.to, S::Rejected);
    }

    #[test]
    fn repeated_async_ack_is_noop() {
        assert!(plan(S::Processing, LifecycleEvent::AcceptedAsync)
            .unwrap()
            .is_noop());
    }

    #[test]
    fn terminal_states_reject_everything() {
        for from in [S::Paid, S::Failed, S::Rejected] {
            for ev in [
                LifecycleEvent::AcceptedAsync,
                LifecycleEvent::Settled,
                LifecycleEvent::Failed,
                LifecycleEvent::AdminApprove,
                LifecycleEvent::AdminReject,
                LifecycleEvent::AdminMarkPaid,
            ] {
                assert!(plan(from, ev).is_err(), "{:?} from {:?}", ev, from);
            }
        }
    }

    #[test]
    fn processing_cannot_be_rejected_by_admin() {
        assert!(plan(S::Processing, LifecycleEvent::AdminReject).is_err());
        assert!(plan(S::Pending, LifecycleEvent::AdminMarkPaid).is_err());
    }
}
