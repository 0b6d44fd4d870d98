mod common;

use afrimobile_ledger::domain::{Rail, RecipientDetails, SettlementMode, WithdrawalState};
use afrimobile_ledger::orchestration::{
    RefreshOutcome, WithdrawalError, WithdrawalRequest, WithdrawalSettings,
};
use afrimobile_ledger::settlement::{MockAdapter, PollOutcome, SettlementError, SubmitOutcome};
use afrimobile_ledger::Decimal;
use common::{dec, settings, setup, setup_with, WALLET};
use std::time::Duration;

fn bank_request(amount: &str) -> WithdrawalRequest {
    WithdrawalRequest {
        rail: Rail::Bank,
        amount: dec(amount),
        recipient: None,
    }
}

fn crypto_request(amount: &str) -> WithdrawalRequest {
    WithdrawalRequest {
        rail: Rail::Crypto,
        amount: dec(amount),
        recipient: None,
    }
}

#[tokio::test]
async fn test_insufficient_balance() {
    let h = setup().await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "25000").await;

    let err = h
        .withdrawals
        .request(&u, bank_request("30000"))
        .await
        .unwrap_err();
    match err {
        WithdrawalError::InsufficientBalance {
            available,
            requested,
        } => {
            assert_eq!(available, dec("25000"));
            assert_eq!(requested, dec("30000"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.pending_withdrawals, Decimal::zero());
    assert!(h.withdrawals.history(&u, None).await.unwrap().is_empty());
    assert_eq!(h.bank.submit_calls(), 0);
}

#[tokio::test]
async fn test_bank_sync_success() {
    let bank = MockAdapter::new(Rail::Bank).with_submit(SubmitOutcome::AcceptedSyncSuccess {
        external_ref: "TRX-1".to_string(),
    });
    let h = setup_with(settings(), bank, MockAdapter::new(Rail::Crypto)).await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "25000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();

    assert_eq!(w.state, WithdrawalState::Paid);
    assert_eq!(w.external_ref.as_deref(), Some("TRX-1"));
    assert!(w.client_ref.starts_with("WD-u1-"));
    assert!(w.submitted_at.is_some());
    assert!(w.paid_at.is_some());

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.total_withdrawn, dec("20000"));
    assert_eq!(sheet.pending_withdrawals, Decimal::zero());
    assert_eq!(sheet.available(), dec("5000"));

    let debits = h.repo.list_debits(&u).await.unwrap();
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].external_ref, "TRX-1");
    assert_eq!(debits[0].withdrawal_id, w.id);
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_crypto_async_settles_on_poll() {
    let crypto = MockAdapter::new(Rail::Crypto)
        .with_submit(SubmitOutcome::AcceptedAsync {
            external_ref: Some("0xabc".to_string()),
        })
        .with_poll(PollOutcome::Pending)
        .with_poll(PollOutcome::Success {
            external_ref: "0xabc".to_string(),
            meta: serde_json::json!({ "blockNumber": 42 }),
        });
    let h = setup_with(settings(), MockAdapter::new(Rail::Bank), crypto).await;
    let u = h.user("u1", None).await;
    h.wallet(&u, true).await;
    h.fund(&u, "10000").await;
    h.usdt_rate("1650").await;

    let w = h.withdrawals.request(&u, crypto_request("10000")).await.unwrap();
    assert_eq!(w.state, WithdrawalState::Processing);
    assert_eq!(w.external_ref.as_deref(), Some("0xabc"));
    assert!(w.client_ref.starts_with("CWD-"));
    let quote = w.quote.unwrap();
    assert_eq!(quote.ngn_per_usdt, dec("1650"));
    assert_eq!(quote.amount_usdt, dec("6.060606"));
    assert_eq!(
        w.payload,
        RecipientDetails::Crypto {
            wallet_address: WALLET.to_string()
        }
    );

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.processing_withdrawals, dec("10000"));
    assert_eq!(sheet.pending_withdrawals, Decimal::zero());

    let outcome = h.withdrawals.refresh(w.clone()).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Unchanged);

    let w = h.withdrawals.get(&w.id).await.unwrap();
    let outcome = h.withdrawals.refresh(w.clone()).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Transitioned(WithdrawalState::Paid));

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.total_withdrawn, dec("10000"));
    assert_eq!(sheet.processing_withdrawals, Decimal::zero());
    assert_eq!(sheet.available(), Decimal::zero());
    assert_eq!(h.crypto.poll_calls(), 2);
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_declined_releases_reservation() {
    let bank = MockAdapter::new(Rail::Bank).with_submit(SubmitOutcome::RejectedSync {
        reason: "account closed".to_string(),
    });
    let h = setup_with(settings(), bank, MockAdapter::new(Rail::Crypto)).await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "25000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    assert_eq!(w.state, WithdrawalState::Failed);
    assert_eq!(w.reason_on_failure.as_deref(), Some("account closed"));
    assert!(w.failed_at.is_some());

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.available(), dec("25000"));
    assert_eq!(sheet.total_withdrawn, Decimal::zero());
    assert!(h.repo.list_debits(&u).await.unwrap().is_empty());

    // A failed withdrawal does not block the next one.
    let next = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    assert_eq!(next.state, WithdrawalState::Processing);
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_async_failure_releases_processing() {
    let bank = MockAdapter::new(Rail::Bank).with_poll(PollOutcome::Failed {
        reason: "insufficient provider float".to_string(),
    });
    let h = setup_with(settings(), bank, MockAdapter::new(Rail::Crypto)).await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "20000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    assert_eq!(w.state, WithdrawalState::Processing);

    let outcome = h.withdrawals.refresh(w.clone()).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Transitioned(WithdrawalState::Failed));

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.processing_withdrawals, Decimal::zero());
    assert_eq!(sheet.available(), dec("20000"));

    // Terminal states ignore further polling.
    let w = h.withdrawals.get(&w.id).await.unwrap();
    assert_eq!(
        h.withdrawals.refresh(w).await.unwrap(),
        RefreshOutcome::Unchanged
    );
    h.assert_consistent(&u).await;
}

fn slow_settings() -> WithdrawalSettings {
    WithdrawalSettings {
        call_timeout: Duration::from_millis(50),
        ..WithdrawalSettings::default()
    }
}

#[tokio::test]
async fn test_bank_timeout_then_poll_success() {
    let bank = MockAdapter::new(Rail::Bank)
        .with_submit_delay(Duration::from_millis(200))
        .with_poll(PollOutcome::Success {
            external_ref: "TRX-9".to_string(),
            meta: serde_json::Value::Null,
        });
    let h = setup_with(slow_settings(), bank, MockAdapter::new(Rail::Crypto)).await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "25000").await;

    let err = h
        .withdrawals
        .request(&u, bank_request("20000"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WithdrawalError::Settlement {
            source: SettlementError::Timeout,
            ..
        }
    ));

    let w = h.withdrawals.history(&u, None).await.unwrap().remove(0);
    assert_eq!(w.state, WithdrawalState::Pending);
    assert!(w.submitted_at.is_some());
    assert_eq!(
        h.ledger.balance(&u).await.unwrap().pending_withdrawals,
        dec("20000")
    );

    let outcome = h.withdrawals.refresh(w.clone()).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Transitioned(WithdrawalState::Paid));

    let w = h.withdrawals.get(&w.id).await.unwrap();
    assert_eq!(w.external_ref.as_deref(), Some("TRX-9"));
    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.total_withdrawn, dec("20000"));
    assert_eq!(sheet.pending_withdrawals, Decimal::zero());
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_bank_timeout_then_poll_failure() {
    let bank = MockAdapter::new(Rail::Bank)
        .with_submit_delay(Duration::from_millis(200))
        .with_poll(PollOutcome::Failed {
            reason: "name mismatch".to_string(),
        });
    let h = setup_with(slow_settings(), bank, MockAdapter::new(Rail::Crypto)).await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "25000").await;

    assert!(h.withdrawals.request(&u, bank_request("20000")).await.is_err());
    let w = h.withdrawals.history(&u, None).await.unwrap().remove(0);

    let outcome = h.withdrawals.refresh(w.clone()).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Transitioned(WithdrawalState::Failed));

    let w = h.withdrawals.get(&w.id).await.unwrap();
    assert_eq!(w.reason_on_failure.as_deref(), Some("name mismatch"));
    assert_eq!(h.ledger.balance(&u).await.unwrap().available(), dec("25000"));
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_crypto_timeout_needs_review() {
    let crypto = MockAdapter::new(Rail::Crypto).with_submit_delay(Duration::from_millis(200));
    let h = setup_with(slow_settings(), MockAdapter::new(Rail::Bank), crypto).await;
    let u = h.user("u1", None).await;
    h.wallet(&u, true).await;
    h.fund(&u, "5000").await;
    h.usdt_rate("1500").await;

    assert!(h.withdrawals.request(&u, crypto_request("3000")).await.is_err());
    let w = h.withdrawals.history(&u, None).await.unwrap().remove(0);
    assert_eq!(w.state, WithdrawalState::Pending);
    assert!(w.submitted_at.is_some());
    assert!(w.external_ref.is_none());

    // The broadcast may have gone out; never sign a second transaction.
    let outcome = h.withdrawals.refresh(w).await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::NeedsReview(_)));
    assert_eq!(h.crypto.submit_calls(), 1);
    assert_eq!(
        h.ledger.balance(&u).await.unwrap().pending_withdrawals,
        dec("3000")
    );
}

#[tokio::test]
async fn test_crypto_broadcast_unknown_keeps_hash() {
    let crypto = MockAdapter::new(Rail::Crypto)
        .with_submit_error(SettlementError::BroadcastUnknown {
            tx_hash: Some("0xfeed".to_string()),
            message: "connection reset".to_string(),
        })
        .with_poll(PollOutcome::Success {
            external_ref: "0xfeed".to_string(),
            meta: serde_json::Value::Null,
        });
    let h = setup_with(settings(), MockAdapter::new(Rail::Bank), crypto).await;
    let u = h.user("u1", None).await;
    h.wallet(&u, true).await;
    h.fund(&u, "5000").await;
    h.usdt_rate("1500").await;

    assert!(h.withdrawals.request(&u, crypto_request("3000")).await.is_err());
    let w = h.withdrawals.history(&u, None).await.unwrap().remove(0);
    assert_eq!(w.external_ref.as_deref(), Some("0xfeed"));

    let outcome = h.withdrawals.refresh(w).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Transitioned(WithdrawalState::Paid));
    assert_eq!(h.crypto.submit_calls(), 1);
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_crypto_locked_keystore_can_retry() {
    let crypto = MockAdapter::new(Rail::Crypto).with_submit_error(SettlementError::KeystoreLocked);
    let h = setup_with(settings(), MockAdapter::new(Rail::Bank), crypto).await;
    let u = h.user("u1", None).await;
    h.wallet(&u, true).await;
    h.fund(&u, "5000").await;
    h.usdt_rate("1500").await;

    let err = h
        .withdrawals
        .request(&u, crypto_request("3000"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WithdrawalError::Settlement {
            source: SettlementError::KeystoreLocked,
            ..
        }
    ));
    let w = h.withdrawals.history(&u, None).await.unwrap().remove(0);
    assert!(w.submitted_at.is_none());

    let outcome = h.withdrawals.refresh(w).await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Resubmitted(WithdrawalState::Processing)
    );
    assert_eq!(h.crypto.submit_calls(), 2);
}

#[tokio::test]
async fn test_one_active_withdrawal_per_user() {
    let h = setup().await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.wallet(&u, true).await;
    h.usdt_rate("1500").await;
    h.fund(&u, "100000").await;

    let first = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    assert_eq!(first.state, WithdrawalState::Processing);

    let err = h
        .withdrawals
        .request(&u, crypto_request("5000"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WithdrawalError::ActiveWithdrawalExists {
            state: WithdrawalState::Processing
        }
    ));
    assert_eq!(
        h.ledger.balance(&u).await.unwrap().available(),
        dec("80000")
    );
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_request_validation() {
    let h = setup().await;
    let u = h.user("u1", None).await;
    h.fund(&u, "50000").await;

    let err = h
        .withdrawals
        .request(&u, bank_request("19999.99"))
        .await
        .unwrap_err();
    assert!(matches!(err, WithdrawalError::BelowMinimum { rail: Rail::Bank, .. }));

    let err = h
        .withdrawals
        .request(&u, bank_request("20000"))
        .await
        .unwrap_err();
    assert!(matches!(err, WithdrawalError::RecipientNotConfigured(Rail::Bank)));

    h.bank_account(&u, false).await;
    let err = h
        .withdrawals
        .request(&u, bank_request("20000"))
        .await
        .unwrap_err();
    assert!(matches!(err, WithdrawalError::RecipientNotVerified(Rail::Bank)));

    h.wallet(&u, true).await;
    let err = h
        .withdrawals
        .request(&u, crypto_request("5000"))
        .await
        .unwrap_err();
    assert!(matches!(err, WithdrawalError::RateUnavailable));

    let bad_wallet = WithdrawalRequest {
        rail: Rail::Crypto,
        amount: dec("5000"),
        recipient: Some(RecipientDetails::Crypto {
            wallet_address: "0x1234".to_string(),
        }),
    };
    let err = h.withdrawals.request(&u, bad_wallet).await.unwrap_err();
    assert!(matches!(err, WithdrawalError::InvalidRecipient(_)));

    let err = h
        .withdrawals
        .request(&afrimobile_ledger::UserId::new("ghost"), bank_request("20000"))
        .await
        .unwrap_err();
    assert!(matches!(err, WithdrawalError::UserNotFound(_)));

    assert!(h.withdrawals.history(&u, None).await.unwrap().is_empty());
    assert_eq!(h.ledger.balance(&u).await.unwrap().available(), dec("50000"));
}

#[tokio::test]
async fn test_request_with_override_recipient() {
    let h = setup().await;
    let u = h.user("u1", None).await;
    h.fund(&u, "25000").await;

    let req = WithdrawalRequest {
        rail: Rail::Bank,
        amount: dec("20000"),
        recipient: Some(RecipientDetails::Bank {
            account_number: "9876543210".to_string(),
            bank_code: "044".to_string(),
            bank_name: "Access Bank".to_string(),
            account_name: "Ada Obi".to_string(),
        }),
    };
    let w = h.withdrawals.request(&u, req).await.unwrap();
    match &w.payload {
        RecipientDetails::Bank { account_number, .. } => assert_eq!(account_number, "9876543210"),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn test_status_lookups() {
    let h = setup().await;
    let u = h.user("u1", None).await;
    let other = h.user("u2", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "25000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();

    assert_eq!(h.withdrawals.status(&u, &w.id).await.unwrap().id, w.id);
    assert!(matches!(
        h.withdrawals.status(&other, &w.id).await,
        Err(WithdrawalError::NotFound(_))
    ));
    assert_eq!(
        h.withdrawals
            .status_by_client_ref(&w.client_ref)
            .await
            .unwrap()
            .id,
        w.id
    );
    assert!(matches!(
        h.withdrawals.get("missing").await,
        Err(WithdrawalError::NotFound(_))
    ));
    assert_eq!(h.withdrawals.history(&u, Some(0)).await.unwrap().len(), 1);
    assert!(h.withdrawals.history(&other, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_mode_skips_adapter() {
    let manual = WithdrawalSettings {
        bank_mode: SettlementMode::Manual,
        ..settings()
    };
    let h = setup_with(manual, MockAdapter::new(Rail::Bank), MockAdapter::new(Rail::Crypto)).await;
    let u = h.user("u1", None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, "25000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    assert_eq!(w.state, WithdrawalState::Pending);
    assert_eq!(w.mode, SettlementMode::Manual);
    assert_eq!(h.bank.submit_calls(), 0);

    // Manual withdrawals are never polled.
    assert_eq!(
        h.withdrawals.refresh(w).await.unwrap(),
        RefreshOutcome::Unchanged
    );
    assert_eq!(h.bank.poll_calls(), 0);
}
