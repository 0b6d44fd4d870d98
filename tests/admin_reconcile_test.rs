mod common;

use afrimobile_ledger::config::CommissionRates;
use afrimobile_ledger::domain::{AdminActionKind, Rail, SettlementMode, WithdrawalState};
use afrimobile_ledger::orchestration::{
    AdminError, Reconciler, WalletSetup, WithdrawalError, WithdrawalRequest, WithdrawalSettings,
};
use afrimobile_ledger::settlement::MockAdapter;
use afrimobile_ledger::{Decimal, SettlementError, UserId};
use common::{dec, settings, setup, setup_with, Harness, WALLET};

fn bank_request(amount: &str) -> WithdrawalRequest {
    WithdrawalRequest {
        rail: Rail::Bank,
        amount: dec(amount),
        recipient: None,
    }
}

async fn manual_harness() -> Harness {
    let manual = WithdrawalSettings {
        bank_mode: SettlementMode::Manual,
        crypto_mode: SettlementMode::Manual,
        ..settings()
    };
    setup_with(manual, MockAdapter::new(Rail::Bank), MockAdapter::new(Rail::Crypto)).await
}

async fn funded_bank_user(h: &Harness, id: &str, amount: &str) -> UserId {
    let u = h.user(id, None).await;
    h.bank_account(&u, true).await;
    h.fund(&u, amount).await;
    u
}

#[tokio::test]
async fn test_manual_approve_then_mark_paid() {
    let h = manual_harness().await;
    let u = funded_bank_user(&h, "u1", "25000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    assert_eq!(w.state, WithdrawalState::Pending);

    let w = h.admin.approve("admin-1", &w.id, "KYC checked").await.unwrap();
    assert_eq!(w.state, WithdrawalState::Approved);
    assert!(w.approved_at.is_some());
    assert_eq!(
        h.ledger.balance(&u).await.unwrap().pending_withdrawals,
        dec("20000")
    );

    let w = h
        .admin
        .mark_paid("admin-1", &w.id, " BANK-REF-1 ", "paid from ops account")
        .await
        .unwrap();
    assert_eq!(w.state, WithdrawalState::Paid);
    assert_eq!(w.external_ref.as_deref(), Some("BANK-REF-1"));

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.total_withdrawn, dec("20000"));
    assert_eq!(sheet.pending_withdrawals, Decimal::zero());
    assert_eq!(sheet.available(), dec("5000"));

    let actions = h.admin.list_actions(&w.id).await.unwrap();
    let kinds: Vec<AdminActionKind> = actions.iter().map(|a| a.action).collect();
    assert_eq!(
        kinds,
        vec![
            AdminActionKind::ApproveWithdrawal,
            AdminActionKind::MarkWithdrawalPaid
        ]
    );
    assert_eq!(actions[1].reason, "paid from ops account");
    assert_eq!(actions[0].actor_id, "admin-1");

    // Paid is terminal.
    let err = h.admin.reject("admin-1", &w.id, "oops").await.unwrap_err();
    assert!(matches!(
        err,
        AdminError::Withdrawal(WithdrawalError::InvalidTransition(_))
    ));
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_manual_reject_releases() {
    let h = manual_harness().await;
    let u = funded_bank_user(&h, "u1", "25000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    let w = h.admin.approve("admin-1", &w.id, "looks fine").await.unwrap();
    let w = h
        .admin
        .reject("admin-2", &w.id, "account flagged")
        .await
        .unwrap();

    assert_eq!(w.state, WithdrawalState::Rejected);
    assert_eq!(w.reason_on_failure.as_deref(), Some("account flagged"));
    assert!(w.rejected_at.is_some());
    assert_eq!(h.ledger.balance(&u).await.unwrap().available(), dec("25000"));
    assert!(h.repo.list_debits(&u).await.unwrap().is_empty());
    h.assert_consistent(&u).await;
}

#[tokio::test]
async fn test_admin_preconditions() {
    let h = manual_harness().await;
    let u = funded_bank_user(&h, "u1", "25000").await;
    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();

    assert!(matches!(
        h.admin.approve("admin-1", &w.id, "   ").await,
        Err(AdminError::MissingReason)
    ));
    // Mark-paid needs an approved withdrawal and a reference.
    assert!(matches!(
        h.admin.mark_paid("admin-1", &w.id, "", "paid").await,
        Err(AdminError::MissingExternalRef)
    ));
    assert!(matches!(
        h.admin.mark_paid("admin-1", &w.id, "REF", "paid").await,
        Err(AdminError::Withdrawal(WithdrawalError::InvalidTransition(_)))
    ));
    assert!(matches!(
        h.admin.approve("admin-1", "missing", "ok").await,
        Err(AdminError::Withdrawal(WithdrawalError::NotFound(_)))
    ));

    assert_eq!(
        h.withdrawals.get(&w.id).await.unwrap().state,
        WithdrawalState::Pending
    );
    assert!(h.admin.list_actions(&w.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_instant_withdrawals_are_not_admin_settled() {
    let h = setup().await;
    let u = funded_bank_user(&h, "u1", "25000").await;

    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();
    assert_eq!(w.state, WithdrawalState::Processing);

    assert!(matches!(
        h.admin.approve("admin-1", &w.id, "ok").await,
        Err(AdminError::NotManual(_))
    ));
    assert!(matches!(
        h.admin.mark_paid("admin-1", &w.id, "REF", "ok").await,
        Err(AdminError::NotManual(_))
    ));
    assert!(matches!(
        h.admin.reject("admin-1", &w.id, "stop").await,
        Err(AdminError::InFlight(_))
    ));
    assert_eq!(
        h.ledger.balance(&u).await.unwrap().processing_withdrawals,
        dec("20000")
    );
}

#[tokio::test]
async fn test_reject_unsent_instant_withdrawal() {
    let crypto = MockAdapter::new(Rail::Crypto).with_submit_error(SettlementError::KeystoreLocked);
    let h = setup_with(settings(), MockAdapter::new(Rail::Bank), crypto).await;
    let u = h.user("u1", None).await;
    h.wallet(&u, true).await;
    h.usdt_rate("1500").await;
    h.fund(&u, "5000").await;

    let req = WithdrawalRequest {
        rail: Rail::Crypto,
        amount: dec("3000"),
        recipient: None,
    };
    assert!(h.withdrawals.request(&u, req).await.is_err());
    let w = h.withdrawals.history(&u, None).await.unwrap().remove(0);
    assert!(w.submitted_at.is_none());

    let w = h
        .admin
        .reject("admin-1", &w.id, "hot wallet offline")
        .await
        .unwrap();
    assert_eq!(w.state, WithdrawalState::Rejected);
    assert_eq!(h.ledger.balance(&u).await.unwrap().available(), dec("5000"));
    h.assert_consistent(&u).await;
}

/// A crypto withdrawal whose broadcast timed out before a hash came back.
async fn stuck_crypto_withdrawal(h: &Harness, u: &UserId) -> String {
    h.wallet(u, true).await;
    h.usdt_rate("1500").await;
    h.fund(u, "5000").await;

    let req = WithdrawalRequest {
        rail: Rail::Crypto,
        amount: dec("3000"),
        recipient: None,
    };
    assert!(h.withdrawals.request(u, req).await.is_err());
    let w = h.withdrawals.history(u, None).await.unwrap().remove(0);
    assert!(w.submitted_at.is_some());

    let reconciler = Reconciler::new(h.withdrawals.clone());
    for _ in 0..2 {
        let report = reconciler.verify_pending(Some(u)).await.unwrap();
        assert_eq!(report.needs_review, vec![w.id.clone()]);
    }
    assert!(matches!(
        h.admin.reject("admin-1", &w.id, "stop").await,
        Err(AdminError::InFlight(_))
    ));
    w.id
}

#[tokio::test]
async fn test_stuck_withdrawal_resolved_as_failed() {
    let crypto = MockAdapter::new(Rail::Crypto).with_submit_error(SettlementError::Timeout);
    let h = setup_with(settings(), MockAdapter::new(Rail::Bank), crypto).await;
    let u = h.user("u1", None).await;
    let id = stuck_crypto_withdrawal(&h, &u).await;

    assert!(matches!(
        h.admin.resolve_failed("admin-1", &id, " ").await,
        Err(AdminError::MissingReason)
    ));
    let w = h
        .admin
        .resolve_failed("admin-1", &id, "nonce unused on chain")
        .await
        .unwrap();
    assert_eq!(w.state, WithdrawalState::Failed);
    assert_eq!(w.reason_on_failure.as_deref(), Some("nonce unused on chain"));

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.pending_withdrawals, Decimal::zero());
    assert_eq!(sheet.available(), dec("5000"));
    h.assert_consistent(&u).await;

    let kinds: Vec<AdminActionKind> = h
        .admin
        .list_actions(&id)
        .await
        .unwrap()
        .iter()
        .map(|a| a.action)
        .collect();
    assert_eq!(kinds, vec![AdminActionKind::ResolveWithdrawalFailed]);

    // The user is no longer blocked by an active withdrawal.
    let req = WithdrawalRequest {
        rail: Rail::Crypto,
        amount: dec("3000"),
        recipient: None,
    };
    let next = h.withdrawals.request(&u, req).await.unwrap();
    assert_eq!(next.state, WithdrawalState::Processing);
}

#[tokio::test]
async fn test_stuck_withdrawal_resolved_as_paid() {
    let crypto = MockAdapter::new(Rail::Crypto).with_submit_error(SettlementError::Timeout);
    let h = setup_with(settings(), MockAdapter::new(Rail::Bank), crypto).await;
    let u = h.user("u1", None).await;
    let id = stuck_crypto_withdrawal(&h, &u).await;

    assert!(matches!(
        h.admin.resolve_paid("admin-1", &id, "  ", "found on chain").await,
        Err(AdminError::MissingExternalRef)
    ));
    let w = h
        .admin
        .resolve_paid("admin-1", &id, " 0xabc ", "found on chain")
        .await
        .unwrap();
    assert_eq!(w.state, WithdrawalState::Paid);
    assert_eq!(w.external_ref.as_deref(), Some("0xabc"));

    let sheet = h.ledger.balance(&u).await.unwrap();
    assert_eq!(sheet.total_withdrawn, dec("3000"));
    assert_eq!(sheet.available(), dec("2000"));
    h.assert_consistent(&u).await;

    // Terminal now; a second resolution is refused.
    assert!(matches!(
        h.admin.resolve_failed("admin-1", &id, "oops").await,
        Err(AdminError::Withdrawal(WithdrawalError::InvalidTransition(_)))
    ));
    let report = Reconciler::new(h.withdrawals.clone())
        .verify_pending(None)
        .await
        .unwrap();
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn test_resolution_is_for_instant_withdrawals() {
    let h = manual_harness().await;
    let u = funded_bank_user(&h, "u1", "25000").await;
    let w = h.withdrawals.request(&u, bank_request("20000")).await.unwrap();

    assert!(matches!(
        h.admin.resolve_failed("admin-1", &w.id, "stuck").await,
        Err(AdminError::Manual(_))
    ));
    assert!(matches!(
        h.admin.resolve_paid("admin-1", &w.id, "REF", "stuck").await,
        Err(AdminError::Manual(_))
    ));
}

#[tokio::test]
async fn test_suspend_blocks_requests() {
    let h = setup().await;
    let u = funded_bank_user(&h, "u1", "25000").await;

    h.admin.suspend("admin-1", &u, "fraud review").await.unwrap();
    assert!(matches!(
        h.withdrawals.request(&u, bank_request("20000")).await,
        Err(WithdrawalError::WithdrawalsSuspended)
    ));

    h.admin.unsuspend("admin-1", &u, "cleared").await.unwrap();
    assert!(h.withdrawals.request(&u, bank_request("20000")).await.is_ok());

    let actions = h.admin.list_actions(u.as_str()).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].action, AdminActionKind::SuspendWithdrawals);
    assert_eq!(actions[1].action, AdminActionKind::UnsuspendWithdrawals);

    assert!(matches!(
        h.admin.suspend("admin-1", &UserId::new("ghost"), "x").await,
        Err(AdminError::UserNotFound(_))
    ));
    assert!(h.admin.list_actions("ghost").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_commission_rates_change_applies_forward() {
    let h = setup().await;
    let a = h.user("a", None).await;
    let b = h.user("b", Some("a")).await;

    h.purchase("before", &b, "10000").await;
    h.admin
        .set_commission_rates(
            "admin-1",
            CommissionRates::new([dec("10"), dec("5"), dec("0")]).unwrap(),
            "promo",
        )
        .await
        .unwrap();
    h.purchase("after", &b, "10000").await;

    let before = h.repo.credits_for_purchase("before").await.unwrap();
    let after = h.repo.credits_for_purchase("after").await.unwrap();
    assert_eq!(before[0].amount, dec("1500"));
    assert_eq!(after[0].amount, dec("1000"));
    assert_eq!(after[0].rate_at_post, dec("10"));
    assert_eq!(
        h.ledger.balance(&a).await.unwrap().total_earnings,
        dec("2500")
    );

    let actions = h.admin.list_actions("commission_rates").await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, AdminActionKind::SetCommissionRates);
}

#[tokio::test]
async fn test_hot_wallet_install_and_clear() {
    let h = setup().await;

    let bad = WalletSetup {
        signer_url: "http://127.0.0.1:1".to_string(),
        address: "0x12".to_string(),
    };
    assert!(matches!(
        h.admin.install_wallet("admin-1", bad, "rotate").await,
        Err(AdminError::InvalidWallet(_))
    ));
    let bad_url = WalletSetup {
        signer_url: "not a url".to_string(),
        address: WALLET.to_string(),
    };
    assert!(matches!(
        h.admin.install_wallet("admin-1", bad_url, "rotate").await,
        Err(AdminError::InvalidWallet(_))
    ));
    assert!(h.keystore.address().is_none());

    let setup = WalletSetup {
        signer_url: "http://127.0.0.1:1".to_string(),
        address: WALLET.to_string(),
    };
    h.admin.install_wallet("admin-1", setup, "rotate").await.unwrap();
    assert_eq!(h.keystore.address().as_deref(), Some(WALLET));

    assert!(h.admin.clear_wallet("admin-1", "end of shift").await.unwrap());
    assert!(h.keystore.address().is_none());
    assert!(!h.admin.clear_wallet("admin-1", "again").await.unwrap());

    let actions = h.admin.list_actions(WALLET).await.unwrap();
    let kinds: Vec<AdminActionKind> = actions.iter().map(|a| a.action).collect();
    assert_eq!(
        kinds,
        vec![AdminActionKind::InstallHotWallet, AdminActionKind::ClearHotWallet]
    );
}

#[tokio::test]
async fn test_sweep_removes_duplicate_credits() {
    let h = setup().await;
    let a = h.user("a", None).await;
    let b = h.user("b", Some("a")).await;
    h.purchase("p1", &b, "10000").await;

    // Simulate rows written before the unique index existed.
    let pool = h.repo.pool();
    sqlx::query("DROP INDEX uq_credit_beneficiary_purchase_generation")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        INSERT INTO commission_credits (
            id, beneficiary_id, descendant_id, generation, purchase_id, kind,
            amount, currency, rate_at_post, created_at
        ) VALUES ('dup-1', 'a', 'b', 1, 'p1', 'regular', '1500', 'NGN', '15', ?)
        "#,
    )
    .bind(i64::MAX)
    .execute(pool)
    .await
    .unwrap();
    h.ledger.rebuild(&a).await.unwrap();
    assert_eq!(
        h.ledger.balance(&a).await.unwrap().total_earnings,
        dec("3000")
    );

    let reconciler = Reconciler::new(h.withdrawals.clone());
    let report = reconciler.sweep_duplicate_credits().await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.credits_removed, 1);
    assert_eq!(report.amount_removed, dec("1500"));

    let sheet = h.ledger.balance(&a).await.unwrap();
    assert_eq!(sheet.total_earnings, dec("1500"));
    assert_eq!(sheet.generations[0].count, 1);
    let credits = h.repo.list_credits(&a).await.unwrap();
    assert_eq!(credits.len(), 1);
    assert_ne!(credits[0].id, "dup-1");
    h.assert_consistent(&a).await;

    // The constraint is back.
    let again = sqlx::query(
        r#"
        INSERT INTO commission_credits (
            id, beneficiary_id, descendant_id, generation, purchase_id, kind,
            amount, currency, rate_at_post, created_at
        ) VALUES ('dup-2', 'a', 'b', 1, 'p1', 'regular', '1500', 'NGN', '15', 0)
        "#,
    )
    .execute(pool)
    .await;
    assert!(again.is_err());

    let report = reconciler.sweep_duplicate_credits().await.unwrap();
    assert_eq!(report.groups, 0);
}

#[tokio::test]
async fn test_reopened_database_with_duplicates_is_swept() {
    let h = setup().await;
    let a = h.user("a", None).await;
    let b = h.user("b", Some("a")).await;
    h.purchase("p1", &b, "10000").await;

    let pool = h.repo.pool();
    sqlx::query("DROP INDEX uq_credit_beneficiary_purchase_generation")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        INSERT INTO commission_credits (
            id, beneficiary_id, descendant_id, generation, purchase_id, kind,
            amount, currency, rate_at_post, created_at
        ) VALUES ('dup-1', 'a', 'b', 1, 'p1', 'regular', '1500', 'NGN', '15', ?)
        "#,
    )
    .bind(i64::MAX)
    .execute(pool)
    .await
    .unwrap();
    h.ledger.rebuild(&a).await.unwrap();

    // Opening the same file again must not fail on the duplicates.
    let reopened = h.reopen().await;
    assert!(!reopened.repo.credit_uniqueness_enforced().await.unwrap());

    let reconciler = Reconciler::new(reopened.withdrawals.clone());
    let report = reconciler.sweep_duplicate_credits().await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.amount_removed, dec("1500"));
    assert!(reopened.repo.credit_uniqueness_enforced().await.unwrap());
    assert_eq!(
        reopened.ledger.balance(&a).await.unwrap().total_earnings,
        dec("1500")
    );
    reopened.assert_consistent(&a).await;

    // Replaying the purchase is a no-op again.
    let outcome = reopened.ledger.apply_purchase("p1").await.unwrap();
    assert!(outcome.inserted.is_empty());
}

#[tokio::test]
async fn test_resync_corrects_drift() {
    let h = setup().await;
    let a = h.user("a", None).await;
    let b = h.user("b", Some("a")).await;
    h.purchase("p1", &b, "10000").await;

    sqlx::query("UPDATE balance_sheets SET total_earnings = '999', gen1_count = 7 WHERE user_id = 'a'")
        .execute(h.repo.pool())
        .await
        .unwrap();
    assert!(!h.ledger.audit(&a).await.unwrap().is_healthy());

    let reconciler = Reconciler::new(h.withdrawals.clone());
    let unhealthy = reconciler.audit_all().await.unwrap();
    assert_eq!(unhealthy.len(), 1);
    assert_eq!(unhealthy[0].user_id, a);

    let report = reconciler.resync(None).await.unwrap();
    assert_eq!(report.corrected, vec![a.clone()]);
    assert!(report.users >= 1);

    let sheet = h.ledger.balance(&a).await.unwrap();
    assert_eq!(sheet.total_earnings, dec("1500"));
    assert_eq!(sheet.generations[0].count, 1);
    assert!(reconciler.audit_all().await.unwrap().is_empty());

    // A second pass finds nothing to correct.
    let report = reconciler.resync(Some(&a)).await.unwrap();
    assert!(report.corrected.is_empty());
}

#[tokio::test]
async fn test_repair_broken_chains() {
    let h = setup().await;
    let orphan = h.user("orphan", Some("ghost")).await;
    let fine = h.user("fine", Some("orphan")).await;

    let reconciler = Reconciler::new(h.withdrawals.clone());
    let report = reconciler.repair_broken_chains().await.unwrap();
    assert_eq!(report.repaired, vec![orphan.clone()]);

    let user = h.repo.get_user(&orphan).await.unwrap().unwrap();
    assert!(user.referrer_handle.is_none());
    let user = h.repo.get_user(&fine).await.unwrap().unwrap();
    assert_eq!(user.referrer_handle.map(|r| r.0), Some("orphan".to_string()));

    assert!(reconciler
        .repair_broken_chains()
        .await
        .unwrap()
        .repaired
        .is_empty());
}
