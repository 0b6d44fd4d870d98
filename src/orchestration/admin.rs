//! Privileged operations. Every action is written to the audit log in the
//! same transaction as its effect.

use super::withdrawals::{TransitionInput, WithdrawalError, WithdrawalService};
use crate::config::{CommissionRates, ConfigError};
use crate::db::repo::admin::record_admin_action;
use crate::db::repo::users::set_withdrawals_suspended;
use crate::db::Repository;
use crate::domain::{
    is_valid_evm_address, AdminAction, AdminActionKind, SettlementMode, TimeMs, UserId,
    Withdrawal, WithdrawalState,
};
use crate::engine::LifecycleEvent;
use crate::settlement::{HotWalletKeystore, RemoteSigner, RpcClient};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("A reason is required")]
    MissingReason,
    #[error("An external reference is required to mark a withdrawal paid")]
    MissingExternalRef,
    #[error("Withdrawal {0} is settled by its adapter, not by an administrator")]
    NotManual(String),
    #[error("Withdrawal {0} has been handed to its adapter and cannot be rejected")]
    InFlight(String),
    #[error("Withdrawal {0} is settled manually; use reject or mark-paid")]
    Manual(String),
    #[error("User {0} not found")]
    UserNotFound(UserId),
    #[error("Invalid wallet configuration: {0}")]
    InvalidWallet(String),
    #[error(transparent)]
    Rates(#[from] ConfigError),
    #[error(transparent)]
    Withdrawal(#[from] WithdrawalError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Remote signer to install as the hot wallet.
#[derive(Debug, Clone)]
pub struct WalletSetup {
    pub signer_url: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct AdminService {
    repo: Repository,
    withdrawals: WithdrawalService,
    keystore: HotWalletKeystore,
    signer_timeout: Duration,
    signer_retry_budget: Duration,
}

impl AdminService {
    pub fn new(
        withdrawals: WithdrawalService,
        keystore: HotWalletKeystore,
        signer_timeout: Duration,
        signer_retry_budget: Duration,
    ) -> Self {
        Self {
            repo: withdrawals.ledger().repo().clone(),
            withdrawals,
            keystore,
            signer_timeout,
            signer_retry_budget,
        }
    }

    pub fn keystore(&self) -> &HotWalletKeystore {
        &self.keystore
    }

    /// `pending -> approved` for a manual-rail withdrawal.
    pub async fn approve(
        &self,
        actor_id: &str,
        withdrawal_id: &str,
        reason: &str,
    ) -> Result<Withdrawal, AdminError> {
        let withdrawal = self.withdrawals.get(withdrawal_id).await?;
        if withdrawal.mode != SettlementMode::Manual {
            return Err(AdminError::NotManual(withdrawal.id));
        }
        let action = audit(actor_id, AdminActionKind::ApproveWithdrawal, withdrawal_id, reason)?;
        Ok(self
            .withdrawals
            .apply_event(
                &withdrawal,
                LifecycleEvent::AdminApprove,
                TransitionInput {
                    audit: Some(&action),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Reject and release the reservation.
    ///
    /// Instant-rail withdrawals can only be rejected before anything was
    /// handed to the adapter; after that only the adapter's terminal answer
    /// may end them.
    pub async fn reject(
        &self,
        actor_id: &str,
        withdrawal_id: &str,
        reason: &str,
    ) -> Result<Withdrawal, AdminError> {
        let withdrawal = self.withdrawals.get(withdrawal_id).await?;
        if withdrawal.mode == SettlementMode::Instant
            && (withdrawal.state != WithdrawalState::Pending || withdrawal.submitted_at.is_some())
        {
            return Err(AdminError::InFlight(withdrawal.id));
        }
        let action = audit(actor_id, AdminActionKind::RejectWithdrawal, withdrawal_id, reason)?;
        Ok(self
            .withdrawals
            .apply_event(
                &withdrawal,
                LifecycleEvent::AdminReject,
                TransitionInput {
                    reason: Some(reason),
                    audit: Some(&action),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// `approved -> paid`, debiting the user against the payout reference.
    pub async fn mark_paid(
        &self,
        actor_id: &str,
        withdrawal_id: &str,
        external_ref: &str,
        reason: &str,
    ) -> Result<Withdrawal, AdminError> {
        if external_ref.trim().is_empty() {
            return Err(AdminError::MissingExternalRef);
        }
        let withdrawal = self.withdrawals.get(withdrawal_id).await?;
        if withdrawal.mode != SettlementMode::Manual {
            return Err(AdminError::NotManual(withdrawal.id));
        }
        let action = audit(actor_id, AdminActionKind::MarkWithdrawalPaid, withdrawal_id, reason)?;
        Ok(self
            .withdrawals
            .apply_event(
                &withdrawal,
                LifecycleEvent::AdminMarkPaid,
                TransitionInput {
                    external_ref: Some(external_ref.trim()),
                    audit: Some(&action),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Record that an instant withdrawal stuck in flight was paid out, after
    /// the operator found the payout with the provider or on chain.
    /// Settles against `external_ref` from whichever bucket holds it.
    pub async fn resolve_paid(
        &self,
        actor_id: &str,
        withdrawal_id: &str,
        external_ref: &str,
        reason: &str,
    ) -> Result<Withdrawal, AdminError> {
        if external_ref.trim().is_empty() {
            return Err(AdminError::MissingExternalRef);
        }
        let withdrawal = self.in_flight_instant(withdrawal_id).await?;
        let action = audit(actor_id, AdminActionKind::ResolveWithdrawalPaid, withdrawal_id, reason)?;
        let updated = self
            .withdrawals
            .apply_event(
                &withdrawal,
                LifecycleEvent::Settled,
                TransitionInput {
                    external_ref: Some(external_ref.trim()),
                    audit: Some(&action),
                    ..Default::default()
                },
            )
            .await?;
        warn!(actor_id, withdrawal_id, external_ref, "In-flight withdrawal resolved as paid");
        Ok(updated)
    }

    /// Record that an instant withdrawal stuck in flight never paid out and
    /// release its reservation. The operator must have established that no
    /// payout left, since the adapter is not consulted again.
    pub async fn resolve_failed(
        &self,
        actor_id: &str,
        withdrawal_id: &str,
        reason: &str,
    ) -> Result<Withdrawal, AdminError> {
        let withdrawal = self.in_flight_instant(withdrawal_id).await?;
        let action = audit(actor_id, AdminActionKind::ResolveWithdrawalFailed, withdrawal_id, reason)?;
        let updated = self
            .withdrawals
            .apply_event(
                &withdrawal,
                LifecycleEvent::Failed,
                TransitionInput {
                    reason: Some(reason.trim()),
                    audit: Some(&action),
                    ..Default::default()
                },
            )
            .await?;
        warn!(actor_id, withdrawal_id, "In-flight withdrawal resolved as failed");
        Ok(updated)
    }

    async fn in_flight_instant(&self, withdrawal_id: &str) -> Result<Withdrawal, AdminError> {
        let withdrawal = self.withdrawals.get(withdrawal_id).await?;
        if withdrawal.mode == SettlementMode::Manual {
            return Err(AdminError::Manual(withdrawal.id));
        }
        Ok(withdrawal)
    }

    pub async fn suspend(&self, actor_id: &str, user_id: &UserId, reason: &str) -> Result<(), AdminError> {
        self.set_suspended(actor_id, user_id, reason, true).await
    }

    pub async fn unsuspend(&self, actor_id: &str, user_id: &UserId, reason: &str) -> Result<(), AdminError> {
        self.set_suspended(actor_id, user_id, reason, false).await
    }

    async fn set_suspended(
        &self,
        actor_id: &str,
        user_id: &UserId,
        reason: &str,
        suspended: bool,
    ) -> Result<(), AdminError> {
        let kind = if suspended {
            AdminActionKind::SuspendWithdrawals
        } else {
            AdminActionKind::UnsuspendWithdrawals
        };
        let action = audit(actor_id, kind, user_id.as_str(), reason)?;

        let mut tx = self.repo.begin().await?;
        if !set_withdrawals_suspended(&mut tx, user_id, suspended).await? {
            return Err(AdminError::UserNotFound(user_id.clone()));
        }
        record_admin_action(&mut tx, &action).await?;
        tx.commit().await?;

        info!(actor_id, user_id = %user_id, suspended, "Withdrawal suspension changed");
        Ok(())
    }

    /// Install a remote signer as the hot wallet's key provider.
    pub async fn install_wallet(
        &self,
        actor_id: &str,
        setup: WalletSetup,
        reason: &str,
    ) -> Result<(), AdminError> {
        if !is_valid_evm_address(&setup.address) {
            return Err(AdminError::InvalidWallet(format!(
                "invalid address {}",
                setup.address
            )));
        }
        let url = reqwest::Url::parse(&setup.signer_url)
            .map_err(|e| AdminError::InvalidWallet(format!("invalid signer url: {}", e)))?;
        let action = audit(actor_id, AdminActionKind::InstallHotWallet, &setup.address, reason)?;

        let rpc = RpcClient::new(url.to_string(), self.signer_timeout, self.signer_retry_budget);
        let signer = RemoteSigner::new(rpc, setup.address.clone());

        self.record(&action).await?;
        self.keystore.install(Arc::new(signer));
        info!(actor_id, address = %setup.address, "Hot wallet signer installed");
        Ok(())
    }

    /// Remove the hot wallet. Returns false if none was installed.
    pub async fn clear_wallet(&self, actor_id: &str, reason: &str) -> Result<bool, AdminError> {
        let target = self.keystore.address().unwrap_or_default();
        let action = audit(actor_id, AdminActionKind::ClearHotWallet, &target, reason)?;
        let cleared = self.keystore.clear();
        if cleared {
            self.record(&action).await?;
        }
        Ok(cleared)
    }

    /// Replace the commission rates used for credits posted from now on.
    pub async fn set_commission_rates(
        &self,
        actor_id: &str,
        rates: CommissionRates,
        reason: &str,
    ) -> Result<(), AdminError> {
        let action = audit(actor_id, AdminActionKind::SetCommissionRates, "commission_rates", reason)?;
        self.record(&action).await?;
        self.withdrawals.ledger().rates().reload(rates);
        warn!(actor_id, rates = ?rates.as_array(), "Commission rates changed by administrator");
        Ok(())
    }

    /// Audit rows for a withdrawal or user, oldest first.
    pub async fn list_actions(&self, target_id: &str) -> Result<Vec<AdminAction>, AdminError> {
        Ok(self.repo.list_admin_actions(target_id).await?)
    }

    async fn record(&self, action: &AdminAction) -> Result<(), AdminError> {
        let mut conn = self.repo.pool().acquire().await?;
        record_admin_action(&mut conn, action).await?;
        Ok(())
    }
}

fn audit(
    actor_id: &str,
    action: AdminActionKind,
    target_id: &str,
    reason: &str,
) -> Result<AdminAction, AdminError> {
    if reason.trim().is_empty() {
        return Err(AdminError::MissingReason);
    }
    Ok(AdminAction {
        actor_id: actor_id.to_string(),
        action,
        target_id: target_id.to_string(),
        reason: reason.trim().to_string(),
        created_at: TimeMs::now(),
    })
}
