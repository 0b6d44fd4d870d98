//! Withdrawal requests and the state machine driver.
//!
//! Reserve-and-insert commits before any adapter call. The adapter's answer
//! is applied by a second, short transaction that moves the state and the
//! ledger together, so a crash between the two never charges the user twice.

use crate::config::{Config, WithdrawalLimits};
use crate::db::repo::ledger::lock_balance_sheet;
use crate::db::repo::withdrawals::{
    find_active_for_user, find_withdrawal, insert_withdrawal_with_fresh_ref, update_state,
    StateUpdate,
};
use crate::db::repo::{admin as admin_repo, is_unique_violation_on};
use crate::db::Repository;
use crate::domain::{
    is_valid_evm_address, make_client_ref, AdminAction, CryptoQuote, Decimal, Rail,
    RecipientDetails, SettlementMode, TimeMs, UserId, Withdrawal, WithdrawalState,
};
use crate::engine::{plan, InvalidTransition, LedgerEffect, LifecycleEvent};
use crate::ledger::{self, Ledger, LedgerError};
use crate::settlement::{
    AdapterRegistry, PollOutcome, SettlementAdapter, SettlementError, SubmitOutcome,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default page size for history listings.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error("Amount {amount} is below the {rail} minimum of {minimum}")]
    BelowMinimum {
        rail: Rail,
        amount: Decimal,
        minimum: Decimal,
    },
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },
    #[error("An active withdrawal already exists ({state})")]
    ActiveWithdrawalExists { state: WithdrawalState },
    #[error("No {0} recipient configured")]
    RecipientNotConfigured(Rail),
    #[error("The {0} recipient has not been verified")]
    RecipientNotVerified(Rail),
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("Withdrawals are suspended for this user")]
    WithdrawalsSuspended,
    #[error("User {0} not found")]
    UserNotFound(UserId),
    #[error("Withdrawal {0} not found")]
    NotFound(String),
    #[error("No exchange rate available for crypto withdrawals")]
    RateUnavailable,
    #[error("No settlement adapter for {0}")]
    NoAdapter(Rail),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("Settlement of {withdrawal_id} not confirmed: {source}")]
    Settlement {
        withdrawal_id: String,
        source: SettlementError,
    },
    #[error(transparent)]
    Ledger(LedgerError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<LedgerError> for WithdrawalError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance {
                available,
                requested,
            } => WithdrawalError::InsufficientBalance {
                available,
                requested,
            },
            LedgerError::Db(e) => WithdrawalError::Db(e),
            other => WithdrawalError::Ledger(other),
        }
    }
}

/// A user's request to withdraw.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub rail: Rail,
    pub amount: Decimal,
    /// Replaces the stored recipient for this withdrawal only.
    #[serde(default)]
    pub recipient: Option<RecipientDetails>,
}

/// What a status refresh did to a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Transitioned(WithdrawalState),
    /// Handed (again) to the adapter.
    Resubmitted(WithdrawalState),
    /// Needs a human: the payout's fate cannot be established automatically.
    NeedsReview(String),
}

/// Knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct WithdrawalSettings {
    pub limits: WithdrawalLimits,
    pub bank_mode: SettlementMode,
    pub crypto_mode: SettlementMode,
    pub call_timeout: Duration,
}

impl WithdrawalSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits,
            bank_mode: config.bank_mode,
            crypto_mode: config.crypto_mode,
            call_timeout: config.provider_timeout,
        }
    }

    fn mode_for(&self, rail: Rail) -> SettlementMode {
        match rail {
            Rail::Bank => self.bank_mode,
            Rail::Crypto => self.crypto_mode,
        }
    }
}

impl Default for WithdrawalSettings {
    fn default() -> Self {
        Self {
            limits: WithdrawalLimits::default(),
            bank_mode: SettlementMode::Instant,
            crypto_mode: SettlementMode::Instant,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Inputs to one state change beyond the event itself.
#[derive(Debug, Default)]
pub(crate) struct TransitionInput<'a> {
    pub external_ref: Option<&'a str>,
    pub reason: Option<&'a str>,
    pub audit: Option<&'a AdminAction>,
}

#[derive(Debug, Clone)]
pub struct WithdrawalService {
    repo: Repository,
    ledger: Ledger,
    adapters: AdapterRegistry,
    settings: WithdrawalSettings,
}

impl WithdrawalService {
    pub fn new(ledger: Ledger, adapters: AdapterRegistry, settings: WithdrawalSettings) -> Self {
        Self {
            repo: ledger.repo().clone(),
            ledger,
            adapters,
            settings,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Create a withdrawal, reserve its amount, and (for instant rails) hand
    /// it to the rail's adapter.
    ///
    /// If the adapter cannot be reached the withdrawal stays `pending` and
    /// [`WithdrawalError::Settlement`] is returned; verify-pending picks it
    /// up later.
    pub async fn request(
        &self,
        user_id: &UserId,
        request: WithdrawalRequest,
    ) -> Result<Withdrawal, WithdrawalError> {
        let rail = request.rail;
        let minimum = self.settings.limits.minimum(rail);
        if request.amount < minimum || !request.amount.is_positive() {
            return Err(WithdrawalError::BelowMinimum {
                rail,
                amount: request.amount,
                minimum,
            });
        }

        let user = self
            .repo
            .get_user(user_id)
            .await?
            .ok_or_else(|| WithdrawalError::UserNotFound(user_id.clone()))?;
        if user.withdrawals_suspended {
            return Err(WithdrawalError::WithdrawalsSuspended);
        }

        let payload = self.recipient_for(user_id, rail, request.recipient).await?;
        let quote = match rail {
            Rail::Bank => None,
            Rail::Crypto => {
                let rate = self
                    .repo
                    .active_exchange_rate()
                    .await?
                    .ok_or(WithdrawalError::RateUnavailable)?;
                let quote = CryptoQuote::at_rate(request.amount, rate.ngn_per_usdt)
                    .filter(|q| q.amount_usdt.is_positive())
                    .ok_or(WithdrawalError::RateUnavailable)?;
                Some(quote)
            }
        };

        let now = TimeMs::now();
        let mut withdrawal = Withdrawal {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            amount: request.amount,
            rail,
            mode: self.settings.mode_for(rail),
            state: WithdrawalState::Pending,
            client_ref: make_client_ref(rail, user_id, now),
            external_ref: None,
            payload,
            quote,
            reason_on_failure: None,
            created_at: now,
            submitted_at: None,
            approved_at: None,
            processing_at: None,
            paid_at: None,
            failed_at: None,
            rejected_at: None,
            updated_at: now,
        };

        let mut tx = self.repo.begin().await?;
        lock_balance_sheet(&mut tx, user_id).await?;
        if let Some(active) = find_active_for_user(&mut tx, user_id).await? {
            return Err(WithdrawalError::ActiveWithdrawalExists {
                state: active.state,
            });
        }
        ledger::reserve_in(&mut tx, user_id, withdrawal.amount).await?;
        if let Err(e) = insert_withdrawal_with_fresh_ref(&mut tx, &mut withdrawal).await {
            if is_unique_violation_on(&e, "withdrawals.user_id") {
                return Err(WithdrawalError::ActiveWithdrawalExists {
                    state: WithdrawalState::Pending,
                });
            }
            return Err(e.into());
        }
        tx.commit().await?;

        info!(
            user_id = %user_id,
            withdrawal_id = %withdrawal.id,
            client_ref = %withdrawal.client_ref,
            rail = %rail,
            amount = %withdrawal.amount,
            mode = %withdrawal.mode,
            "Withdrawal reserved"
        );

        match withdrawal.mode {
            SettlementMode::Manual => Ok(withdrawal),
            SettlementMode::Instant => self.submit(withdrawal).await,
        }
    }

    async fn recipient_for(
        &self,
        user_id: &UserId,
        rail: Rail,
        requested: Option<RecipientDetails>,
    ) -> Result<RecipientDetails, WithdrawalError> {
        if let Some(details) = requested {
            validate_recipient(rail, &details)?;
            return Ok(details);
        }

        let details = match rail {
            Rail::Bank => {
                let account = self
                    .repo
                    .get_bank_account(user_id)
                    .await?
                    .ok_or(WithdrawalError::RecipientNotConfigured(rail))?;
                if !account.verified {
                    return Err(WithdrawalError::RecipientNotVerified(rail));
                }
                RecipientDetails::Bank {
                    account_number: account.account_number,
                    bank_code: account.bank_code,
                    bank_name: account.bank_name,
                    account_name: account.account_name,
                }
            }
            Rail::Crypto => {
                let wallet = self
                    .repo
                    .get_crypto_wallet(user_id)
                    .await?
                    .ok_or(WithdrawalError::RecipientNotConfigured(rail))?;
                if !wallet.verified {
                    return Err(WithdrawalError::RecipientNotVerified(rail));
                }
                RecipientDetails::Crypto {
                    wallet_address: wallet.address,
                }
            }
        };
        validate_recipient(rail, &details)?;
        Ok(details)
    }

    fn adapter(&self, rail: Rail) -> Result<Arc<dyn SettlementAdapter>, WithdrawalError> {
        self.adapters
            .get(rail)
            .ok_or(WithdrawalError::NoAdapter(rail))
    }

    /// Hand a pending withdrawal to its adapter and apply the answer.
    ///
    /// Only the caller that claims the submission talks to the adapter. Any
    /// other caller gets the withdrawal back as it currently stands.
    pub async fn submit(&self, withdrawal: Withdrawal) -> Result<Withdrawal, WithdrawalError> {
        let id = withdrawal.id.clone();
        match self.try_submit(withdrawal).await? {
            Some(updated) => Ok(updated),
            None => self.get(&id).await,
        }
    }

    async fn try_submit(
        &self,
        withdrawal: Withdrawal,
    ) -> Result<Option<Withdrawal>, WithdrawalError> {
        let adapter = self.adapter(withdrawal.rail)?;
        let now = TimeMs::now();
        if !self.repo.claim_submission(&withdrawal.id, now).await? {
            debug!(
                withdrawal_id = %withdrawal.id,
                client_ref = %withdrawal.client_ref,
                "Submission already claimed"
            );
            return Ok(None);
        }
        self.send(adapter, withdrawal, now).await.map(Some)
    }

    async fn send(
        &self,
        adapter: Arc<dyn SettlementAdapter>,
        mut withdrawal: Withdrawal,
        now: TimeMs,
    ) -> Result<Withdrawal, WithdrawalError> {
        withdrawal.submitted_at = Some(now);

        debug!(
            withdrawal_id = %withdrawal.id,
            client_ref = %withdrawal.client_ref,
            rail = %withdrawal.rail,
            "Submitting withdrawal"
        );
        let outcome = self.deadline(adapter.submit(&withdrawal)).await;

        match outcome {
            Ok(SubmitOutcome::AcceptedSyncSuccess { external_ref }) => {
                self.apply_event(
                    &withdrawal,
                    LifecycleEvent::Settled,
                    TransitionInput {
                        external_ref: Some(&external_ref),
                        ..Default::default()
                    },
                )
                .await
            }
            Ok(SubmitOutcome::AcceptedAsync { external_ref }) => {
                self.apply_event(
                    &withdrawal,
                    LifecycleEvent::AcceptedAsync,
                    TransitionInput {
                        external_ref: external_ref.as_deref(),
                        ..Default::default()
                    },
                )
                .await
            }
            Ok(SubmitOutcome::RejectedSync { reason }) => {
                self.apply_event(
                    &withdrawal,
                    LifecycleEvent::Failed,
                    TransitionInput {
                        reason: Some(&reason),
                        ..Default::default()
                    },
                )
                .await
            }
            Err(source) => {
                warn!(
                    withdrawal_id = %withdrawal.id,
                    client_ref = %withdrawal.client_ref,
                    rail = %withdrawal.rail,
                    transient = source.is_transient(),
                    error = %source,
                    "Submission not confirmed; withdrawal stays pending"
                );
                if withdrawal.rail == Rail::Crypto {
                    if source.is_pre_broadcast() {
                        self.repo.clear_submitted(&withdrawal.id).await?;
                    } else if let SettlementError::BroadcastUnknown {
                        tx_hash: Some(hash),
                        ..
                    } = &source
                    {
                        self.repo.set_external_ref(&withdrawal.id, hash).await?;
                    }
                }
                Err(WithdrawalError::Settlement {
                    withdrawal_id: withdrawal.id,
                    source,
                })
            }
        }
    }

    /// Poll the adapter for an in-flight instant withdrawal and drive its
    /// state accordingly.
    pub async fn refresh(&self, withdrawal: Withdrawal) -> Result<RefreshOutcome, WithdrawalError> {
        if withdrawal.mode == SettlementMode::Manual
            || !matches!(
                withdrawal.state,
                WithdrawalState::Pending | WithdrawalState::Processing
            )
        {
            return Ok(RefreshOutcome::Unchanged);
        }

        if withdrawal.rail == Rail::Crypto && withdrawal.external_ref.is_none() {
            if withdrawal.submitted_at.is_none() && withdrawal.state == WithdrawalState::Pending {
                info!(
                    withdrawal_id = %withdrawal.id,
                    client_ref = %withdrawal.client_ref,
                    "Submitting crypto withdrawal that never reached the adapter"
                );
                return Ok(match self.try_submit(withdrawal).await? {
                    Some(updated) => RefreshOutcome::Resubmitted(updated.state),
                    None => RefreshOutcome::Unchanged,
                });
            }
            return Ok(self.needs_review(&withdrawal, "broadcast outcome unknown"));
        }

        let adapter = self.adapter(withdrawal.rail)?;
        let polled = self
            .deadline(adapter.poll(&withdrawal))
            .await
            .map_err(|source| {
                warn!(
                    withdrawal_id = %withdrawal.id,
                    client_ref = %withdrawal.client_ref,
                    error = %source,
                    "Poll failed"
                );
                WithdrawalError::Settlement {
                    withdrawal_id: withdrawal.id.clone(),
                    source,
                }
            })?;

        match polled {
            PollOutcome::Success { external_ref, meta } => {
                debug!(withdrawal_id = %withdrawal.id, meta = %meta, "Settlement confirmed");
                let updated = self
                    .apply_event(
                        &withdrawal,
                        LifecycleEvent::Settled,
                        TransitionInput {
                            external_ref: Some(&external_ref),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(RefreshOutcome::Transitioned(updated.state))
            }
            PollOutcome::Failed { reason } => {
                let updated = self
                    .apply_event(
                        &withdrawal,
                        LifecycleEvent::Failed,
                        TransitionInput {
                            reason: Some(&reason),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(RefreshOutcome::Transitioned(updated.state))
            }
            PollOutcome::Pending if withdrawal.state == WithdrawalState::Pending => {
                let updated = self
                    .apply_event(
                        &withdrawal,
                        LifecycleEvent::AcceptedAsync,
                        TransitionInput::default(),
                    )
                    .await?;
                Ok(RefreshOutcome::Transitioned(updated.state))
            }
            PollOutcome::Pending => Ok(RefreshOutcome::Unchanged),
            PollOutcome::NotFound => match withdrawal.rail {
                // The client reference is the provider's idempotency key, so
                // sending it again cannot pay twice.
                Rail::Bank => {
                    info!(
                        withdrawal_id = %withdrawal.id,
                        client_ref = %withdrawal.client_ref,
                        "Provider has no record; resubmitting"
                    );
                    let now = TimeMs::now();
                    if !self.repo.reclaim_submission(&withdrawal.id, now).await? {
                        return Ok(RefreshOutcome::Unchanged);
                    }
                    let updated = self.send(adapter, withdrawal, now).await?;
                    Ok(RefreshOutcome::Resubmitted(updated.state))
                }
                Rail::Crypto => Ok(self.needs_review(&withdrawal, "transaction unknown to node")),
            },
        }
    }

    fn needs_review(&self, withdrawal: &Withdrawal, why: &str) -> RefreshOutcome {
        warn!(
            withdrawal_id = %withdrawal.id,
            client_ref = %withdrawal.client_ref,
            rail = %withdrawal.rail,
            "Withdrawal needs manual review: {}",
            why
        );
        RefreshOutcome::NeedsReview(why.to_string())
    }

    async fn deadline<T>(
        &self,
        call: impl Future<Output = Result<T, SettlementError>>,
    ) -> Result<T, SettlementError> {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::Timeout),
        }
    }

    /// Move a withdrawal through one lifecycle event, committing the state
    /// change, its ledger effect and any audit row together.
    ///
    /// Fails with [`WithdrawalError::InvalidTransition`] if the row is no
    /// longer in the state the caller saw.
    pub(crate) async fn apply_event(
        &self,
        withdrawal: &Withdrawal,
        event: LifecycleEvent,
        input: TransitionInput<'_>,
    ) -> Result<Withdrawal, WithdrawalError> {
        let transition = plan(withdrawal.state, event)?;

        if transition.is_noop() {
            if let (Some(external_ref), None) = (input.external_ref, &withdrawal.external_ref) {
                self.repo.set_external_ref(&withdrawal.id, external_ref).await?;
            }
            return self.get(&withdrawal.id).await;
        }

        let user_id = &withdrawal.user_id;
        let mut tx = self.repo.begin().await?;
        lock_balance_sheet(&mut tx, user_id).await?;

        let moved = update_state(
            &mut tx,
            &withdrawal.id,
            transition.from,
            transition.to,
            StateUpdate {
                external_ref: input.external_ref,
                reason: input.reason,
            },
            TimeMs::now(),
        )
        .await?;
        if !moved {
            let current = find_withdrawal(&mut tx, &withdrawal.id)
                .await?
                .ok_or_else(|| WithdrawalError::NotFound(withdrawal.id.clone()))?;
            debug!(
                withdrawal_id = %withdrawal.id,
                expected = %transition.from,
                found = %current.state,
                "Withdrawal moved concurrently"
            );
            return Err(InvalidTransition {
                from: current.state,
                event,
            }
            .into());
        }

        match transition.effect {
            LedgerEffect::None => {}
            LedgerEffect::Promote => {
                ledger::promote_in(&mut tx, user_id, withdrawal.amount).await?;
            }
            LedgerEffect::Settle(bucket) => {
                let external_ref = input
                    .external_ref
                    .or(withdrawal.external_ref.as_deref())
                    .unwrap_or(&withdrawal.client_ref);
                let debited = ledger::settle_in(
                    &mut tx,
                    user_id,
                    withdrawal.amount,
                    &withdrawal.id,
                    external_ref,
                    bucket,
                )
                .await?;
                if !debited {
                    warn!(withdrawal_id = %withdrawal.id, "Debit already existed for withdrawal");
                }
            }
            LedgerEffect::Release(bucket) => {
                ledger::release_in(&mut tx, user_id, withdrawal.amount, bucket).await?;
            }
        }

        if let Some(action) = input.audit {
            admin_repo::record_admin_action(&mut tx, action).await?;
        }

        let updated = find_withdrawal(&mut tx, &withdrawal.id)
            .await?
            .ok_or_else(|| WithdrawalError::NotFound(withdrawal.id.clone()))?;
        tx.commit().await?;

        info!(
            user_id = %user_id,
            withdrawal_id = %withdrawal.id,
            client_ref = %withdrawal.client_ref,
            rail = %withdrawal.rail,
            from = %transition.from,
            state = %transition.to,
            reason = input.reason.unwrap_or(""),
            "Withdrawal transitioned"
        );
        Ok(updated)
    }

    /// Fetch a withdrawal by id.
    pub async fn get(&self, id: &str) -> Result<Withdrawal, WithdrawalError> {
        self.repo
            .get_withdrawal(id)
            .await?
            .ok_or_else(|| WithdrawalError::NotFound(id.to_string()))
    }

    /// Fetch a withdrawal owned by `user_id`. Other users' rows are reported
    /// as not found.
    pub async fn status(&self, user_id: &UserId, id: &str) -> Result<Withdrawal, WithdrawalError> {
        let withdrawal = self.get(id).await?;
        if &withdrawal.user_id != user_id {
            return Err(WithdrawalError::NotFound(id.to_string()));
        }
        Ok(withdrawal)
    }

    pub async fn status_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Withdrawal, WithdrawalError> {
        self.repo
            .get_withdrawal_by_client_ref(client_ref)
            .await?
            .ok_or_else(|| WithdrawalError::NotFound(client_ref.to_string()))
    }

    /// A user's withdrawals, newest first.
    pub async fn history(
        &self,
        user_id: &UserId,
        limit: Option<i64>,
    ) -> Result<Vec<Withdrawal>, WithdrawalError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
        Ok(self.repo.list_withdrawals(user_id, limit).await?)
    }
}

/// Check that recipient details match the rail and look well-formed.
pub fn validate_recipient(rail: Rail, details: &RecipientDetails) -> Result<(), WithdrawalError> {
    if details.rail() != rail {
        return Err(WithdrawalError::InvalidRecipient(format!(
            "{} details given for a {} withdrawal",
            details.rail(),
            rail
        )));
    }
    match details {
        RecipientDetails::Bank {
            account_number,
            bank_code,
            ..
        } => {
            if account_number.len() != 10 || !account_number.chars().all(|c| c.is_ascii_digit()) {
                return Err(WithdrawalError::InvalidRecipient(
                    "account number must be 10 digits".to_string(),
                ));
            }
            if bank_code.trim().is_empty() {
                return Err(WithdrawalError::InvalidRecipient(
                    "bank code is required".to_string(),
                ));
            }
        }
        RecipientDetails::Crypto { wallet_address } => {
            if !is_valid_evm_address(wallet_address) {
                return Err(WithdrawalError::InvalidRecipient(
                    "wallet address must be a 0x-prefixed 20-byte hex address".to_string(),
                ));
            }
        }
    }
    Ok(())
}
