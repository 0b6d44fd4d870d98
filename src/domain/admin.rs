//! Audit records for administrator actions.

use crate::domain::TimeMs;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What an administrator did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminActionKind {
    ApproveWithdrawal,
    RejectWithdrawal,
    MarkWithdrawalPaid,
    ResolveWithdrawalPaid,
    ResolveWithdrawalFailed,
    SuspendWithdrawals,
    UnsuspendWithdrawals,
    InstallHotWallet,
    ClearHotWallet,
    SetCommissionRates,
}

impl AdminActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminActionKind::ApproveWithdrawal => "approve_withdrawal",
            AdminActionKind::RejectWithdrawal => "reject_withdrawal",
            AdminActionKind::MarkWithdrawalPaid => "mark_withdrawal_paid",
            AdminActionKind::ResolveWithdrawalPaid => "resolve_withdrawal_paid",
            AdminActionKind::ResolveWithdrawalFailed => "resolve_withdrawal_failed",
            AdminActionKind::SuspendWithdrawals => "suspend_withdrawals",
            AdminActionKind::UnsuspendWithdrawals => "unsuspend_withdrawals",
            AdminActionKind::InstallHotWallet => "install_hot_wallet",
            AdminActionKind::ClearHotWallet => "clear_hot_wallet",
            AdminActionKind::SetCommissionRates => "set_commission_rates",
        }
    }
}

impl std::fmt::Display for AdminActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdminActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve_withdrawal" => Ok(AdminActionKind::ApproveWithdrawal),
            "reject_withdrawal" => Ok(AdminActionKind::RejectWithdrawal),
            "mark_withdrawal_paid" => Ok(AdminActionKind::MarkWithdrawalPaid),
            "resolve_withdrawal_paid" => Ok(AdminActionKind::ResolveWithdrawalPaid),
            "resolve_withdrawal_failed" => Ok(AdminActionKind::ResolveWithdrawalFailed),
            "suspend_withdrawals" => Ok(AdminActionKind::SuspendWithdrawals),
            "unsuspend_withdrawals" => Ok(AdminActionKind::UnsuspendWithdrawals),
            "install_hot_wallet" => Ok(AdminActionKind::InstallHotWallet),
            "clear_hot_wallet" => Ok(AdminActionKind::ClearHotWallet),
            "set_commission_rates" => Ok(AdminActionKind::SetCommissionRates),
            other => Err(format!("unknown admin action: {}", other)),
        }
    }
}

/// One row of the admin audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAction {
    pub actor_id: String,
    pub action: AdminActionKind,
    /// Withdrawal id or user id, depending on the action.
    pub target_id: String,
    pub reason: String,
    pub created_at: TimeMs,
}
