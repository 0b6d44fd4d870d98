//! Domain types for the earnings and withdrawal core.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: TimeMs, UserId, Handle, Currency
//! - Ledger entities: purchases, commission credits, withdrawals, debits
//! - The per-user balance sheet aggregate
//! - Admin audit records

pub mod admin;
pub mod balance;
pub mod commission;
pub mod decimal;
pub mod exchange_rate;
pub mod primitives;
pub mod purchase;
pub mod user;
pub mod withdrawal;

pub use admin::{AdminAction, AdminActionKind};
pub use balance::{BalanceSheet, GenerationBucket};
pub use commission::{CommissionCredit, CreditProposal, Generation, MAX_GENERATION};
pub use decimal::Decimal;
pub use exchange_rate::ExchangeRate;
pub use primitives::{Currency, Handle, TimeMs, UserId};
pub use purchase::{Purchase, PurchaseKind};
pub use user::{is_valid_evm_address, BankAccount, CryptoWallet, User};
pub use withdrawal::{
    make_client_ref, CryptoQuote, Rail, RecipientDetails, ReservationBucket, SettlementMode,
    Withdrawal, WithdrawalDebit, WithdrawalState,
};
