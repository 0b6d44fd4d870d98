pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod orchestration;
pub mod settlement;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    BalanceSheet, CommissionCredit, Decimal, Purchase, Rail, TimeMs, User, UserId, Withdrawal,
    WithdrawalState,
};
pub use error::AppError;
pub use ledger::{Ledger, LedgerError};
pub use settlement::{AdapterRegistry, SettlementAdapter, SettlementError};
