//! Services that drive the ledger and the settlement adapters.

pub mod admin;
pub mod rates;
pub mod reconcile;
pub mod scheduler;
pub mod withdrawals;

pub use admin::{AdminError, AdminService, WalletSetup};
pub use rates::{CoinGeckoFeed, NgnPrices, PriceFeed, RateError, RateRefresher};
pub use reconcile::{
    ChainRepairReport, ReconcileError, Reconciler, ResyncReport, SweepReport, VerifyReport,
};
pub use scheduler::Shutdown;
pub use withdrawals::{
    RefreshOutcome, WithdrawalError, WithdrawalRequest, WithdrawalService, WithdrawalSettings,
};
