//! Settlement adapters: the uniform `submit` / `poll` contract and the two
//! drivers behind it (fiat rails and BSC token transfers).

use crate::domain::{Rail, Withdrawal};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub mod abi;
pub mod bank;
pub mod crypto;
pub mod keystore;
pub mod mock;
pub mod rpc;

pub use bank::BankAdapter;
pub use crypto::CryptoAdapter;
pub use keystore::{HotWalletKeystore, KeyProvider, RemoteSigner, SignedTx, TxRequest};
pub use mock::MockAdapter;
pub use rpc::RpcClient;

/// Immediate answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Funds left synchronously.
    AcceptedSyncSuccess { external_ref: String },
    /// The provider took the request; completion arrives via `poll`.
    AcceptedAsync { external_ref: Option<String> },
    /// Explicit terminal refusal.
    RejectedSync { reason: String },
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Success {
        external_ref: String,
        meta: serde_json::Value,
    },
    Pending,
    Failed {
        reason: String,
    },
    /// The provider has no record of the withdrawal.
    NotFound,
}

/// Driver for one settlement rail.
///
/// Implementations must not retry a terminal answer into a different one, and
/// must report anything they cannot classify as an error rather than a
/// terminal outcome.
#[async_trait]
pub trait SettlementAdapter: Send + Sync + fmt::Debug {
    fn rail(&self) -> Rail;

    async fn submit(&self, withdrawal: &Withdrawal) -> Result<SubmitOutcome, SettlementError>;

    /// Query by external reference when known, else by client reference.
    async fn poll(&self, withdrawal: &Withdrawal) -> Result<PollOutcome, SettlementError>;
}

/// Error type for settlement operations.
#[derive(Debug, Clone)]
pub enum SettlementError {
    /// Connection failure, DNS failure, reset.
    NetworkError(String),
    /// Non-success HTTP status not otherwise classified.
    HttpError { status: u16, message: String },
    /// 429 from the provider after the retry budget ran out.
    RateLimited,
    /// The whole call missed its deadline.
    Timeout,
    /// Response could not be understood.
    ParseError(String),
    /// JSON-RPC error object returned by the node or signer.
    RpcError { code: i64, message: String },
    /// The transaction left the process but its fate is unknown.
    BroadcastUnknown { tx_hash: Option<String>, message: String },
    /// No hot-wallet key provider is installed.
    KeystoreLocked,
    /// The withdrawal cannot be handled by this adapter.
    Unsupported(String),
}

impl SettlementError {
    /// Transient errors leave the withdrawal untouched and may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            SettlementError::NetworkError(_)
            | SettlementError::RateLimited
            | SettlementError::Timeout
            | SettlementError::BroadcastUnknown { .. } => true,
            SettlementError::HttpError { status, .. } => *status >= 500,
            SettlementError::ParseError(_)
            | SettlementError::RpcError { .. }
            | SettlementError::KeystoreLocked
            | SettlementError::Unsupported(_) => false,
        }
    }

    /// True when the call certainly failed before anything reached the
    /// settlement network. A missed deadline may have cut a broadcast short.
    pub fn is_pre_broadcast(&self) -> bool {
        !matches!(
            self,
            SettlementError::BroadcastUnknown { .. } | SettlementError::Timeout
        )
    }
}

impl fmt::Display for SettlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            SettlementError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            SettlementError::RateLimited => write!(f, "Rate limited"),
            SettlementError::Timeout => write!(f, "Deadline exceeded"),
            SettlementError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            SettlementError::RpcError { code, message } => {
                write!(f, "RPC error {}: {}", code, message)
            }
            SettlementError::BroadcastUnknown { tx_hash, message } => match tx_hash {
                Some(hash) => write!(f, "Broadcast of {} unconfirmed: {}", hash, message),
                None => write!(f, "Broadcast unconfirmed: {}", message),
            },
            SettlementError::KeystoreLocked => write!(f, "Hot wallet is not configured"),
            SettlementError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for SettlementError {}

/// Adapters keyed by rail.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Rail, Arc<dyn SettlementAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn SettlementAdapter>) -> Self {
        self.adapters.insert(adapter.rail(), adapter);
        self
    }

    pub fn get(&self, rail: Rail) -> Option<Arc<dyn SettlementAdapter>> {
        self.adapters.get(&rail).cloned()
    }
}

/// Classify a reqwest failure. Per-request timeouts count as network errors;
/// [`SettlementError::Timeout`] is reserved for the caller's overall deadline.
pub(crate) fn classify_reqwest(err: reqwest::Error) -> SettlementError {
    if err.is_decode() {
        SettlementError::ParseError(err.to_string())
    } else {
        SettlementError::NetworkError(err.to_string())
    }
}
