//! Hot-wallet signing.
//!
//! Keys never enter this process: a [`KeyProvider`] signs on our behalf. The
//! shipped provider talks to a remote signer over `eth_signTransaction`
//! (Clef, Web3Signer). [`HotWalletKeystore`] holds whichever provider an
//! administrator installed, in memory only.

use super::abi::to_quantity;
use super::{RpcClient, SettlementError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Unsigned legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: String,
    pub to: String,
    pub data: String,
    pub gas: u64,
    pub gas_price: u128,
    pub nonce: u64,
    pub value: u128,
    pub chain_id: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcTx<'a> {
    from: &'a str,
    to: &'a str,
    data: &'a str,
    gas: String,
    gas_price: String,
    nonce: String,
    value: String,
    chain_id: String,
}

impl TxRequest {
    /// The JSON-RPC transaction object.
    pub fn to_rpc_json(&self) -> serde_json::Value {
        let tx = RpcTx {
            from: &self.from,
            to: &self.to,
            data: &self.data,
            gas: to_quantity(self.gas as u128),
            gas_price: to_quantity(self.gas_price),
            nonce: to_quantity(self.nonce as u128),
            value: to_quantity(self.value),
            chain_id: to_quantity(self.chain_id as u128),
        };
        serde_json::to_value(tx).unwrap_or(serde_json::Value::Null)
    }
}

/// Raw signed transaction, plus its hash when the signer reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub raw: String,
    pub hash: Option<String>,
}

#[async_trait]
pub trait KeyProvider: Send + Sync + fmt::Debug {
    /// Address of the hot wallet this provider signs for.
    fn address(&self) -> &str;

    async fn sign_transaction(&self, tx: &TxRequest) -> Result<SignedTx, SettlementError>;
}

/// Signer reached over JSON-RPC.
#[derive(Debug, Clone)]
pub struct RemoteSigner {
    rpc: RpcClient,
    address: String,
}

impl RemoteSigner {
    pub fn new(rpc: RpcClient, address: String) -> Self {
        Self { rpc, address }
    }
}

#[async_trait]
impl KeyProvider for RemoteSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign_transaction(&self, tx: &TxRequest) -> Result<SignedTx, SettlementError> {
        let result: serde_json::Value = self
            .rpc
            .call("eth_signTransaction", serde_json::json!([tx.to_rpc_json()]))
            .await?;

        // Clef returns `{raw, tx: {hash, ..}}`; Web3Signer returns the raw hex.
        match result {
            serde_json::Value::String(raw) => Ok(SignedTx { raw, hash: None }),
            serde_json::Value::Object(ref obj) => {
                let raw = obj
                    .get("raw")
                    .and_then(|r| r.as_str())
                    .ok_or_else(|| SettlementError::ParseError("signer reply missing raw".into()))?;
                let hash = obj
                    .get("tx")
                    .and_then(|t| t.get("hash"))
                    .and_then(|h| h.as_str())
                    .map(str::to_string);
                Ok(SignedTx {
                    raw: raw.to_string(),
                    hash,
                })
            }
            other => Err(SettlementError::ParseError(format!(
                "unexpected signer reply: {}",
                other
            ))),
        }
    }
}

/// Process-wide slot for the installed key provider.
#[derive(Debug, Clone, Default)]
pub struct HotWalletKeystore(Arc<RwLock<Option<Arc<dyn KeyProvider>>>>);

impl HotWalletKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, provider: Arc<dyn KeyProvider>) {
        let address = provider.address().to_string();
        *self.write() = Some(provider);
        tracing::info!(address = %address, "Hot wallet installed");
    }

    /// Drop the installed provider. Returns true if one was installed.
    pub fn clear(&self) -> bool {
        let was_set = self.write().take().is_some();
        if was_set {
            tracing::info!("Hot wallet cleared");
        }
        was_set
    }

    pub fn current(&self) -> Option<Arc<dyn KeyProvider>> {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn address(&self) -> Option<String> {
        self.current().map(|p| p.address().to_string())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn KeyProvider>>> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
