//! USDT (BEP-20) payouts on BNB Smart Chain.

use super::abi::{balance_of_calldata, parse_quantity, to_quantity, transfer_calldata};
use super::keystore::{HotWalletKeystore, TxRequest};
use super::{PollOutcome, RpcClient, SettlementAdapter, SettlementError, SubmitOutcome};
use crate::config::ChainConfig;
use crate::domain::{is_valid_evm_address, Rail, RecipientDetails, Withdrawal};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    status: Option<String>,
    block_number: Option<String>,
}

/// On-chain token transfer adapter.
///
/// Submissions are serialised through one lock per hot wallet so that nonce
/// lookup, signing and broadcast never interleave.
#[derive(Debug, Clone)]
pub struct CryptoAdapter {
    rpc: RpcClient,
    chain: ChainConfig,
    keystore: HotWalletKeystore,
    submit_lock: Arc<Mutex<()>>,
}

impl CryptoAdapter {
    pub fn new(rpc: RpcClient, chain: ChainConfig, keystore: HotWalletKeystore) -> Self {
        Self {
            rpc,
            chain,
            keystore,
            submit_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn token_balance(&self, owner: &str) -> Result<u128, SettlementError> {
        let call = serde_json::json!({
            "to": self.chain.usdt_contract,
            "data": balance_of_calldata(owner)?,
        });
        let raw: String = self
            .rpc
            .call("eth_call", serde_json::json!([call, "latest"]))
            .await?;
        parse_quantity(&raw)
    }

    async fn quantity(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<u128, SettlementError> {
        let raw: String = self.rpc.call(method, params).await?;
        parse_quantity(&raw)
    }
}

#[async_trait]
impl SettlementAdapter for CryptoAdapter {
    fn rail(&self) -> Rail {
        Rail::Crypto
    }

    async fn submit(&self, withdrawal: &Withdrawal) -> Result<SubmitOutcome, SettlementError> {
        let RecipientDetails::Crypto { wallet_address } = &withdrawal.payload else {
            return Err(SettlementError::Unsupported(
                "crypto adapter needs a wallet address".to_string(),
            ));
        };
        if !is_valid_evm_address(wallet_address) {
            return Err(SettlementError::Unsupported(format!(
                "invalid wallet address {}",
                wallet_address
            )));
        }
        let units = withdrawal
            .quote
            .and_then(|q| q.amount_usdt.to_base_units(self.chain.token_decimals))
            .filter(|u| *u > 0)
            .ok_or_else(|| {
                SettlementError::Unsupported("withdrawal has no usable USDT quote".to_string())
            })?;

        let _guard = self.submit_lock.lock().await;
        let signer = self
            .keystore
            .current()
            .ok_or(SettlementError::KeystoreLocked)?;
        let from = signer.address().to_string();

        let token_balance = self.token_balance(&from).await?;
        if token_balance < units {
            warn!(
                client_ref = %withdrawal.client_ref,
                balance = token_balance,
                needed = units,
                "Hot wallet token balance too low"
            );
            return Ok(SubmitOutcome::RejectedSync {
                reason: "insufficient token balance in hot wallet".to_string(),
            });
        }

        let gas_price = self.quantity("eth_gasPrice", serde_json::json!([])).await?;
        let native = self
            .quantity("eth_getBalance", serde_json::json!([from, "latest"]))
            .await?;
        let gas_cost = gas_price.saturating_mul(self.chain.transfer_gas_limit as u128);
        if native < gas_cost {
            warn!(
                client_ref = %withdrawal.client_ref,
                balance = native,
                needed = gas_cost,
                "Hot wallet gas balance too low"
            );
            return Ok(SubmitOutcome::RejectedSync {
                reason: "insufficient gas in hot wallet".to_string(),
            });
        }

        let nonce = self
            .quantity(
                "eth_getTransactionCount",
                serde_json::json!([from, "pending"]),
            )
            .await?;
        let tx = TxRequest {
            from: from.clone(),
            to: self.chain.usdt_contract.clone(),
            data: transfer_calldata(wallet_address, units)?,
            gas: self.chain.transfer_gas_limit,
            gas_price,
            nonce: u64::try_from(nonce)
                .map_err(|_| SettlementError::ParseError(format!("nonce {} too large", nonce)))?,
            value: 0,
            chain_id: self.chain.chain_id,
        };
        let signed = signer.sign_transaction(&tx).await?;

        let sent: Result<String, SettlementError> = self
            .rpc
            .call("eth_sendRawTransaction", serde_json::json!([signed.raw]))
            .await;
        let tx_hash = match sent {
            Ok(hash) => hash,
            Err(SettlementError::RpcError { message, .. })
                if message.to_ascii_lowercase().contains("already known") =>
            {
                signed.hash.clone().ok_or(SettlementError::BroadcastUnknown {
                    tx_hash: None,
                    message,
                })?
            }
            Err(e) if e.is_transient() => {
                return Err(SettlementError::BroadcastUnknown {
                    tx_hash: signed.hash,
                    message: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        info!(
            client_ref = %withdrawal.client_ref,
            tx_hash = %tx_hash,
            nonce = tx.nonce,
            "USDT transfer broadcast"
        );
        Ok(SubmitOutcome::AcceptedAsync {
            external_ref: Some(tx_hash),
        })
    }

    async fn poll(&self, withdrawal: &Withdrawal) -> Result<PollOutcome, SettlementError> {
        let Some(tx_hash) = withdrawal.external_ref.as_deref() else {
            return Ok(PollOutcome::NotFound);
        };

        let receipt: Option<Receipt> = self
            .rpc
            .call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;
        let Some(receipt) = receipt else {
            let known: Option<serde_json::Value> = self
                .rpc
                .call("eth_getTransactionByHash", serde_json::json!([tx_hash]))
                .await?;
            return Ok(if known.is_some() {
                PollOutcome::Pending
            } else {
                PollOutcome::NotFound
            });
        };

        if receipt.status.as_deref() == Some("0x0") {
            return Ok(PollOutcome::Failed {
                reason: format!("transaction {} reverted", tx_hash),
            });
        }

        let Some(mined_at) = receipt.block_number.as_deref() else {
            return Ok(PollOutcome::Pending);
        };
        let mined_at = parse_quantity(mined_at)?;
        let head = self
            .quantity("eth_blockNumber", serde_json::json!([]))
            .await?;
        let confirmations = head.saturating_sub(mined_at) + 1;
        if confirmations < self.chain.confirmations as u128 {
            return Ok(PollOutcome::Pending);
        }

        Ok(PollOutcome::Success {
            external_ref: tx_hash.to_string(),
            meta: serde_json::json!({
                "blockNumber": to_quantity(mined_at),
                "confirmations": confirmations.to_string(),
                "amountUsdt": withdrawal.quote.map(|q| q.amount_usdt.to_canonical_string()),
            }),
        })
    }
}
