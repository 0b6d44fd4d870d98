//! Fiat-rails payout provider.
//!
//! `POST {base}/transactions` submits a transfer with the client reference as
//! idempotency key; `GET {base}/transaction-by-reference/{ref}` polls it.

use super::{classify_reqwest, PollOutcome, SettlementAdapter, SettlementError, SubmitOutcome};
use crate::config::FiatConfig;
use crate::domain::{Rail, RecipientDetails, Withdrawal};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest<'a> {
    account_id: &'a str,
    account_number: &'a str,
    bank_code: &'a str,
    amount: String,
    narration: String,
    reference: &'a str,
    sender_name: &'a str,
}

/// Provider status, as reported in `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderStatus {
    Successful,
    Failed,
    Pending,
}

fn parse_status(raw: &str) -> Option<ProviderStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "successful" | "success" => Some(ProviderStatus::Successful),
        "failed" | "declined" => Some(ProviderStatus::Failed),
        "pending" | "processing" => Some(ProviderStatus::Pending),
        _ => None,
    }
}

/// A provider reply, wherever it put its fields.
#[derive(Debug, Clone)]
struct ProviderReply {
    status: ProviderStatus,
    raw_status: String,
    transaction_reference: Option<String>,
    reason: Option<String>,
    body: serde_json::Value,
}

impl ProviderReply {
    /// Fields sit either at the top level or under `data`.
    fn from_json(body: serde_json::Value) -> Result<Self, SettlementError> {
        let field = |name: &str| -> Option<String> {
            body.get("data")
                .and_then(|d| d.get(name))
                .or_else(|| body.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let raw_status = field("status")
            .ok_or_else(|| SettlementError::ParseError("Missing status field".to_string()))?;
        let status = parse_status(&raw_status).ok_or_else(|| {
            SettlementError::ParseError(format!("Unknown provider status: {}", raw_status))
        })?;

        Ok(Self {
            status,
            transaction_reference: field("transactionReference"),
            reason: field("reasonForFailure").or_else(|| field("message")),
            raw_status,
            body,
        })
    }

    fn failure_reason(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| format!("provider reported {}", self.raw_status))
    }
}

/// Bank payout adapter.
#[derive(Debug, Clone)]
pub struct BankAdapter {
    client: Client,
    config: FiatConfig,
    retry_budget: Duration,
}

impl BankAdapter {
    pub fn new(config: FiatConfig, request_timeout: Duration, retry_budget: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config,
            retry_budget,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Send a request, retrying 429 and 5xx with exponential backoff.
    ///
    /// Returns `None` on 404. Other 4xx replies are parsed when they carry a
    /// recognisable status, else surfaced as a permanent HTTP error.
    async fn send(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Option<ProviderReply>, SettlementError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = build()
                .bearer_auth(&self.config.bearer_token)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(classify_reqwest(e)))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(backoff::Error::transient(SettlementError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(SettlementError::HttpError {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            let body = response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| backoff::Error::permanent(classify_reqwest(e)))?;

            if !status.is_success() {
                return match ProviderReply::from_json(body) {
                    Ok(reply) if reply.status == ProviderStatus::Failed => Ok(Some(reply)),
                    _ => Err(backoff::Error::permanent(SettlementError::HttpError {
                        status: status.as_u16(),
                        message: "Client error".to_string(),
                    })),
                };
            }

            ProviderReply::from_json(body)
                .map(Some)
                .map_err(backoff::Error::permanent)
        })
        .await
    }
}

#[async_trait]
impl SettlementAdapter for BankAdapter {
    fn rail(&self) -> Rail {
        Rail::Bank
    }

    async fn submit(&self, withdrawal: &Withdrawal) -> Result<SubmitOutcome, SettlementError> {
        let RecipientDetails::Bank {
            account_number,
            bank_code,
            ..
        } = &withdrawal.payload
        else {
            return Err(SettlementError::Unsupported(
                "bank adapter needs bank recipient details".to_string(),
            ));
        };

        let request = TransferRequest {
            account_id: &self.config.account_id,
            account_number,
            bank_code,
            amount: withdrawal.amount.to_canonical_string(),
            narration: format!("Earnings withdrawal {}", withdrawal.client_ref),
            reference: &withdrawal.client_ref,
            sender_name: &self.config.sender_name,
        };
        debug!(client_ref = %withdrawal.client_ref, "Submitting bank transfer");

        let url = self.url("transactions");
        let reply = self
            .send(|| self.client.post(&url).json(&request))
            .await?
            .ok_or_else(|| SettlementError::HttpError {
                status: 404,
                message: "Transfer endpoint not found".to_string(),
            })?;

        Ok(match reply.status {
            ProviderStatus::Successful => SubmitOutcome::AcceptedSyncSuccess {
                external_ref: reply
                    .transaction_reference
                    .clone()
                    .unwrap_or_else(|| withdrawal.client_ref.clone()),
            },
            ProviderStatus::Pending => SubmitOutcome::AcceptedAsync {
                external_ref: reply.transaction_reference.clone(),
            },
            ProviderStatus::Failed => {
                warn!(
                    client_ref = %withdrawal.client_ref,
                    status = %reply.raw_status,
                    "Provider refused transfer"
                );
                SubmitOutcome::RejectedSync {
                    reason: reply.failure_reason(),
                }
            }
        })
    }

    async fn poll(&self, withdrawal: &Withdrawal) -> Result<PollOutcome, SettlementError> {
        let url = self.url(&format!(
            "transaction-by-reference/{}",
            withdrawal.client_ref
        ));
        let Some(reply) = self.send(|| self.client.get(&url)).await? else {
            return Ok(PollOutcome::NotFound);
        };

        Ok(match reply.status {
            ProviderStatus::Successful => PollOutcome::Success {
                external_ref: reply
                    .transaction_reference
                    .clone()
                    .or_else(|| withdrawal.external_ref.clone())
                    .unwrap_or_else(|| withdrawal.client_ref.clone()),
                meta: reply.body,
            },
            ProviderStatus::Pending => PollOutcome::Pending,
            ProviderStatus::Failed => PollOutcome::Failed {
                reason: reply.failure_reason(),
            },
        })
    }
}
