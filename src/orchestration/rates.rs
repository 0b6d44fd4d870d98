//! NGN exchange rates for crypto withdrawal quotes.

use crate::db::Repository;
use crate::domain::{Decimal, ExchangeRate, TimeMs};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RateError {
    #[error("Price feed unreachable: {0}")]
    Network(String),
    #[error("Price feed returned HTTP {0}")]
    Http(u16),
    #[error("Price feed rate limited")]
    RateLimited,
    #[error("Unexpected price feed response: {0}")]
    Parse(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// NGN prices of the two assets we quote against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NgnPrices {
    pub usdt: Decimal,
    pub bnb: Decimal,
}

#[async_trait]
pub trait PriceFeed: Send + Sync + fmt::Debug {
    async fn fetch_ngn_prices(&self) -> Result<NgnPrices, RateError>;
}

/// CoinGecko-style `simple/price` endpoint.
#[derive(Debug, Clone)]
pub struct CoinGeckoFeed {
    client: Client,
    url: String,
    retry_budget: Duration,
}

impl CoinGeckoFeed {
    pub fn new(url: String, request_timeout: Duration, retry_budget: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url,
            retry_budget,
        }
    }
}

#[async_trait]
impl PriceFeed for CoinGeckoFeed {
    async fn fetch_ngn_prices(&self) -> Result<NgnPrices, RateError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        let body = retry(backoff, || async {
            let response = self
                .client
                .get(&self.url)
                .query(&[("ids", "tether,binancecoin"), ("vs_currencies", "ngn")])
                .send()
                .await
                .map_err(|e| backoff::Error::transient(RateError::Network(e.to_string())))?;

            let status = response.status();
            if status == 429 {
                return Err(backoff::Error::transient(RateError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(RateError::Http(status.as_u16())));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(RateError::Http(status.as_u16())));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| backoff::Error::permanent(RateError::Parse(e.to_string())))
        })
        .await?;

        parse_prices(&body)
    }
}

/// Parse `{"tether": {"ngn": 1650.2}, "binancecoin": {"ngn": 912345}}`.
pub fn parse_prices(body: &serde_json::Value) -> Result<NgnPrices, RateError> {
    let price = |id: &str| -> Result<Decimal, RateError> {
        let raw = body
            .get(id)
            .and_then(|v| v.get("ngn"))
            .ok_or_else(|| RateError::Parse(format!("missing {}.ngn", id)))?;
        let text = match raw {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => return Err(RateError::Parse(format!("{}.ngn is {}", id, other))),
        };
        let value = Decimal::from_str(&text)
            .map_err(|e| RateError::Parse(format!("{}.ngn: {}", id, e)))?;
        if !value.is_positive() {
            return Err(RateError::Parse(format!("{}.ngn must be positive", id)));
        }
        Ok(value)
    };

    Ok(NgnPrices {
        usdt: price("tether")?,
        bnb: price("binancecoin")?,
    })
}

/// Fetches prices and stores them as the single active rate.
#[derive(Debug, Clone)]
pub struct RateRefresher {
    repo: Repository,
    feed: Arc<dyn PriceFeed>,
}

impl RateRefresher {
    pub fn new(repo: Repository, feed: Arc<dyn PriceFeed>) -> Self {
        Self { repo, feed }
    }

    pub async fn refresh(&self) -> Result<ExchangeRate, RateError> {
        let prices = self.feed.fetch_ngn_prices().await?;
        debug!(usdt = %prices.usdt, bnb = %prices.bnb, "Fetched NGN prices");
        let rate = self
            .repo
            .activate_exchange_rate(prices.usdt, prices.bnb, TimeMs::now())
            .await?;
        info!(
            ngn_per_usdt = %rate.ngn_per_usdt,
            ngn_per_bnb = %rate.ngn_per_bnb,
            "Exchange rate refreshed"
        );
        Ok(rate)
    }
}
