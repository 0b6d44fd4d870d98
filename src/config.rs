use crate::domain::{Decimal, Generation, Rail, SettlementMode};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// USDT (BEP-20) on BNB Smart Chain mainnet.
pub const DEFAULT_USDT_CONTRACT: &str = "0x55d398326f99059fF775485246999027B3197955";
pub const DEFAULT_PRICE_FEED_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub commission_rates: CommissionRates,
    pub limits: WithdrawalLimits,
    pub bank_mode: SettlementMode,
    pub crypto_mode: SettlementMode,
    pub fiat: FiatConfig,
    pub chain: ChainConfig,
    pub price_feed_url: String,
    pub provider_timeout: Duration,
    pub provider_retry_budget: Duration,
    pub verify_interval: Option<Duration>,
    pub rate_refresh_interval: Option<Duration>,
}

impl Config {
    pub fn mode_for(&self, rail: Rail) -> SettlementMode {
        match rail {
            Rail::Bank => self.bank_mode,
            Rail::Crypto => self.crypto_mode,
        }
    }
}

/// Minimum withdrawal amounts, in NGN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawalLimits {
    pub min_bank_ngn: Decimal,
    pub min_crypto_ngn: Decimal,
}

impl WithdrawalLimits {
    pub fn minimum(&self, rail: Rail) -> Decimal {
        match rail {
            Rail::Bank => self.min_bank_ngn,
            Rail::Crypto => self.min_crypto_ngn,
        }
    }
}

impl Default for WithdrawalLimits {
    fn default() -> Self {
        Self {
            min_bank_ngn: Decimal::from_i64(20_000),
            min_crypto_ngn: Decimal::from_i64(1_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiatConfig {
    pub base_url: String,
    pub bearer_token: String,
    pub account_id: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub usdt_contract: String,
    pub chain_id: u64,
    pub confirmations: u64,
    pub token_decimals: u32,
    pub transfer_gas_limit: u64,
}

/// Commission percentages per generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionRates([Decimal; 3]);

impl CommissionRates {
    /// Rates must each lie in `0..=100`.
    pub fn new(rates: [Decimal; 3]) -> Result<Self, ConfigError> {
        if rates
            .iter()
            .any(|r| r.is_negative() || *r > Decimal::hundred())
        {
            return Err(ConfigError::InvalidValue(
                "COMMISSION_RATES".to_string(),
                "each rate must be between 0 and 100".to_string(),
            ));
        }
        Ok(Self(rates))
    }

    pub fn rate(&self, generation: Generation) -> Decimal {
        self.0[generation.index()]
    }

    pub fn as_array(&self) -> [Decimal; 3] {
        self.0
    }

    /// Parse `"15,3,2"`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |msg: &str| ConfigError::InvalidValue("COMMISSION_RATES".to_string(), msg.to_string());
        let parts: Vec<Decimal> = s
            .split(',')
            .map(|p| Decimal::from_str(p.trim()))
            .collect::<Result<_, _>>()
            .map_err(|_| invalid("must be three comma-separated numbers"))?;
        let rates: [Decimal; 3] = parts
            .try_into()
            .map_err(|_| invalid("must be three comma-separated numbers"))?;
        Self::new(rates)
    }
}

impl Default for CommissionRates {
    fn default() -> Self {
        Self([
            Decimal::from_i64(15),
            Decimal::from_i64(3),
            Decimal::from_i64(2),
        ])
    }
}

/// Process-wide, reloadable handle to the commission rates.
#[derive(Debug, Clone, Default)]
pub struct SharedCommissionRates(Arc<RwLock<CommissionRates>>);

impl SharedCommissionRates {
    pub fn new(rates: CommissionRates) -> Self {
        Self(Arc::new(RwLock::new(rates)))
    }

    pub fn current(&self) -> CommissionRates {
        match self.0.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn reload(&self, rates: CommissionRates) {
        let mut guard = match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = rates;
        tracing::info!(rates = ?rates.as_array(), "Commission rates reloaded");
    }

    /// Re-read `COMMISSION_RATES` from the process environment.
    pub fn reload_from_env(&self) -> Result<CommissionRates, ConfigError> {
        let rates = match std::env::var("COMMISSION_RATES") {
            Ok(s) => CommissionRates::parse(&s)?,
            Err(_) => CommissionRates::default(),
        };
        self.reload(rates);
        Ok(rates)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = required(&env_map, "DATABASE_PATH")?;

        let commission_rates = match env_map.get("COMMISSION_RATES") {
            Some(s) => CommissionRates::parse(s)?,
            None => CommissionRates::default(),
        };

        let defaults = WithdrawalLimits::default();
        let limits = WithdrawalLimits {
            min_bank_ngn: parse_or(
                &env_map,
                "MIN_BANK_NGN",
                defaults.min_bank_ngn,
                "must be a decimal amount",
            )?,
            min_crypto_ngn: parse_or(
                &env_map,
                "MIN_CRYPTO_NGN",
                defaults.min_crypto_ngn,
                "must be a decimal amount",
            )?,
        };

        let bank_mode = parse_mode(&env_map, "BANK_SETTLEMENT")?;
        let crypto_mode = parse_mode(&env_map, "CRYPTO_SETTLEMENT")?;

        let fiat = FiatConfig {
            base_url: required(&env_map, "FIAT_API_URL")?,
            bearer_token: required(&env_map, "FIAT_API_TOKEN")?,
            account_id: env_map.get("FIAT_ACCOUNT_ID").cloned().unwrap_or_default(),
            sender_name: env_map
                .get("FIAT_SENDER_NAME")
                .cloned()
                .unwrap_or_else(|| "AfriMobile".to_string()),
        };

        let chain = ChainConfig {
            rpc_url: required(&env_map, "BSC_RPC_URL")?,
            usdt_contract: env_map
                .get("USDT_CONTRACT")
                .cloned()
                .unwrap_or_else(|| DEFAULT_USDT_CONTRACT.to_string()),
            chain_id: parse_or(&env_map, "BSC_CHAIN_ID", 56u64, "must be a valid u64")?,
            confirmations: parse_or(&env_map, "CONFIRMATIONS", 1u64, "must be a valid u64")?,
            token_decimals: 18,
            transfer_gas_limit: parse_or(
                &env_map,
                "TRANSFER_GAS_LIMIT",
                100_000u64,
                "must be a valid u64",
            )?,
        };
        if !crate::domain::is_valid_evm_address(&chain.usdt_contract) {
            return Err(ConfigError::InvalidValue(
                "USDT_CONTRACT".to_string(),
                "must be a 0x-prefixed 20-byte address".to_string(),
            ));
        }

        let price_feed_url = env_map
            .get("PRICE_FEED_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PRICE_FEED_URL.to_string());

        let provider_timeout = Duration::from_secs(parse_or(
            &env_map,
            "PROVIDER_TIMEOUT_SECS",
            30u64,
            "must be a valid u64",
        )?);
        let provider_retry_budget = Duration::from_secs(parse_or(
            &env_map,
            "PROVIDER_RETRY_SECS",
            30u64,
            "must be a valid u64",
        )?);
        let verify_interval = optional_interval(&env_map, "VERIFY_INTERVAL_SECS", 300)?;
        let rate_refresh_interval = optional_interval(&env_map, "RATE_REFRESH_SECS", 600)?;

        Ok(Config {
            port,
            database_path,
            commission_rates,
            limits,
            bank_mode,
            crypto_mode,
            fiat,
            chain,
            price_feed_url,
            provider_timeout,
            provider_retry_budget,
            verify_interval,
            rate_refresh_interval,
        })
    }
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    hint: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), hint.to_string())),
        None => Ok(default),
    }
}

fn parse_mode(env_map: &HashMap<String, String>, key: &str) -> Result<SettlementMode, ConfigError> {
    let raw = env_map.get(key).map(|s| s.as_str()).unwrap_or("instant");
    SettlementMode::from_str(raw).map_err(|_| {
        ConfigError::InvalidValue(
            key.to_string(),
            format!("must be instant or manual, got {}", raw),
        )
    })
}

/// A period in seconds where `0` disables the job.
fn optional_interval(
    env_map: &HashMap<String, String>,
    key: &str,
    default_secs: u64,
) -> Result<Option<Duration>, ConfigError> {
    let secs = parse_or(env_map, key, default_secs, "must be a valid u64")?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
