use afrimobile_ledger::config::{Config, SharedCommissionRates};
use afrimobile_ledger::orchestration::scheduler::{spawn_rate_refresh, spawn_verify_pending};
use afrimobile_ledger::orchestration::{
    AdminService, CoinGeckoFeed, RateRefresher, Reconciler, Shutdown, WithdrawalService,
    WithdrawalSettings,
};
use afrimobile_ledger::settlement::{
    AdapterRegistry, BankAdapter, CryptoAdapter, HotWalletKeystore, RpcClient,
};
use afrimobile_ledger::{api, db::init_db, Ledger, Repository};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("Configuration error")?;
    let port = config.port;

    let pool = init_db(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let repo = Repository::new(pool);

    let rates = SharedCommissionRates::new(config.commission_rates);
    let ledger = Ledger::new(repo.clone(), rates);

    let keystore = HotWalletKeystore::new();
    let bank = BankAdapter::new(
        config.fiat.clone(),
        config.provider_timeout,
        config.provider_retry_budget,
    );
    let chain_rpc = RpcClient::new(
        config.chain.rpc_url.clone(),
        config.provider_timeout,
        config.provider_retry_budget,
    );
    let crypto = CryptoAdapter::new(chain_rpc, config.chain.clone(), keystore.clone());
    let adapters = AdapterRegistry::new()
        .with(Arc::new(bank))
        .with(Arc::new(crypto));

    let withdrawals = WithdrawalService::new(
        ledger,
        adapters,
        WithdrawalSettings::from_config(&config),
    );
    let admin = AdminService::new(
        withdrawals.clone(),
        keystore.clone(),
        config.provider_timeout,
        config.provider_retry_budget,
    );
    let reconciler = Reconciler::new(withdrawals.clone());

    if !repo
        .credit_uniqueness_enforced()
        .await
        .context("Failed to inspect credit index")?
    {
        let report = reconciler
            .sweep_duplicate_credits()
            .await
            .context("Duplicate-credit sweep failed")?;
        tracing::warn!(
            groups = report.groups,
            credits_removed = report.credits_removed,
            "Removed duplicate credits found at startup"
        );
    }

    let shutdown = Shutdown::new();
    let mut jobs = Vec::new();
    if let Some(period) = config.verify_interval {
        jobs.push(spawn_verify_pending(reconciler, period, &shutdown));
    }
    if let Some(period) = config.rate_refresh_interval {
        let feed = CoinGeckoFeed::new(
            config.price_feed_url.clone(),
            config.provider_timeout,
            config.provider_retry_budget,
        );
        let refresher = RateRefresher::new(repo.clone(), Arc::new(feed));
        jobs.push(spawn_rate_refresh(refresher, period, &shutdown));
    }

    let app = api::create_router(api::AppState::new(withdrawals, admin));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("Server listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
            server_shutdown.trigger();
        })
        .await
        .context("Server error")?;

    shutdown.trigger();
    for job in jobs {
        let _ = job.await;
    }
    keystore.clear();
    tracing::info!("Shutdown complete");
    Ok(())
}
