#![allow(dead_code)]

use afrimobile_ledger::config::{CommissionRates, SharedCommissionRates};
use afrimobile_ledger::db::init_db;
use afrimobile_ledger::domain::{
    BankAccount, Currency, CryptoWallet, Decimal, Purchase, PurchaseKind, Rail, TimeMs, User,
    UserId,
};
use afrimobile_ledger::orchestration::{AdminService, WithdrawalService, WithdrawalSettings};
use afrimobile_ledger::settlement::{AdapterRegistry, HotWalletKeystore, MockAdapter};
use afrimobile_ledger::{Ledger, Repository};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const WALLET: &str = "0x2222222222222222222222222222222222222222";

pub struct Harness {
    pub repo: Repository,
    pub ledger: Ledger,
    pub withdrawals: WithdrawalService,
    pub admin: AdminService,
    pub keystore: HotWalletKeystore,
    pub bank: Arc<MockAdapter>,
    pub crypto: Arc<MockAdapter>,
    db_path: String,
    _temp: Arc<TempDir>,
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn settings() -> WithdrawalSettings {
    WithdrawalSettings {
        call_timeout: Duration::from_secs(5),
        ..WithdrawalSettings::default()
    }
}

pub async fn setup() -> Harness {
    setup_with(settings(), MockAdapter::new(Rail::Bank), MockAdapter::new(Rail::Crypto)).await
}

pub async fn setup_with(
    settings: WithdrawalSettings,
    bank: MockAdapter,
    crypto: MockAdapter,
) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    build(db_path, Arc::new(temp_dir), settings, bank, crypto).await
}

async fn build(
    db_path: String,
    temp_dir: Arc<TempDir>,
    settings: WithdrawalSettings,
    bank: MockAdapter,
    crypto: MockAdapter,
) -> Harness {
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Repository::new(pool);
    let ledger = Ledger::new(
        repo.clone(),
        SharedCommissionRates::new(CommissionRates::default()),
    );

    let bank = Arc::new(bank);
    let crypto = Arc::new(crypto);
    let adapters = AdapterRegistry::new()
        .with(bank.clone())
        .with(crypto.clone());
    let withdrawals = WithdrawalService::new(ledger.clone(), adapters, settings);
    let keystore = HotWalletKeystore::new();
    let admin = AdminService::new(
        withdrawals.clone(),
        keystore.clone(),
        Duration::from_secs(1),
        Duration::from_secs(1),
    );

    Harness {
        repo,
        ledger,
        withdrawals,
        admin,
        keystore,
        bank,
        crypto,
        db_path,
        _temp: temp_dir,
    }
}

impl Harness {
    /// A second harness over the same database file, as after a restart.
    pub async fn reopen(&self) -> Harness {
        build(
            self.db_path.clone(),
            self._temp.clone(),
            settings(),
            MockAdapter::new(Rail::Bank),
            MockAdapter::new(Rail::Crypto),
        )
        .await
    }

    pub async fn user(&self, id: &str, referrer: Option<&str>) -> UserId {
        self.repo.upsert_user(&User::new(id, id, referrer)).await.unwrap();
        UserId::new(id)
    }

    pub async fn bank_account(&self, user: &UserId, verified: bool) {
        self.repo
            .upsert_bank_account(
                user,
                &BankAccount {
                    account_number: "0123456789".to_string(),
                    bank_code: "058".to_string(),
                    bank_name: "GTBank".to_string(),
                    account_name: "Test User".to_string(),
                    verified,
                },
            )
            .await
            .unwrap();
    }

    pub async fn wallet(&self, user: &UserId, verified: bool) {
        self.repo
            .upsert_crypto_wallet(
                user,
                &CryptoWallet {
                    address: WALLET.to_string(),
                    verified,
                },
            )
            .await
            .unwrap();
    }

    /// Record and apply a completed purchase.
    pub async fn purchase(&self, id: &str, buyer: &UserId, amount: &str) {
        let purchase = Purchase {
            id: id.to_string(),
            buyer_id: buyer.clone(),
            kind: PurchaseKind::Regular,
            gross_amount: dec(amount),
            currency: Currency::ngn(),
            shares: 1,
            completed_at: Some(TimeMs::now()),
        };
        self.repo.insert_purchase(&purchase).await.unwrap();
        self.ledger.apply_purchase(id).await.unwrap();
    }

    /// Give `user` exactly `amount` of earnings through a one-off downline
    /// purchase credited at 100%.
    pub async fn fund(&self, user: &UserId, amount: &str) {
        let rates = self.ledger.rates().current();
        self.ledger.rates().reload(
            CommissionRates::new([Decimal::hundred(), Decimal::zero(), Decimal::zero()]).unwrap(),
        );
        let buyer = self
            .user(&format!("funder-{}", user), Some(user.as_str()))
            .await;
        let id = format!("fund-{}", uuid::Uuid::new_v4());
        self.purchase(&id, &buyer, amount).await;
        self.ledger.rates().reload(rates);
    }

    pub async fn usdt_rate(&self, ngn_per_usdt: &str) {
        self.repo
            .activate_exchange_rate(dec(ngn_per_usdt), dec("900000"), TimeMs::now())
            .await
            .unwrap();
    }

    /// Assert the stored balance sheet matches the ledger.
    pub async fn assert_consistent(&self, user: &UserId) {
        let report = self.ledger.audit(user).await.unwrap();
        assert!(report.is_healthy(), "ledger drift: {:?}", report.breaches);
    }
}
