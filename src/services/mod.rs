// Inventory and funds
pub mod deposits;
pub mod holds;
pub mod wallet;
pub mod warehouse;
pub mod withdrawals;

// Orders and settlement
pub mod commission;
pub mod orders;
pub mod settlement;

// Payment reconciliation
pub mod callback_signature;
pub mod payment_gateway;
pub mod payment_queue;

// Background maintenance
pub mod reaper;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::audit::SharedAuditSink;
use crate::events::EventSender;

use self::callback_signature::{SharedCallbackVerifier, VnpaySignature};
use self::commission::{FixedCommissionRate, SharedCommissionRates};
use self::deposits::DepositService;
use self::holds::HoldManager;
use self::orders::OrderAggregate;
use self::payment_gateway::PaymentGateway;
use self::payment_queue::PaymentQueueWorker;
use self::reaper::ExpiryReaper;
use self::settlement::{SettlementCoordinator, SettlementSettings};
use self::wallet::WalletLedger;
use self::warehouse::WarehouseStore;
use self::withdrawals::{WithdrawalService, WithdrawalSettings};

/// Every service the HTTP layer, workers and CLI use, wired once.
#[derive(Clone)]
pub struct AppServices {
    pub warehouse: WarehouseStore,
    pub wallet: WalletLedger,
    pub holds: HoldManager,
    pub withdrawals: WithdrawalService,
    pub deposits: DepositService,
    pub orders: OrderAggregate,
    pub settlement: Arc<SettlementCoordinator>,
    pub gateway: PaymentGateway,
    pub payment_queue: PaymentQueueWorker,
    pub reaper: ExpiryReaper,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        clock: SharedClock,
        events: EventSender,
        audit: SharedAuditSink,
    ) -> Result<Self, ServiceError> {
        let rates: SharedCommissionRates =
            Arc::new(FixedCommissionRate::new(config.default_commission_rate)?);
        let verifier: SharedCallbackVerifier =
            Arc::new(VnpaySignature::new(config.payment_hash_secret.clone()));
        Ok(Self::with_collaborators(
            db, config, clock, events, audit, rates, verifier,
        ))
    }

    /// Same as `new` with the commission lookup and callback verifier supplied
    /// by the caller.
    pub fn with_collaborators(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        clock: SharedClock,
        events: EventSender,
        audit: SharedAuditSink,
        rates: SharedCommissionRates,
        verifier: SharedCallbackVerifier,
    ) -> Self {
        let warehouse = WarehouseStore::new(db.clone(), clock.clone());
        let wallet = WalletLedger::new(db.clone(), clock.clone());
        let holds = HoldManager::new(db.clone(), clock.clone());
        let withdrawals = WithdrawalService::new(
            db.clone(),
            clock.clone(),
            events.clone(),
            audit.clone(),
            WithdrawalSettings::from(config),
        );
        let deposits = DepositService::new(db.clone(), clock.clone(), events.clone(), audit.clone());
        let orders = OrderAggregate::new(db.clone(), clock.clone());
        let settlement = Arc::new(SettlementCoordinator::new(
            db,
            clock.clone(),
            rates,
            events.clone(),
            audit.clone(),
            SettlementSettings::from(config),
        ));
        let gateway =
            PaymentGateway::new(settlement.clone(), deposits.clone(), verifier, events, audit);
        let payment_queue =
            PaymentQueueWorker::new(settlement.clone(), config.payment_queue_batch_size);
        let reaper = ExpiryReaper::new(
            settlement.clone(),
            warehouse.clone(),
            holds.clone(),
            withdrawals.clone(),
            clock,
            config.reaper_batch_size,
        );

        Self {
            warehouse,
            wallet,
            holds,
            withdrawals,
            deposits,
            orders,
            settlement,
            gateway,
            payment_queue,
            reaper,
        }
    }
}
