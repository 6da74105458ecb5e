//! Expiry Reaper
//!
//! Periodically aborts orders whose claims or holds outlived the
//! reservation window, and cancels withdrawal requests whose hold outlived
//! the review window. Safe to run alongside itself and alongside callbacks:
//! each abort takes the order-row lock, and whoever loses sees a terminal
//! state and does nothing.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::TransactionTrait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::errors::ServiceError;
use crate::services::holds::{release_hold_in, HoldManager};
use crate::services::settlement::{SettlementCoordinator, TransitionOutcome};
use crate::services::warehouse::{release_claims_of, WarehouseStore};
use crate::services::withdrawals::WithdrawalService;

pub const EXPIRY_REASON: &str = "reservation_expired";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_claims: usize,
    pub expired_holds: usize,
    pub orders_aborted: usize,
    /// Orders another transition had already finished
    pub already_terminal: usize,
    /// Claims and holds released without an order to abort
    pub orphans_released: u64,
    pub withdrawals_lapsed: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct ExpiryReaper {
    coordinator: Arc<SettlementCoordinator>,
    warehouse: WarehouseStore,
    holds: HoldManager,
    withdrawals: WithdrawalService,
    clock: SharedClock,
    batch_size: u64,
}

impl ExpiryReaper {
    pub fn new(
        coordinator: Arc<SettlementCoordinator>,
        warehouse: WarehouseStore,
        holds: HoldManager,
        withdrawals: WithdrawalService,
        clock: SharedClock,
        batch_size: u64,
    ) -> Self {
        Self {
            coordinator,
            warehouse,
            holds,
            withdrawals,
            clock,
            batch_size,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, ServiceError> {
        self.sweep_at(self.clock.now()).await
    }

    /// One pass over claims and holds that expired before `now`.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let claims = self.warehouse.expired_claims(now, self.batch_size).await?;
        let holds = self.holds.expired_holds(now, self.batch_size).await?;

        let mut report = SweepReport {
            expired_claims: claims.len(),
            expired_holds: holds.len(),
            ..SweepReport::default()
        };

        let mut owners: BTreeSet<Uuid> = claims.iter().filter_map(|u| u.locked_by).collect();
        owners.extend(holds.iter().map(|h| h.order_id));

        for owner in owners {
            match self.coordinator.abort(owner, EXPIRY_REASON).await {
                Ok(TransitionOutcome::Applied(_)) => report.orders_aborted += 1,
                Ok(TransitionOutcome::AlreadyTerminal(view)) => {
                    debug!(order_id = %owner, state = %view.settlement_state, "Expired order already terminal");
                    report.already_terminal += 1;
                    self.release_leftovers(owner, now, &mut report).await;
                }
                Err(ServiceError::NotFound(_)) => match self.withdrawals.expire(owner).await {
                    Ok(true) => report.withdrawals_lapsed += 1,
                    Ok(false) => self.release_leftovers(owner, now, &mut report).await,
                    Err(err) => {
                        error!(request_id = %owner, error = %err, "Failed to expire withdrawal request");
                        report.errors += 1;
                    }
                },
                Err(err) => {
                    error!(order_id = %owner, error = %err, "Failed to abort expired order");
                    report.errors += 1;
                }
            }
        }

        counter!("keymart_reaper.sweeps", 1);
        if report.orders_aborted > 0 || report.orphans_released > 0 || report.withdrawals_lapsed > 0 {
            counter!("keymart_reaper.orders_aborted", report.orders_aborted as u64);
            info!(?report, "Expiry sweep finished");
        }
        Ok(report)
    }

    /// Frees claims and holds that no live order owns any more. A failure is
    /// counted and the sweep moves on to the next owner.
    async fn release_leftovers(&self, owner: Uuid, now: DateTime<Utc>, report: &mut SweepReport) {
        match self.try_release_leftovers(owner, now).await {
            Ok(released) => report.orphans_released += released,
            Err(err) => {
                error!(%owner, error = %err, "Failed to release leftovers of expired owner");
                report.errors += 1;
            }
        }
    }

    async fn try_release_leftovers(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let stale_holds: Vec<Uuid> = self
            .holds
            .expired_holds(now, self.batch_size)
            .await?
            .into_iter()
            .filter(|h| h.order_id == owner)
            .map(|h| h.id)
            .collect();

        let txn = self.coordinator.db().begin().await?;
        let mut released = release_claims_of(&txn, owner, now).await?;
        for hold_id in stale_holds {
            release_hold_in(&txn, hold_id, now).await?;
            released += 1;
        }
        txn.commit().await?;
        if released > 0 {
            warn!(%owner, released, "Released claims and holds without a live order");
        }
        Ok(released)
    }

    /// Sweeps forever at `interval`.
    pub async fn run(self, interval: Duration) {
        info!(?interval, batch_size = self.batch_size, "Expiry reaper started");
        loop {
            if let Err(e) = self.sweep().await {
                error!("expiry reaper error: {}", e);
            }
            sleep(interval).await;
        }
    }
}
