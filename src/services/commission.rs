//! Commission rates and the per-item commission/seller split.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::wallet::money;

/// Product/shop commission lookup. Rates are percentages in `0..=100`.
#[async_trait]
pub trait CommissionRates: Send + Sync {
    async fn rate_for(&self, product_id: Uuid) -> Result<Decimal, ServiceError>;
}

pub type SharedCommissionRates = Arc<dyn CommissionRates>;

/// Same rate for every product.
#[derive(Debug, Clone, Copy)]
pub struct FixedCommissionRate {
    rate: Decimal,
}

impl FixedCommissionRate {
    pub fn new(rate: Decimal) -> Result<Self, ServiceError> {
        validate_rate(rate)?;
        Ok(Self { rate })
    }
}

#[async_trait]
impl CommissionRates for FixedCommissionRate {
    async fn rate_for(&self, _product_id: Uuid) -> Result<Decimal, ServiceError> {
        Ok(self.rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub total: Decimal,
    pub rate: Decimal,
    pub commission: Decimal,
    pub seller_amount: Decimal,
}

pub fn validate_rate(rate: Decimal) -> Result<(), ServiceError> {
    if rate < Decimal::ZERO || rate > Decimal::ONE_HUNDRED {
        return Err(ServiceError::ValidationError(format!(
            "commission rate {} is outside 0..=100",
            rate
        )));
    }
    Ok(())
}

/// Commission is rounded to cents; the seller gets the exact remainder so
/// the two parts always sum back to the total.
pub fn split(total: Decimal, rate: Decimal) -> Result<CommissionSplit, ServiceError> {
    validate_rate(rate)?;
    let total = money(total);
    if total < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "amount must not be negative".to_string(),
        ));
    }
    let commission = money(total * rate / Decimal::ONE_HUNDRED);
    Ok(CommissionSplit {
        total,
        rate,
        commission,
        seller_amount: total - commission,
    })
}
