//! Commission resolution and settlement arithmetic.
//!
//! Exactly one fee source is effective for a computation. Amounts are split in
//! integer cents so the application fee and provider net always add back up to
//! the charged total.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSource {
    Promotion,
    Individual,
    Global,
}

impl FeeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promotion => "promotion",
            Self::Individual => "individual",
            Self::Global => "global",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "promotion" => Some(Self::Promotion),
            "individual" => Some(Self::Individual),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromotionScope {
    Global,
    Provider { provider_id: ProviderId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub id: Uuid,
    pub scope: PromotionScope,
    pub percentage: f64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl Promotion {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at < self.ends_at
    }

    pub fn applies_to(&self, provider_id: ProviderId, at: DateTime<Utc>) -> bool {
        if !self.is_active_at(at) {
            return false;
        }
        match self.scope {
            PromotionScope::Global => true,
            PromotionScope::Provider { provider_id: target } => target == provider_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CustomRate {
    pub enabled: bool,
    pub percentage: f64,
    #[serde(default)]
    pub fixed_fee: Option<f64>,
}

/// Everything the resolver needs to know about one provider at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub global_percentage: f64,
    #[serde(default)]
    pub custom: Option<CustomRate>,
    #[serde(default)]
    pub promotions: Vec<Promotion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveFee {
    pub percentage: f64,
    pub fixed_fee: f64,
    pub source: FeeSource,
    #[serde(default)]
    pub promotion_id: Option<Uuid>,
}

/// Picks the single effective fee source for `provider_id` at `at`.
///
/// A provider-scoped promotion outranks a global one; among promotions of the
/// same scope the latest start wins.
pub fn effective_fee(provider_id: ProviderId, at: DateTime<Utc>, schedule: &FeeSchedule) -> EffectiveFee {
    let promotion = schedule
        .promotions
        .iter()
        .filter(|p| p.applies_to(provider_id, at))
        .max_by_key(|p| (matches!(p.scope, PromotionScope::Provider { .. }), p.starts_at));

    if let Some(promotion) = promotion {
        return EffectiveFee {
            percentage: promotion.percentage,
            fixed_fee: 0.0,
            source: FeeSource::Promotion,
            promotion_id: Some(promotion.id),
        };
    }

    if let Some(custom) = schedule.custom.filter(|c| c.enabled) {
        return EffectiveFee {
            percentage: custom.percentage,
            fixed_fee: custom.fixed_fee.unwrap_or(0.0),
            source: FeeSource::Individual,
            promotion_id: None,
        };
    }

    EffectiveFee {
        percentage: schedule.global_percentage,
        fixed_fee: 0.0,
        source: FeeSource::Global,
        promotion_id: None,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeeError {
    #[error("service value {0} is negative or not finite")]
    InvalidServiceValue(f64),
    #[error("fee percentage {0} is outside 0..=100")]
    PercentageOutOfRange(f64),
    #[error("fixed fee {0} is negative or not finite")]
    InvalidFixedFee(f64),
    #[error("application fee {application_fee_cents} exceeds total {total_cents}")]
    NegativeNet {
        total_cents: i64,
        application_fee_cents: i64,
    },
    #[error("split mismatch: {application_fee_cents} + {provider_net_cents} != {total_cents}")]
    Mismatch {
        total_cents: i64,
        application_fee_cents: i64,
        provider_net_cents: i64,
    },
}

pub fn to_cents(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub total_cents: i64,
    pub percentage_fee_cents: i64,
    pub fixed_fee_cents: i64,
    pub application_fee_cents: i64,
    pub provider_net_cents: i64,
}

impl FeeSplit {
    pub fn compute(service_value: f64, fee: &EffectiveFee) -> Result<Self, FeeError> {
        if !service_value.is_finite() || service_value < 0.0 {
            return Err(FeeError::InvalidServiceValue(service_value));
        }
        if !fee.percentage.is_finite() || !(0.0..=100.0).contains(&fee.percentage) {
            return Err(FeeError::PercentageOutOfRange(fee.percentage));
        }
        if !fee.fixed_fee.is_finite() || fee.fixed_fee < 0.0 {
            return Err(FeeError::InvalidFixedFee(fee.fixed_fee));
        }

        let total_cents = to_cents(service_value);
        let percentage_fee_cents = (total_cents as f64 * fee.percentage / 100.0).round() as i64;
        let fixed_fee_cents = to_cents(fee.fixed_fee);
        let application_fee_cents = percentage_fee_cents + fixed_fee_cents;
        let provider_net_cents = total_cents - application_fee_cents;

        if provider_net_cents < 0 {
            return Err(FeeError::NegativeNet {
                total_cents,
                application_fee_cents,
            });
        }
        if application_fee_cents + provider_net_cents != total_cents {
            return Err(FeeError::Mismatch {
                total_cents,
                application_fee_cents,
                provider_net_cents,
            });
        }

        Ok(Self {
            total_cents,
            percentage_fee_cents,
            fixed_fee_cents,
            application_fee_cents,
            provider_net_cents,
        })
    }
}
