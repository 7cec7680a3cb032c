//! Fee settlement for finished requests.

use chrono::{DateTime, Utc};
use rsd_core::fees::{effective_fee, FeeSchedule, FeeSplit};
use rsd_core::{PaymentMethod, RequestId, RequestStatus};
use rsd_storage::{DispatchStore, FeeRecord, ReviewFlag};
use serde::Serialize;
use tracing::{error, info};

use crate::error::DispatchError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Settled { record: FeeRecord },
    AlreadySettled { record: FeeRecord },
}

impl SettlementOutcome {
    pub fn record(&self) -> &FeeRecord {
        match self {
            Self::Settled { record } | Self::AlreadySettled { record } => record,
        }
    }
}

/// Computes and persists the fee split for a finished request exactly once.
///
/// The fee sources are evaluated at the moment the request finished, so a
/// re-run after a promotion ends resolves the same way. Invariant violations
/// flag the request for manual review and are never retried.
pub async fn settle_request(
    store: &dyn DispatchStore,
    request_id: RequestId,
    fallback_global_percentage: f64,
    now: DateTime<Utc>,
) -> Result<SettlementOutcome, DispatchError> {
    let request = store
        .get_request(request_id)
        .await?
        .ok_or(DispatchError::RequestNotFound(request_id))?;
    if request.status != RequestStatus::Finished {
        return Err(DispatchError::NotFinished {
            request_id,
            status: request.status,
        });
    }
    if let Some(record) = store.fee_record(request_id).await? {
        return Ok(SettlementOutcome::AlreadySettled { record });
    }

    let Some(provider_id) = request.fulfilled_by else {
        return Err(flag(store, request_id, "finished request has no fulfilling provider", now).await);
    };
    let Some(agreed_value) = request.agreed_value else {
        return Err(flag(store, request_id, "finished request has no agreed value", now).await);
    };
    let provider = store
        .get_provider(provider_id)
        .await?
        .ok_or(DispatchError::ProviderNotFound(provider_id))?;

    let finished_at = request.updated_at;
    let schedule = FeeSchedule {
        global_percentage: store
            .global_fee_percentage()
            .await?
            .unwrap_or(fallback_global_percentage),
        custom: provider.custom_rate(),
        promotions: store.active_promotions(finished_at).await?,
    };
    let fee = effective_fee(provider_id, finished_at, &schedule);
    let split = match FeeSplit::compute(agreed_value, &fee) {
        Ok(split) => split,
        Err(err) => return Err(flag(store, request_id, &err.to_string(), now).await),
    };

    let record = FeeRecord {
        request_id,
        provider_id,
        total_cents: split.total_cents,
        percentage: fee.percentage,
        percentage_fee_cents: split.percentage_fee_cents,
        fixed_fee_cents: split.fixed_fee_cents,
        application_fee_cents: split.application_fee_cents,
        provider_net_cents: split.provider_net_cents,
        source: fee.source,
        promotion_id: fee.promotion_id,
        payment_method: request.payment_method,
        created_at: now,
    };
    // Direct payments never pass the gateway, so the provider owes the fee.
    let balance_delta = match request.payment_method {
        Some(PaymentMethod::Direct) => split.application_fee_cents,
        _ => 0,
    };

    if store.record_settlement(&record, balance_delta).await? {
        info!(
            %request_id,
            %provider_id,
            source = fee.source.as_str(),
            application_fee_cents = record.application_fee_cents,
            provider_net_cents = record.provider_net_cents,
            "request settled"
        );
        return Ok(SettlementOutcome::Settled { record });
    }
    match store.fee_record(request_id).await? {
        Some(record) => Ok(SettlementOutcome::AlreadySettled { record }),
        None => Err(DispatchError::Conflict(request_id)),
    }
}

async fn flag(
    store: &dyn DispatchStore,
    request_id: RequestId,
    reason: &str,
    now: DateTime<Utc>,
) -> DispatchError {
    error!(%request_id, reason, "settlement invariant violated; flagged for review");
    let flag = ReviewFlag {
        request_id,
        reason: reason.to_string(),
        created_at: now,
    };
    if let Err(err) = store.flag_for_review(&flag).await {
        error!(%request_id, error = %err, "could not persist review flag");
    }
    DispatchError::Invariant {
        request_id,
        reason: reason.to_string(),
    }
}
