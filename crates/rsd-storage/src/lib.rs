//! Persistence boundary for dispatch: request rows, provider rows and the
//! append-only decline / fee ledgers.
//!
//! Every write that can race another actor is a conditional update that
//! reports whether it won, so callers can treat a lost race as an ordinary
//! outcome.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsd_core::fees::Promotion;
use rsd_core::{
    Candidate, CandidateQuery, FeeSource, PaymentMethod, Provider, ProviderId, RequestId,
    RequestStatus, ServiceRequest,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "rsd-storage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclineEntry {
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    pub declined_at: DateTime<Utc>,
}

/// Settlement ledger row. At most one exists per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeRecord {
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    pub total_cents: i64,
    pub percentage: f64,
    pub percentage_fee_cents: i64,
    pub fixed_fee_cents: i64,
    pub application_fee_cents: i64,
    pub provider_net_cents: i64,
    pub source: FeeSource,
    pub promotion_id: Option<Uuid>,
    pub payment_method: Option<PaymentMethod>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFlag {
    pub request_id: RequestId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert_request(&self, request: &ServiceRequest) -> anyhow::Result<()>;

    async fn get_request(&self, id: RequestId) -> anyhow::Result<Option<ServiceRequest>>;

    /// `UPDATE ... WHERE status = 'searching' AND provider_id IS NULL`.
    /// Returns the updated row when this caller won the assignment.
    async fn try_assign(
        &self,
        id: RequestId,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ServiceRequest>>;

    /// Writes `request` only if the stored status still equals `expected`.
    async fn update_if_status(
        &self,
        request: &ServiceRequest,
        expected: RequestStatus,
    ) -> anyhow::Result<bool>;

    /// Appends to the declines ledger and merges the provider into the
    /// request's declined set.
    async fn append_decline(&self, entry: &DeclineEntry) -> anyhow::Result<()>;

    async fn list_pending_confirmation_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ServiceRequest>>;
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn upsert_provider(&self, provider: &Provider) -> anyhow::Result<()>;

    async fn get_provider(&self, id: ProviderId) -> anyhow::Result<Option<Provider>>;

    /// Eligible in-range providers, nearest first.
    async fn find_candidates(&self, query: &CandidateQuery) -> anyhow::Result<Vec<Candidate>>;

    async fn set_current_request(
        &self,
        provider_id: ProviderId,
        request_id: Option<RequestId>,
    ) -> anyhow::Result<()>;

    /// Engages the provider on `request_id` only if they are unblocked and
    /// free. Returns whether the claim held.
    async fn claim_provider(
        &self,
        provider_id: ProviderId,
        request_id: RequestId,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn global_fee_percentage(&self) -> anyhow::Result<Option<f64>>;

    async fn set_global_fee_percentage(&self, percentage: f64) -> anyhow::Result<()>;

    async fn active_promotions(&self, at: DateTime<Utc>) -> anyhow::Result<Vec<Promotion>>;

    async fn insert_promotion(&self, promotion: &Promotion) -> anyhow::Result<()>;

    async fn fee_record(&self, request_id: RequestId) -> anyhow::Result<Option<FeeRecord>>;

    /// Inserts the fee record and applies `pending_balance_delta_cents` to the
    /// provider in one unit. Returns `false` without touching anything when a
    /// record already exists for the request.
    async fn record_settlement(
        &self,
        record: &FeeRecord,
        pending_balance_delta_cents: i64,
    ) -> anyhow::Result<bool>;

    async fn flag_for_review(&self, flag: &ReviewFlag) -> anyhow::Result<()>;

    async fn review_flags(&self, request_id: RequestId) -> anyhow::Result<Vec<ReviewFlag>>;
}

pub trait DispatchStore: RequestStore + ProviderStore + LedgerStore {}

impl<T> DispatchStore for T where T: RequestStore + ProviderStore + LedgerStore {}

/// Stored spellings that mean `status`, legacy aliases included.
pub fn stored_status_names(status: RequestStatus) -> &'static [&'static str] {
    match status {
        RequestStatus::Negotiating => &["negotiating", "accepted"],
        RequestStatus::InService => &["in_service", "confirmed"],
        RequestStatus::Idle => &["idle"],
        RequestStatus::Searching => &["searching"],
        RequestStatus::AwaitingPayment => &["awaiting_payment"],
        RequestStatus::PendingClientConfirmation => &["pending_client_confirmation"],
        RequestStatus::Finished => &["finished"],
        RequestStatus::Canceled => &["canceled"],
    }
}
