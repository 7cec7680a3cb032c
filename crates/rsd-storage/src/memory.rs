//! In-process store used by tests and database-less local runs.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsd_core::fees::Promotion;
use rsd_core::{
    sort_candidates, Candidate, CandidateQuery, Provider, ProviderId, RequestId, RequestStatus,
    ServiceRequest,
};
use tokio::sync::RwLock;

use crate::{DeclineEntry, FeeRecord, LedgerStore, ProviderStore, RequestStore, ReviewFlag};

#[derive(Debug, Default)]
struct MemoryState {
    requests: HashMap<RequestId, ServiceRequest>,
    providers: HashMap<ProviderId, Provider>,
    declines: Vec<DeclineEntry>,
    global_fee_percentage: Option<f64>,
    promotions: Vec<Promotion>,
    fee_records: HashMap<RequestId, FeeRecord>,
    review_flags: Vec<ReviewFlag>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn declines(&self) -> Vec<DeclineEntry> {
        self.state.read().await.declines.clone()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert_request(&self, request: &ServiceRequest) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.requests.contains_key(&request.id) {
            anyhow::bail!("request {} already exists", request.id);
        }
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> anyhow::Result<Option<ServiceRequest>> {
        Ok(self.state.read().await.requests.get(&id).cloned())
    }

    async fn try_assign(
        &self,
        id: RequestId,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ServiceRequest>> {
        let mut state = self.state.write().await;
        let Some(request) = state.requests.get_mut(&id) else {
            return Ok(None);
        };
        if request.status != RequestStatus::Searching || request.provider_id.is_some() {
            return Ok(None);
        }
        request
            .assign(provider_id, now)
            .with_context(|| format!("assigning request {id}"))?;
        Ok(Some(request.clone()))
    }

    async fn update_if_status(
        &self,
        request: &ServiceRequest,
        expected: RequestStatus,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        match state.requests.get_mut(&request.id) {
            Some(stored) if stored.status == expected => {
                // Declines recorded since the caller loaded the row survive.
                let declined = std::mem::take(&mut stored.declined_provider_ids);
                *stored = request.clone();
                stored.declined_provider_ids.extend(declined);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_decline(&self, entry: &DeclineEntry) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Some(request) = state.requests.get_mut(&entry.request_id) {
            request.declined_provider_ids.insert(entry.provider_id);
        }
        state.declines.push(entry.clone());
        Ok(())
    }

    async fn list_pending_confirmation_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ServiceRequest>> {
        let state = self.state.read().await;
        let mut out = state
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::PendingClientConfirmation)
            .filter(|r| r.provider_finish_requested_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|r| r.provider_finish_requested_at);
        Ok(out)
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn upsert_provider(&self, provider: &Provider) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.providers.insert(provider.id, provider.clone());
        Ok(())
    }

    async fn get_provider(&self, id: ProviderId) -> anyhow::Result<Option<Provider>> {
        Ok(self.state.read().await.providers.get(&id).cloned())
    }

    async fn find_candidates(&self, query: &CandidateQuery) -> anyhow::Result<Vec<Candidate>> {
        let state = self.state.read().await;
        let mut found = state
            .providers
            .values()
            .filter_map(|p| query.evaluate(p))
            .collect::<Vec<_>>();
        sort_candidates(&mut found);
        Ok(found)
    }

    async fn set_current_request(
        &self,
        provider_id: ProviderId,
        request_id: Option<RequestId>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let provider = state
            .providers
            .get_mut(&provider_id)
            .with_context(|| format!("provider {provider_id} not found"))?;
        provider.current_request_id = request_id;
        Ok(())
    }

    async fn claim_provider(
        &self,
        provider_id: ProviderId,
        request_id: RequestId,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        let Some(provider) = state.providers.get_mut(&provider_id) else {
            return Ok(false);
        };
        if provider.blocked || provider.current_request_id.is_some() {
            return Ok(false);
        }
        provider.current_request_id = Some(request_id);
        Ok(true)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn global_fee_percentage(&self) -> anyhow::Result<Option<f64>> {
        Ok(self.state.read().await.global_fee_percentage)
    }

    async fn set_global_fee_percentage(&self, percentage: f64) -> anyhow::Result<()> {
        self.state.write().await.global_fee_percentage = Some(percentage);
        Ok(())
    }

    async fn active_promotions(&self, at: DateTime<Utc>) -> anyhow::Result<Vec<Promotion>> {
        let state = self.state.read().await;
        Ok(state
            .promotions
            .iter()
            .filter(|p| p.is_active_at(at))
            .cloned()
            .collect())
    }

    async fn insert_promotion(&self, promotion: &Promotion) -> anyhow::Result<()> {
        self.state.write().await.promotions.push(promotion.clone());
        Ok(())
    }

    async fn fee_record(&self, request_id: RequestId) -> anyhow::Result<Option<FeeRecord>> {
        Ok(self.state.read().await.fee_records.get(&request_id).cloned())
    }

    async fn record_settlement(
        &self,
        record: &FeeRecord,
        pending_balance_delta_cents: i64,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        if state.fee_records.contains_key(&record.request_id) {
            return Ok(false);
        }
        if pending_balance_delta_cents != 0 {
            let provider = state
                .providers
                .get_mut(&record.provider_id)
                .with_context(|| format!("provider {} not found", record.provider_id))?;
            provider.pending_balance_cents += pending_balance_delta_cents;
        }
        state.fee_records.insert(record.request_id, record.clone());
        Ok(true)
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> anyhow::Result<()> {
        self.state.write().await.review_flags.push(flag.clone());
        Ok(())
    }

    async fn review_flags(&self, request_id: RequestId) -> anyhow::Result<Vec<ReviewFlag>> {
        let state = self.state.read().await;
        Ok(state
            .review_flags
            .iter()
            .filter(|f| f.request_id == request_id)
            .cloned()
            .collect())
    }
}
