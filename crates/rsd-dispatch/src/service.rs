//! Request lifecycle operations, wired to persistence and live search.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rsd_core::{
    FinishReason, LifecycleError, NewServiceRequest, Party, PaymentMethod, Provider, ProviderId,
    RequestId, RequestStatus, ServiceRequest,
};
use rsd_feed::{
    notify_detached, ChangeFeed, InMemoryChangeFeed, NotificationPayload, Notifier,
    ProviderChange, WithdrawReason,
};
use rsd_storage::{DeclineEntry, DispatchStore};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SearchConfig;
use crate::declines::DeclineTracker;
use crate::error::DispatchError;
use crate::search::{Dispatcher, SearchSnapshot, SearchTarget, SessionContext};
use crate::settlement::{settle_request, SettlementOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcceptOutcome {
    Assigned { request: ServiceRequest },
    /// Another provider got there first, or the search already ended.
    LostRace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionOutcome {
    pub request: ServiceRequest,
    pub settlement: Option<SettlementOutcome>,
}

pub struct DispatchService {
    store: Arc<dyn DispatchStore>,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
    local_feed: Option<InMemoryChangeFeed>,
    fallback_global_fee_percent: f64,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        feed: Arc<dyn ChangeFeed>,
        notifier: Arc<dyn Notifier>,
        config: SearchConfig,
        fallback_global_fee_percent: f64,
    ) -> Self {
        let ctx = SessionContext {
            store: store.clone(),
            notifier: notifier.clone(),
            declines: Arc::new(DeclineTracker::new(config.cooldown())),
            config,
        };
        Self {
            store,
            dispatcher: Dispatcher::new(ctx, feed),
            notifier,
            local_feed: None,
            fallback_global_fee_percent,
        }
    }

    /// In-process wiring: provider writes are echoed on `feed` because no
    /// database trigger will publish them.
    pub fn in_memory(
        store: Arc<dyn DispatchStore>,
        feed: InMemoryChangeFeed,
        notifier: Arc<dyn Notifier>,
        config: SearchConfig,
        fallback_global_fee_percent: f64,
    ) -> Self {
        let mut service = Self::new(
            store,
            Arc::new(feed.clone()),
            notifier,
            config,
            fallback_global_fee_percent,
        );
        service.local_feed = Some(feed);
        service
    }

    pub fn store(&self) -> &Arc<dyn DispatchStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn search_config(&self) -> &SearchConfig {
        self.dispatcher.config()
    }

    pub async fn submit(&self, new_request: NewServiceRequest) -> Result<ServiceRequest, DispatchError> {
        let now = Utc::now();
        let mut request = new_request.into_request(now)?;
        request.transition_to(RequestStatus::Searching, now)?;
        self.store.insert_request(&request).await?;
        info!(request_id = %request.id, service_type = %request.service_type, "request submitted");
        self.dispatcher.start(SearchTarget::from(&request)).await;
        Ok(request)
    }

    pub async fn get_request(&self, request_id: RequestId) -> Result<ServiceRequest, DispatchError> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or(DispatchError::RequestNotFound(request_id))
    }

    pub async fn search_snapshot(
        &self,
        request_id: RequestId,
    ) -> Result<Option<SearchSnapshot>, DispatchError> {
        self.get_request(request_id).await?;
        Ok(self.dispatcher.snapshot(request_id))
    }

    /// Starts a new search for a request still in `searching`, e.g. after the
    /// previous one timed out.
    pub async fn restart_search(&self, request_id: RequestId) -> Result<SearchSnapshot, DispatchError> {
        let request = self.get_request(request_id).await?;
        require_status(&request, "restart_search", RequestStatus::Searching)?;
        let declined: Vec<_> = request.declined_provider_ids.iter().copied().collect();
        let handle = self
            .dispatcher
            .start_with_declines(SearchTarget::from(&request), &declined)
            .await;
        Ok(handle.snapshot())
    }

    pub async fn accept(
        &self,
        request_id: RequestId,
        provider_id: ProviderId,
    ) -> Result<AcceptOutcome, DispatchError> {
        let current = self.get_request(request_id).await?;
        let provider = self.provider(provider_id).await?;
        if provider.blocked || provider.current_request_id.is_some() {
            return Err(DispatchError::ProviderUnavailable(provider_id));
        }
        if current.status == RequestStatus::Searching
            && !self.dispatcher.admits(&SearchTarget::from(&current), &provider)
        {
            info!(%request_id, %provider_id, "provider not eligible for this request");
            return Err(DispatchError::ProviderUnavailable(provider_id));
        }

        // Provider first, then request; each claim is a conditional write.
        if !self.store.claim_provider(provider_id, request_id).await? {
            return Err(DispatchError::ProviderUnavailable(provider_id));
        }
        let assigned = match self.store.try_assign(request_id, provider_id, Utc::now()).await {
            Ok(assigned) => assigned,
            Err(err) => {
                self.release_provider(provider_id).await;
                return Err(err.into());
            }
        };
        let Some(request) = assigned else {
            info!(%request_id, %provider_id, "lost the assignment race");
            self.release_provider(provider_id).await;
            return Ok(AcceptOutcome::LostRace);
        };
        self.dispatcher.mark_matched(request_id, provider_id);
        self.echo_provider(provider_id).await;
        info!(%request_id, %provider_id, "provider assigned");
        Ok(AcceptOutcome::Assigned { request })
    }

    pub async fn decline(
        &self,
        request_id: RequestId,
        provider_id: ProviderId,
    ) -> Result<ServiceRequest, DispatchError> {
        let request = self.get_request(request_id).await?;
        require_status(&request, "decline", RequestStatus::Searching)?;
        self.store
            .append_decline(&DeclineEntry {
                request_id,
                provider_id,
                declined_at: Utc::now(),
            })
            .await?;
        if !self.dispatcher.decline(request_id, provider_id) {
            warn!(%request_id, %provider_id, "decline recorded with no live search");
        }
        self.get_request(request_id).await
    }

    pub async fn propose(
        &self,
        request_id: RequestId,
        by: Party,
        value: f64,
    ) -> Result<ServiceRequest, DispatchError> {
        self.mutate(request_id, |request, now| request.propose_value(by, value, now))
            .await
    }

    pub async fn accept_value(
        &self,
        request_id: RequestId,
        by: Party,
    ) -> Result<ServiceRequest, DispatchError> {
        self.mutate(request_id, |request, now| request.accept_value(by, now))
            .await
    }

    pub async fn confirm_value(&self, request_id: RequestId) -> Result<ServiceRequest, DispatchError> {
        self.mutate(request_id, |request, now| request.confirm_value(now))
            .await
    }

    pub async fn reopen_negotiation(
        &self,
        request_id: RequestId,
    ) -> Result<ServiceRequest, DispatchError> {
        self.mutate(request_id, |request, now| request.reopen_negotiation(now))
            .await
    }

    pub async fn record_payment(
        &self,
        request_id: RequestId,
        method: PaymentMethod,
    ) -> Result<ServiceRequest, DispatchError> {
        self.mutate(request_id, |request, now| request.record_payment(method, now))
            .await
    }

    pub async fn provider_finish(
        &self,
        request_id: RequestId,
        provider_id: ProviderId,
    ) -> Result<ServiceRequest, DispatchError> {
        self.mutate(request_id, |request, now| request.provider_finish(provider_id, now))
            .await
    }

    pub async fn reject_completion(
        &self,
        request_id: RequestId,
    ) -> Result<ServiceRequest, DispatchError> {
        self.mutate(request_id, |request, now| request.reject_completion(now))
            .await
    }

    /// Client confirms the provider's completion; the request finishes and
    /// settles. A settlement failure does not undo the finish.
    pub async fn confirm_completion(
        &self,
        request_id: RequestId,
    ) -> Result<CompletionOutcome, DispatchError> {
        let request = self
            .mutate(request_id, |request, now| {
                request.finish(FinishReason::ClientConfirmed, now)
            })
            .await?;
        self.after_finish(&request).await
    }

    /// Finishes a request whose client never answered. Returns `None` when
    /// the request already moved on.
    pub async fn auto_finish(
        &self,
        request: &ServiceRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<CompletionOutcome>, DispatchError> {
        let mut next = request.clone();
        next.finish(FinishReason::ClientTimeout, now)?;
        if !self
            .store
            .update_if_status(&next, RequestStatus::PendingClientConfirmation)
            .await?
        {
            return Ok(None);
        }
        info!(request_id = %next.id, "request auto-finished after client timeout");
        self.after_finish(&next).await.map(Some)
    }

    async fn after_finish(&self, request: &ServiceRequest) -> Result<CompletionOutcome, DispatchError> {
        if let Some(provider_id) = request.fulfilled_by {
            self.release_provider(provider_id).await;
        }
        let settlement = match self.settle(request.id).await {
            Ok(outcome) => Some(outcome),
            Err(err @ DispatchError::Invariant { .. }) => return Err(err),
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "settlement deferred");
                None
            }
        };
        Ok(CompletionOutcome {
            request: request.clone(),
            settlement,
        })
    }

    pub async fn client_cancel(
        &self,
        request_id: RequestId,
        reason: Option<String>,
    ) -> Result<ServiceRequest, DispatchError> {
        let before = self.get_request(request_id).await?;
        let request = self
            .mutate(request_id, |request, now| request.cancel_by_client(reason, now))
            .await?;
        self.dispatcher.stop(request_id);
        if let Some(provider_id) = before.provider_id {
            self.release_provider(provider_id).await;
            notify_detached(
                self.notifier.clone(),
                provider_id,
                request_id,
                NotificationPayload::OfferWithdrawn {
                    request_id,
                    reason: WithdrawReason::Canceled,
                },
            );
        }
        info!(%request_id, status_before = %before.status, "request canceled by client");
        Ok(request)
    }

    /// Provider walks away before service starts. While still searching this
    /// is a decline; after assignment it releases the request back to a fresh
    /// search that excludes the provider.
    pub async fn provider_cancel(
        &self,
        request_id: RequestId,
        provider_id: ProviderId,
        reason: Option<String>,
    ) -> Result<ServiceRequest, DispatchError> {
        let current = self.get_request(request_id).await?;
        if current.status == RequestStatus::Searching {
            return self.decline(request_id, provider_id).await;
        }

        let request = self
            .mutate(request_id, |request, now| {
                request.release_by_provider(provider_id, now)
            })
            .await?;
        self.store
            .append_decline(&DeclineEntry {
                request_id,
                provider_id,
                declined_at: Utc::now(),
            })
            .await?;
        self.release_provider(provider_id).await;
        info!(%request_id, %provider_id, reason = reason.as_deref().unwrap_or(""), "provider released request");
        self.dispatcher
            .start_with_declines(SearchTarget::from(&request), &[provider_id])
            .await;
        self.get_request(request_id).await
    }

    pub async fn upsert_provider(&self, provider: Provider) -> Result<Provider, DispatchError> {
        provider.location.validate("provider")?;
        self.store.upsert_provider(&provider).await?;
        if let Some(feed) = &self.local_feed {
            feed.publish(&ProviderChange::Upsert(provider.clone()));
        }
        Ok(provider)
    }

    pub async fn settle(&self, request_id: RequestId) -> Result<SettlementOutcome, DispatchError> {
        settle_request(
            self.store.as_ref(),
            request_id,
            self.fallback_global_fee_percent,
            Utc::now(),
        )
        .await
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    async fn provider(&self, provider_id: ProviderId) -> Result<Provider, DispatchError> {
        self.store
            .get_provider(provider_id)
            .await?
            .ok_or(DispatchError::ProviderNotFound(provider_id))
    }

    /// Loads, applies `op`, and writes back only if nobody changed the status
    /// in between.
    async fn mutate<F>(&self, request_id: RequestId, op: F) -> Result<ServiceRequest, DispatchError>
    where
        F: FnOnce(&mut ServiceRequest, DateTime<Utc>) -> Result<(), LifecycleError>,
    {
        let mut request = self.get_request(request_id).await?;
        let expected = request.status;
        op(&mut request, Utc::now())?;
        if !self.store.update_if_status(&request, expected).await? {
            return Err(DispatchError::Conflict(request_id));
        }
        Ok(request)
    }

    async fn release_provider(&self, provider_id: ProviderId) {
        if let Err(err) = self.store.set_current_request(provider_id, None).await {
            warn!(%provider_id, error = %err, "could not release provider");
            return;
        }
        self.echo_provider(provider_id).await;
    }

    async fn echo_provider(&self, provider_id: ProviderId) {
        let Some(feed) = &self.local_feed else {
            return;
        };
        match self.store.get_provider(provider_id).await {
            Ok(Some(provider)) => feed.publish(&ProviderChange::Upsert(provider)),
            Ok(None) => feed.publish(&ProviderChange::Delete(provider_id)),
            Err(err) => warn!(%provider_id, error = %err, "could not echo provider change"),
        }
    }
}

fn require_status(
    request: &ServiceRequest,
    operation: &'static str,
    expected: RequestStatus,
) -> Result<(), DispatchError> {
    if request.status == expected {
        Ok(())
    } else {
        Err(LifecycleError::WrongStatus {
            operation,
            expected,
            actual: request.status,
        }
        .into())
    }
}
