#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rsd_core::geo::EARTH_RADIUS_KM;
use rsd_core::{
    GeoPoint, Location, NewServiceRequest, Provider, ProviderId, RequestId, ServiceRequest,
    ServiceType,
};
use rsd_dispatch::{DispatchService, SearchConfig, SearchHandle, SearchPhase, SearchSnapshot};
use rsd_feed::{InMemoryChangeFeed, NotificationPayload, Notifier, NotifyError};
use rsd_storage::MemoryStore;
use uuid::Uuid;

pub const ORIGIN: GeoPoint = GeoPoint::new(-23.55, -46.63);

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(ProviderId, NotificationPayload)>>,
}

impl RecordingNotifier {
    pub fn sent_to(&self, provider_id: ProviderId) -> Vec<NotificationPayload> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == provider_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        provider_id: ProviderId,
        _request_id: RequestId,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((provider_id, payload.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub feed: InMemoryChangeFeed,
    pub service: DispatchService,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let feed = InMemoryChangeFeed::new();
        let service = DispatchService::in_memory(
            store.clone(),
            feed.clone(),
            notifier.clone(),
            SearchConfig::default(),
            15.0,
        );
        Self {
            store,
            notifier,
            feed,
            service,
        }
    }

    pub async fn add_provider(&self, provider: Provider) -> Provider {
        self.service.upsert_provider(provider).await.unwrap()
    }

    pub async fn submit(&self, service_type: &str) -> ServiceRequest {
        let destination = (service_type == "tow")
            .then(|| Location::new(-23.60, -46.70, "Oficina Central"));
        self.service
            .submit(NewServiceRequest {
                client_id: Uuid::new_v4(),
                service_type: service_type.into(),
                origin: Location::new(ORIGIN.lat, ORIGIN.lng, "Praça da Sé"),
                destination,
            })
            .await
            .unwrap()
    }

    pub fn handle(&self, request_id: RequestId) -> SearchHandle {
        self.service.dispatcher().handle(request_id).unwrap()
    }
}

/// A provider `km` due north of [`ORIGIN`].
pub fn provider_north(km: f64) -> Provider {
    let lat = ORIGIN.lat + (km / EARTH_RADIUS_KM).to_degrees();
    Provider {
        id: Uuid::new_v4(),
        location: GeoPoint::new(lat, ORIGIN.lng),
        radar_range_km: 150.0,
        services_offered: [ServiceType::BatteryJump, ServiceType::Tow]
            .into_iter()
            .collect(),
        online: true,
        last_heartbeat_at: Some(Utc::now()),
        current_request_id: None,
        blocked: false,
        custom_fee_enabled: false,
        custom_fee_percentage: None,
        custom_fee_fixed: None,
        pending_balance_cents: 0,
    }
}

pub async fn wait_for(
    handle: &SearchHandle,
    predicate: impl FnMut(&SearchSnapshot) -> bool,
) -> SearchSnapshot {
    let mut rx = handle.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(predicate)).await;
    let snapshot = waited
        .expect("search did not reach the expected state")
        .expect("search session dropped")
        .clone();
    snapshot
}

pub async fn wait_for_phase(handle: &SearchHandle, phase: SearchPhase) -> SearchSnapshot {
    wait_for(handle, |s| s.phase == phase).await
}

/// Lets detached notification tasks run.
pub async fn drain_tasks() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
