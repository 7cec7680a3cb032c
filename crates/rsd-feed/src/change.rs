//! Provider change feed.
//!
//! Delivery is at-least-once with no ordering across providers; consumers key
//! every event by provider id so duplicates and reorderings are harmless.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsd_core::{GeoPoint, Provider, ProviderId, RequestId, ServiceType};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Postgres channel the `providers` trigger notifies on.
pub const PROVIDER_CHANNEL: &str = "provider_changes";

const FEED_CAPACITY: usize = 1024;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed change payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("provider {provider_id} has invalid coordinates")]
    InvalidCoordinates { provider_id: ProviderId },
    #[error("provider {provider_id} offers unknown service {service:?}")]
    UnknownService {
        provider_id: ProviderId,
        service: String,
    },
    #[error("provider {provider_id} has invalid radar range {radar_range_km}")]
    InvalidRadarRange {
        provider_id: ProviderId,
        radar_range_km: f64,
    },
}

/// Wire shape of a `providers` row, matching `row_to_json(providers)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub lat: f64,
    pub lng: f64,
    pub radar_range_km: f64,
    #[serde(default)]
    pub services_offered: Vec<String>,
    pub online: bool,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_request_id: Option<RequestId>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub custom_fee_enabled: bool,
    #[serde(default)]
    pub custom_fee_percentage: Option<f64>,
    #[serde(default)]
    pub custom_fee_fixed: Option<f64>,
    #[serde(default)]
    pub pending_balance_cents: i64,
}

impl ProviderRecord {
    pub fn validate(self) -> Result<Provider, FeedError> {
        let location = GeoPoint::new(self.lat, self.lng);
        location
            .validate("provider")
            .map_err(|_| FeedError::InvalidCoordinates { provider_id: self.id })?;
        if !self.radar_range_km.is_finite() || self.radar_range_km < 0.0 {
            return Err(FeedError::InvalidRadarRange {
                provider_id: self.id,
                radar_range_km: self.radar_range_km,
            });
        }
        let mut services_offered = BTreeSet::new();
        for service in &self.services_offered {
            let parsed = ServiceType::parse(service).map_err(|_| FeedError::UnknownService {
                provider_id: self.id,
                service: service.clone(),
            })?;
            services_offered.insert(parsed);
        }
        Ok(Provider {
            id: self.id,
            location,
            radar_range_km: self.radar_range_km,
            services_offered,
            online: self.online,
            last_heartbeat_at: self.last_heartbeat_at,
            current_request_id: self.current_request_id,
            blocked: self.blocked,
            custom_fee_enabled: self.custom_fee_enabled,
            custom_fee_percentage: self.custom_fee_percentage,
            custom_fee_fixed: self.custom_fee_fixed,
            pending_balance_cents: self.pending_balance_cents,
        })
    }
}

impl From<&Provider> for ProviderRecord {
    fn from(provider: &Provider) -> Self {
        Self {
            id: provider.id,
            lat: provider.location.lat,
            lng: provider.location.lng,
            radar_range_km: provider.radar_range_km,
            services_offered: provider
                .services_offered
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            online: provider.online,
            last_heartbeat_at: provider.last_heartbeat_at,
            current_request_id: provider.current_request_id,
            blocked: provider.blocked,
            custom_fee_enabled: provider.custom_fee_enabled,
            custom_fee_percentage: provider.custom_fee_percentage,
            custom_fee_fixed: provider.custom_fee_fixed,
            pending_balance_cents: provider.pending_balance_cents,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ChangeEnvelope {
    Upsert { provider: ProviderRecord },
    Delete { id: ProviderId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChange {
    Upsert(Provider),
    Delete(ProviderId),
}

impl ProviderChange {
    pub fn provider_id(&self) -> ProviderId {
        match self {
            Self::Upsert(provider) => provider.id,
            Self::Delete(id) => *id,
        }
    }
}

pub fn decode_change(payload: &str) -> Result<ProviderChange, FeedError> {
    match serde_json::from_str::<ChangeEnvelope>(payload)? {
        ChangeEnvelope::Upsert { provider } => Ok(ProviderChange::Upsert(provider.validate()?)),
        ChangeEnvelope::Delete { id } => Ok(ProviderChange::Delete(id)),
    }
}

pub fn encode_change(change: &ProviderChange) -> String {
    let envelope = match change {
        ProviderChange::Upsert(provider) => ChangeEnvelope::Upsert {
            provider: ProviderRecord::from(provider),
        },
        ProviderChange::Delete(id) => ChangeEnvelope::Delete { id: *id },
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Change(ProviderChange),
    /// The subscriber fell behind and `u64` events were dropped; its view
    /// must be rebuilt from a fresh query.
    Lagged(u64),
}

/// One consumer's view of the feed. Malformed payloads are logged and
/// skipped here so consumers only ever see validated changes.
#[derive(Debug)]
pub struct FeedSubscription {
    rx: broadcast::Receiver<String>,
}

impl FeedSubscription {
    pub fn new(rx: broadcast::Receiver<String>) -> Self {
        Self { rx }
    }

    /// `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => match decode_change(&payload) {
                    Ok(change) => return Some(FeedItem::Change(change)),
                    Err(err) => {
                        warn!(error = %err, "dropping malformed provider change");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(FeedItem::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> anyhow::Result<FeedSubscription>;
}

/// Process-local feed; stores and tests publish into it directly.
#[derive(Debug, Clone)]
pub struct InMemoryChangeFeed {
    tx: broadcast::Sender<String>,
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, change: &ProviderChange) {
        self.publish_raw(encode_change(change));
    }

    pub fn publish_raw(&self, payload: impl Into<String>) {
        // No subscribers is normal between searches.
        let _ = self.tx.send(payload.into());
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self) -> anyhow::Result<FeedSubscription> {
        Ok(FeedSubscription::new(self.tx.subscribe()))
    }
}

/// Fans `LISTEN provider_changes` notifications out to subscribers.
#[derive(Debug)]
pub struct PgChangeFeed {
    tx: broadcast::Sender<String>,
    listener_task: JoinHandle<()>,
}

impl PgChangeFeed {
    pub async fn start(pool: &PgPool) -> anyhow::Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(PROVIDER_CHANNEL).await?;
        info!(channel = PROVIDER_CHANNEL, "listening for provider changes");

        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        let forward = tx.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        debug!(bytes = notification.payload().len(), "provider change received");
                        let _ = forward.send(notification.payload().to_string());
                    }
                    Err(err) => {
                        // recv reconnects on the next call; wait for the next tick.
                        warn!(error = %err, "provider change listener failed");
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    }
                }
            }
        });
        Ok(Self { tx, listener_task })
    }

    pub fn shutdown(&self) {
        self.listener_task.abort();
    }
}

impl Drop for PgChangeFeed {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self) -> anyhow::Result<FeedSubscription> {
        Ok(FeedSubscription::new(self.tx.subscribe()))
    }
}
