//! Outbound provider notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rsd_core::{ProviderId, RequestId, ServiceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawReason {
    Declined,
    Assigned,
    Canceled,
    Timeout,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    RequestOffered {
        request_id: RequestId,
        service_type: ServiceType,
        origin_lat: f64,
        origin_lng: f64,
        address: String,
        distance_km: f64,
        radius_km: f64,
    },
    OfferWithdrawn {
        request_id: RequestId,
        reason: WithdrawReason,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestOffered { .. } => "request_offered",
            Self::OfferWithdrawn { .. } => "offer_withdrawn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::NonRetryable => "non_retryable",
        }
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned http status {status}")]
    HttpStatus { status: u16 },
}

impl NotifyError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        provider_id: ProviderId,
        request_id: RequestId,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError>;
}

/// Sends in the background; failures are logged and never surface to the
/// caller.
pub fn notify_detached(
    notifier: Arc<dyn Notifier>,
    provider_id: ProviderId,
    request_id: RequestId,
    payload: NotificationPayload,
) {
    tokio::spawn(async move {
        if let Err(err) = notifier.notify(provider_id, request_id, &payload).await {
            warn!(
                %provider_id,
                %request_id,
                kind = payload.kind(),
                disposition = err.disposition().as_str(),
                error = %err,
                "provider notification failed"
            );
        }
    });
}

/// Notifier for local runs without a webhook.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        provider_id: ProviderId,
        request_id: RequestId,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        info!(%provider_id, %request_id, kind = payload.kind(), "notification");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub webhook_url: String,
    pub timeout: Duration,
    pub max_in_flight: usize,
}

impl NotifierConfig {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            timeout: Duration::from_secs(10),
            max_in_flight: 16,
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    provider_id: ProviderId,
    request_id: RequestId,
    payload: &'a NotificationPayload,
}

/// POSTs each notification as JSON to a single webhook.
#[derive(Debug)]
pub struct HttpNotifier {
    client: reqwest::Client,
    webhook_url: String,
    in_flight: Arc<Semaphore>,
}

impl HttpNotifier {
    pub fn new(config: NotifierConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            webhook_url: config.webhook_url,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(
        &self,
        provider_id: ProviderId,
        request_id: RequestId,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        // The semaphore lives as long as self and is never closed.
        let _permit = self.in_flight.acquire().await.ok();
        let span = info_span!("notify", %provider_id, %request_id, kind = payload.kind());
        async {
            let body = WebhookBody {
                provider_id,
                request_id,
                payload,
            };
            let resp = self.client.post(&self.webhook_url).json(&body).send().await?;
            let status = resp.status();
            if status.is_success() {
                debug!(status = status.as_u16(), "notification delivered");
                Ok(())
            } else {
                Err(NotifyError::HttpStatus {
                    status: status.as_u16(),
                })
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn payloads_are_tagged_by_type() {
        let request_id = Uuid::new_v4();
        let json = serde_json::to_value(NotificationPayload::OfferWithdrawn {
            request_id,
            reason: WithdrawReason::Assigned,
        })
        .unwrap();
        assert_eq!(json["type"], "offer_withdrawn");
        assert_eq!(json["reason"], "assigned");

        let offered = NotificationPayload::RequestOffered {
            request_id,
            service_type: ServiceType::FuelDelivery,
            origin_lat: -23.55,
            origin_lng: -46.63,
            address: "Av. Paulista 1000".into(),
            distance_km: 4.5,
            radius_km: 5.0,
        };
        let json = serde_json::to_value(&offered).unwrap();
        assert_eq!(json["type"], "request_offered");
        assert_eq!(json["service_type"], "fuel_delivery");
        assert_eq!(offered.kind(), "request_offered");
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(
            NotifyError::HttpStatus { status: 503 }.disposition(),
            RetryDisposition::Retryable
        );
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let payload = NotificationPayload::OfferWithdrawn {
            request_id: Uuid::new_v4(),
            reason: WithdrawReason::Timeout,
        };
        LogNotifier
            .notify(Uuid::new_v4(), Uuid::new_v4(), &payload)
            .await
            .unwrap();
    }
}
