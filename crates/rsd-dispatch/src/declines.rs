//! Per-request decline bookkeeping for active searches.
//!
//! A declined provider stays excluded from every ordinary query until the
//! cooldown retry clears them with [`DeclineTracker::clear_for_retry`] or the
//! request's search ends. The cooldown clock itself is single per request and
//! always runs from the oldest outstanding decline.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rsd_core::{ProviderId, RequestId};
use tokio::time::Instant;

type RequestDeclines = HashMap<ProviderId, Instant>;

#[derive(Debug)]
pub struct DeclineTracker {
    cooldown: Duration,
    requests: Mutex<HashMap<RequestId, RequestDeclines>>,
}

impl DeclineTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, RequestDeclines>> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Idempotent; a repeated decline restarts that pair's clock.
    pub fn record_decline(&self, request_id: RequestId, provider_id: ProviderId, now: Instant) {
        self.lock()
            .entry(request_id)
            .or_default()
            .insert(provider_id, now);
    }

    pub fn is_excluded(&self, request_id: RequestId, provider_id: ProviderId) -> bool {
        self.lock()
            .get(&request_id)
            .is_some_and(|declines| declines.contains_key(&provider_id))
    }

    pub fn clear_for_retry(&self, request_id: RequestId, provider_id: ProviderId) {
        let mut requests = self.lock();
        if let Some(declines) = requests.get_mut(&request_id) {
            declines.remove(&provider_id);
            if declines.is_empty() {
                requests.remove(&request_id);
            }
        }
    }

    /// Oldest outstanding decline, ties broken by provider id.
    pub fn oldest(&self, request_id: RequestId) -> Option<(ProviderId, Instant)> {
        self.lock().get(&request_id).and_then(|declines| {
            declines
                .iter()
                .map(|(provider_id, at)| (*provider_id, *at))
                .min_by_key(|(provider_id, at)| (*at, *provider_id))
        })
    }

    /// Every provider still declined on the request, however old the decline.
    pub fn excluded_ids(&self, request_id: RequestId) -> HashSet<ProviderId> {
        self.lock()
            .get(&request_id)
            .map(|declines| declines.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear_request(&self, request_id: RequestId) {
        self.lock().remove(&request_id);
    }

    /// Time left on the request's cooldown clock; `None` with no declines.
    pub fn remaining_cooldown(&self, request_id: RequestId, now: Instant) -> Option<Duration> {
        let (_, oldest) = self.oldest(request_id)?;
        Some((oldest + self.cooldown).saturating_duration_since(now))
    }
}
