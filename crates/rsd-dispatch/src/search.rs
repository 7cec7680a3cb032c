//! Progressive proximity search.
//!
//! Each request being searched owns one [`SearchSession`] task. The task owns
//! its expansion/cooldown timer and countdown ticker, so cancelling or
//! dropping the session tears them all down together. Callers talk to it
//! through a cloneable [`SearchHandle`].

use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rsd_core::{
    sort_candidates, Candidate, CandidateQuery, GeoPoint, Provider, ProviderId, RequestId,
    ServiceRequest, ServiceType,
};
use rsd_feed::{
    notify_detached, ChangeFeed, FeedItem, FeedSubscription, NotificationPayload, Notifier,
    ProviderChange, WithdrawReason,
};
use rsd_storage::DispatchStore;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SearchConfig;
use crate::declines::DeclineTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPhase {
    Idle,
    Searching,
    ExpandingRadius,
    ProviderFound,
    WaitingCooldown,
    Timeout,
    Canceled,
    Matched,
}

impl SearchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::ExpandingRadius => "expanding_radius",
            Self::ProviderFound => "provider_found",
            Self::WaitingCooldown => "waiting_cooldown",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Matched => "matched",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Timeout | Self::Canceled | Self::Matched)
    }

    fn consumes_feed(self) -> bool {
        matches!(
            self,
            Self::Searching | Self::ExpandingRadius | Self::ProviderFound
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSnapshot {
    pub request_id: RequestId,
    pub phase: SearchPhase,
    pub radius_km: f64,
    pub radius_index: usize,
    pub candidates: Vec<Candidate>,
    pub cooldown_remaining_secs: Option<u64>,
}

/// What a session searches for.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTarget {
    pub request_id: RequestId,
    pub origin: GeoPoint,
    pub address: String,
    pub service_type: ServiceType,
}

impl From<&ServiceRequest> for SearchTarget {
    fn from(request: &ServiceRequest) -> Self {
        Self {
            request_id: request.id,
            origin: request.origin.point(),
            address: request.origin.address.clone(),
            service_type: request.service_type,
        }
    }
}

/// Collaborators every session borrows.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn DispatchStore>,
    pub notifier: Arc<dyn Notifier>,
    pub declines: Arc<DeclineTracker>,
    pub config: SearchConfig,
}

#[derive(Debug)]
enum Command {
    Decline(ProviderId),
    Cancel,
    Matched(ProviderId),
}

#[derive(Debug, Clone)]
pub struct SearchHandle {
    request_id: RequestId,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SearchSnapshot>,
}

impl SearchHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns `false` once the session has ended.
    pub fn decline(&self, provider_id: ProviderId) -> bool {
        self.commands.send(Command::Decline(provider_id)).is_ok()
    }

    /// Idempotent; a no-op after the session has ended.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    pub fn mark_matched(&self, provider_id: ProviderId) -> bool {
        self.commands.send(Command::Matched(provider_id)).is_ok()
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.snapshots.borrow().phase.is_terminal() || self.commands.is_closed()
    }

    /// Resolves with the terminal snapshot.
    pub async fn finished(&self) -> SearchSnapshot {
        let mut rx = self.snapshots.clone();
        let result = rx.wait_for(|s| s.phase.is_terminal()).await.map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Expand,
    Requery,
    Cooldown(ProviderId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timer {
    at: Instant,
    kind: TimerKind,
    phase: SearchPhase,
}

enum Event {
    Command(Option<Command>),
    Feed(Option<FeedItem>),
    Timer(Timer),
    Tick,
}

pub struct SearchSession {
    target: SearchTarget,
    ctx: SessionContext,
    feed: Option<FeedSubscription>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<SearchSnapshot>,
    phase: SearchPhase,
    radius_index: usize,
    candidates: HashMap<ProviderId, Candidate>,
    offered: HashSet<ProviderId>,
    timer: Option<Timer>,
    countdown: Option<Interval>,
    cooldown_deadline: Option<Instant>,
}

impl SearchSession {
    /// Starts the session on the current runtime. `feed` should be
    /// subscribed before this call so no change is missed between the first
    /// query and the first feed read.
    pub fn spawn(
        target: SearchTarget,
        ctx: SessionContext,
        feed: Option<FeedSubscription>,
    ) -> SearchHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let initial = SearchSnapshot {
            request_id: target.request_id,
            phase: SearchPhase::Idle,
            radius_km: ctx.config.radius_at(0),
            radius_index: 0,
            candidates: Vec::new(),
            cooldown_remaining_secs: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let request_id = target.request_id;
        let session = Self {
            target,
            ctx,
            feed,
            commands: command_rx,
            snapshots: snapshot_tx,
            phase: SearchPhase::Idle,
            radius_index: 0,
            candidates: HashMap::new(),
            offered: HashSet::new(),
            timer: None,
            countdown: None,
            cooldown_deadline: None,
        };
        let span = info_span!("search", %request_id);
        tokio::spawn(session.run().instrument(span));
        SearchHandle {
            request_id,
            commands: command_tx,
            snapshots: snapshot_rx,
        }
    }

    async fn run(mut self) {
        info!(service_type = %self.target.service_type, "search started");
        self.search_current_radius().await;
        while !self.phase.is_terminal() {
            self.publish();
            let event = self.next_event().await;
            self.handle(event).await;
        }
        // Must precede the terminal publish: a replacement session seeds the
        // tracker as soon as it observes it.
        self.ctx.declines.clear_request(self.target.request_id);
        self.publish();
        info!(phase = self.phase.as_str(), radius_km = self.radius_km(), "search ended");
    }

    async fn next_event(&mut self) -> Event {
        let timer = self.timer;
        tokio::select! {
            biased;
            command = self.commands.recv() => Event::Command(command),
            fired = wait_timer(timer) => Event::Timer(fired),
            item = next_feed_item(&mut self.feed) => Event::Feed(item),
            _ = next_tick(&mut self.countdown) => Event::Tick,
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Command(Some(Command::Decline(provider_id))) => self.on_decline(provider_id),
            Event::Command(Some(Command::Matched(provider_id))) => self.on_matched(provider_id),
            Event::Command(Some(Command::Cancel)) | Event::Command(None) => {
                self.terminate(SearchPhase::Canceled, WithdrawReason::Canceled);
            }
            Event::Feed(None) => {
                warn!("change feed closed; continuing without live provider updates");
                self.feed = None;
            }
            Event::Feed(Some(item)) => {
                if self.phase.consumes_feed() {
                    self.on_feed(item).await;
                }
            }
            Event::Timer(fired) => {
                if self.timer != Some(fired) || fired.phase != self.phase {
                    debug!(?fired.kind, "ignoring stale timer");
                    return;
                }
                self.timer = None;
                match fired.kind {
                    TimerKind::Expand => self.on_expand().await,
                    TimerKind::Requery => self.search_current_radius().await,
                    TimerKind::Cooldown(provider_id) => self.on_cooldown_elapsed(provider_id).await,
                }
            }
            Event::Tick => {}
        }
    }

    fn radius_km(&self) -> f64 {
        self.ctx.config.radius_at(self.radius_index)
    }

    fn candidate_query(&self, radius_index: usize, ignore_declines: bool) -> CandidateQuery {
        let exclude = if ignore_declines {
            HashSet::new()
        } else {
            self.ctx.declines.excluded_ids(self.target.request_id)
        };
        CandidateQuery {
            origin: self.target.origin,
            radius_km: self.ctx.config.radius_at(radius_index),
            service_type: self.target.service_type,
            exclude,
            now: Utc::now(),
            heartbeat_freshness: self.ctx.config.heartbeat_freshness(),
        }
    }

    async fn query(
        &self,
        radius_index: usize,
        ignore_declines: bool,
    ) -> anyhow::Result<Vec<Candidate>> {
        let query = self.candidate_query(radius_index, ignore_declines);
        let mut found = self.ctx.store.find_candidates(&query).await?;
        sort_candidates(&mut found);
        Ok(found)
    }

    async fn search_current_radius(&mut self) {
        self.phase = SearchPhase::Searching;
        self.publish();
        match self.query(self.radius_index, false).await {
            Ok(found) => {
                debug!(radius_km = self.radius_km(), found = found.len(), "queried candidates");
                self.replace_candidates(found);
                if !self.candidates.is_empty() {
                    self.phase = SearchPhase::ProviderFound;
                    self.timer = None;
                } else if self.radius_index >= self.ctx.config.max_radius_index() {
                    self.on_ladder_exhausted();
                } else {
                    self.schedule_expansion(self.ctx.config.expansion_interval());
                }
            }
            Err(err) => {
                warn!(error = %err, radius_km = self.radius_km(), "candidate query failed; retrying on next tick");
                self.phase = SearchPhase::ExpandingRadius;
                self.arm(TimerKind::Requery, self.ctx.config.expansion_interval());
            }
        }
    }

    fn schedule_expansion(&mut self, delay: Duration) {
        self.phase = SearchPhase::ExpandingRadius;
        self.arm(TimerKind::Expand, delay);
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.timer = Some(Timer {
            at: Instant::now() + delay,
            kind,
            phase: self.phase,
        });
    }

    async fn on_expand(&mut self) {
        if self.radius_index >= self.ctx.config.max_radius_index() {
            self.on_ladder_exhausted();
            return;
        }
        self.radius_index += 1;
        info!(radius_km = self.radius_km(), "expanding search radius");
        self.search_current_radius().await;
    }

    fn on_ladder_exhausted(&mut self) {
        self.candidates.clear();
        match self.ctx.declines.oldest(self.target.request_id) {
            None => self.terminate(SearchPhase::Timeout, WithdrawReason::Timeout),
            Some((provider_id, declined_at)) => {
                let deadline = declined_at + self.ctx.declines.cooldown();
                self.phase = SearchPhase::WaitingCooldown;
                self.timer = Some(Timer {
                    at: deadline,
                    kind: TimerKind::Cooldown(provider_id),
                    phase: SearchPhase::WaitingCooldown,
                });
                self.cooldown_deadline = Some(deadline);
                let tick = self.ctx.config.countdown_tick();
                let mut countdown = interval_at(Instant::now() + tick, tick);
                countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.countdown = Some(countdown);
                info!(%provider_id, "radius ladder exhausted; waiting for decline cooldown");
            }
        }
    }

    async fn on_cooldown_elapsed(&mut self, provider_id: ProviderId) {
        self.countdown = None;
        self.cooldown_deadline = None;
        self.ctx
            .declines
            .clear_for_retry(self.target.request_id, provider_id);

        let max_index = self.ctx.config.max_radius_index();
        match self.query(max_index, true).await {
            Ok(found) => {
                if let Some(candidate) = found.into_iter().find(|c| c.provider_id == provider_id) {
                    info!(%provider_id, "re-offering after cooldown");
                    self.radius_index = max_index;
                    self.phase = SearchPhase::ProviderFound;
                    self.add_candidate(candidate);
                    return;
                }
                debug!(%provider_id, "declined provider no longer eligible");
            }
            Err(err) => {
                warn!(error = %err, %provider_id, "cooldown re-query failed");
            }
        }
        self.on_ladder_exhausted();
    }

    fn on_decline(&mut self, provider_id: ProviderId) {
        if self.phase.is_terminal() {
            return;
        }
        self.ctx
            .declines
            .record_decline(self.target.request_id, provider_id, Instant::now());
        self.offered.remove(&provider_id);
        self.candidates.remove(&provider_id);
        info!(%provider_id, remaining = self.candidates.len(), "provider declined");
        if self.phase == SearchPhase::ProviderFound && self.candidates.is_empty() {
            self.schedule_expansion(self.ctx.config.decline_expansion());
        }
    }

    fn on_matched(&mut self, provider_id: ProviderId) {
        let others: Vec<_> = self
            .offered
            .iter()
            .copied()
            .filter(|id| *id != provider_id)
            .collect();
        for other in others {
            self.withdraw(other, WithdrawReason::Assigned);
        }
        self.offered.clear();
        self.candidates.clear();
        self.stop_timers();
        self.phase = SearchPhase::Matched;
        info!(%provider_id, "search matched");
    }

    fn terminate(&mut self, phase: SearchPhase, reason: WithdrawReason) {
        let offered: Vec<_> = self.offered.drain().collect();
        for provider_id in offered {
            self.withdraw(provider_id, reason);
        }
        self.candidates.clear();
        self.stop_timers();
        self.phase = phase;
    }

    fn stop_timers(&mut self) {
        self.timer = None;
        self.countdown = None;
        self.cooldown_deadline = None;
    }

    async fn on_feed(&mut self, item: FeedItem) {
        match item {
            FeedItem::Change(ProviderChange::Upsert(provider)) => {
                let query = self.candidate_query(self.radius_index, false);
                match query.evaluate(&provider) {
                    Some(candidate) => self.add_candidate(candidate),
                    None => self.remove_candidate(provider.id),
                }
            }
            FeedItem::Change(ProviderChange::Delete(provider_id)) => {
                self.remove_candidate(provider_id);
            }
            FeedItem::Lagged(skipped) => {
                warn!(skipped, "change feed lagged; re-querying candidates");
                match self.query(self.radius_index, false).await {
                    Ok(found) => {
                        self.replace_candidates(found);
                        if !self.candidates.is_empty() {
                            self.phase = SearchPhase::ProviderFound;
                            self.timer = None;
                        } else if self.phase == SearchPhase::ProviderFound {
                            self.schedule_expansion(self.ctx.config.expansion_interval());
                        }
                    }
                    Err(err) => warn!(error = %err, "re-query after lag failed"),
                }
            }
        }
    }

    fn add_candidate(&mut self, candidate: Candidate) {
        self.candidates.insert(candidate.provider_id, candidate);
        self.offer(&candidate);
        if self.phase != SearchPhase::ProviderFound {
            self.phase = SearchPhase::ProviderFound;
            self.timer = None;
        }
    }

    fn remove_candidate(&mut self, provider_id: ProviderId) {
        if self.candidates.remove(&provider_id).is_none() {
            return;
        }
        if self.offered.remove(&provider_id) {
            self.withdraw(provider_id, WithdrawReason::Unavailable);
        }
        if self.candidates.is_empty() && self.phase == SearchPhase::ProviderFound {
            self.schedule_expansion(self.ctx.config.expansion_interval());
        }
    }

    fn replace_candidates(&mut self, found: Vec<Candidate>) {
        let next: HashMap<_, _> = found.into_iter().map(|c| (c.provider_id, c)).collect();
        let gone: Vec<_> = self
            .offered
            .iter()
            .copied()
            .filter(|id| !next.contains_key(id))
            .collect();
        for provider_id in gone {
            self.offered.remove(&provider_id);
            self.withdraw(provider_id, WithdrawReason::Unavailable);
        }
        for candidate in next.values() {
            self.offer(candidate);
        }
        self.candidates = next;
    }

    fn offer(&mut self, candidate: &Candidate) {
        if !self.offered.insert(candidate.provider_id) {
            return;
        }
        let payload = NotificationPayload::RequestOffered {
            request_id: self.target.request_id,
            service_type: self.target.service_type,
            origin_lat: self.target.origin.lat,
            origin_lng: self.target.origin.lng,
            address: self.target.address.clone(),
            distance_km: candidate.distance_km,
            radius_km: self.radius_km(),
        };
        notify_detached(
            self.ctx.notifier.clone(),
            candidate.provider_id,
            self.target.request_id,
            payload,
        );
    }

    fn withdraw(&self, provider_id: ProviderId, reason: WithdrawReason) {
        let payload = NotificationPayload::OfferWithdrawn {
            request_id: self.target.request_id,
            reason,
        };
        notify_detached(
            self.ctx.notifier.clone(),
            provider_id,
            self.target.request_id,
            payload,
        );
    }

    fn snapshot(&self) -> SearchSnapshot {
        let mut candidates: Vec<_> = self.candidates.values().copied().collect();
        sort_candidates(&mut candidates);
        let cooldown_remaining_secs = self.cooldown_deadline.map(|deadline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            u64::try_from(remaining.as_millis().div_ceil(1000)).unwrap_or(u64::MAX)
        });
        SearchSnapshot {
            request_id: self.target.request_id,
            phase: self.phase,
            radius_km: self.radius_km(),
            radius_index: self.radius_index,
            candidates,
            cooldown_remaining_secs,
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

async fn wait_timer(timer: Option<Timer>) -> Timer {
    match timer {
        Some(timer) => {
            sleep_until(timer.at).await;
            timer
        }
        None => pending().await,
    }
}

async fn next_feed_item(feed: &mut Option<FeedSubscription>) -> Option<FeedItem> {
    match feed {
        Some(subscription) => subscription.recv().await,
        None => pending().await,
    }
}

async fn next_tick(countdown: &mut Option<Interval>) {
    match countdown {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// Registry of live search sessions, one per request.
pub struct Dispatcher {
    ctx: SessionContext,
    feed: Arc<dyn ChangeFeed>,
    sessions: Mutex<HashMap<RequestId, SearchHandle>>,
}

impl Dispatcher {
    pub fn new(ctx: SessionContext, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            ctx,
            feed,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.ctx.config
    }

    pub fn declines(&self) -> &DeclineTracker {
        &self.ctx.declines
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, SearchHandle>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn start(&self, target: SearchTarget) -> SearchHandle {
        self.start_with_declines(target, &[]).await
    }

    /// Starts a fresh session, replacing any previous one for the request.
    /// `declined` seeds the tracker before the first query runs.
    pub async fn start_with_declines(
        &self,
        target: SearchTarget,
        declined: &[ProviderId],
    ) -> SearchHandle {
        let request_id = target.request_id;
        let previous = self.lock().remove(&request_id);
        if let Some(previous) = previous {
            previous.cancel();
            previous.finished().await;
        }

        let now = Instant::now();
        for provider_id in declined {
            self.ctx.declines.record_decline(request_id, *provider_id, now);
        }

        let subscription = match self.feed.subscribe().await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(%request_id, error = %err, "change feed unavailable; searching without live updates");
                None
            }
        };
        let handle = SearchSession::spawn(target, self.ctx.clone(), subscription);
        let mut sessions = self.lock();
        sessions.retain(|_, existing| !existing.is_finished());
        sessions.insert(request_id, handle.clone());
        handle
    }

    /// Whether `provider` may take `target` right now: eligible at the live
    /// session's radius (the widest rung once no session runs) and not in the
    /// request's decline set.
    pub fn admits(&self, target: &SearchTarget, provider: &Provider) -> bool {
        let config = &self.ctx.config;
        let radius_km = self
            .snapshot(target.request_id)
            .map(|s| s.radius_km)
            .unwrap_or_else(|| config.radius_at(config.max_radius_index()));
        let query = CandidateQuery {
            origin: target.origin,
            radius_km,
            service_type: target.service_type,
            exclude: self.ctx.declines.excluded_ids(target.request_id),
            now: Utc::now(),
            heartbeat_freshness: config.heartbeat_freshness(),
        };
        query.evaluate(provider).is_some()
    }

    pub fn handle(&self, request_id: RequestId) -> Option<SearchHandle> {
        self.lock().get(&request_id).cloned()
    }

    pub fn snapshot(&self, request_id: RequestId) -> Option<SearchSnapshot> {
        self.handle(request_id).map(|h| h.snapshot())
    }

    /// Records the decline right away so the provider is excluded before the
    /// session gets to the command.
    pub fn decline(&self, request_id: RequestId, provider_id: ProviderId) -> bool {
        match self.handle(request_id) {
            Some(handle) if !handle.is_finished() => {
                self.ctx
                    .declines
                    .record_decline(request_id, provider_id, Instant::now());
                let sent = handle.decline(provider_id);
                if !sent {
                    self.ctx.declines.clear_for_retry(request_id, provider_id);
                }
                sent
            }
            _ => false,
        }
    }

    pub fn mark_matched(&self, request_id: RequestId, provider_id: ProviderId) {
        if let Some(handle) = self.lock().remove(&request_id) {
            handle.mark_matched(provider_id);
        }
    }

    pub fn stop(&self, request_id: RequestId) {
        if let Some(handle) = self.lock().remove(&request_id) {
            handle.cancel();
        }
    }

    /// Number of sessions still running; finished ones are dropped.
    pub fn active_count(&self) -> usize {
        let mut sessions = self.lock();
        sessions.retain(|_, handle| !handle.is_finished());
        sessions.len()
    }

    pub fn shutdown(&self) {
        for (_, handle) in self.lock().drain() {
            handle.cancel();
        }
    }
}
