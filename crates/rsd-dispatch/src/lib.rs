//! Dispatch orchestration: live proximity search, the request lifecycle
//! service, settlement and the auto-finish sweep.

pub mod config;
pub mod declines;
pub mod error;
pub mod search;
pub mod service;
pub mod settlement;
pub mod sweep;

use std::sync::Arc;

use anyhow::{Context, Result};
use rsd_feed::{
    ChangeFeed, HttpNotifier, InMemoryChangeFeed, LogNotifier, Notifier, NotifierConfig,
    PgChangeFeed,
};
use rsd_storage::{MemoryStore, PgStore};
use tracing::info;

pub use config::{DispatchConfig, SearchConfig};
pub use declines::DeclineTracker;
pub use error::{DispatchError, ErrorClass};
pub use search::{
    Dispatcher, SearchHandle, SearchPhase, SearchSession, SearchSnapshot, SearchTarget,
    SessionContext,
};
pub use service::{AcceptOutcome, CompletionOutcome, DispatchService};
pub use settlement::{settle_request, SettlementOutcome};
pub use sweep::{maybe_build_scheduler, AutoFinishSweep, SweepReport};

pub const CRATE_NAME: &str = "rsd-dispatch";

/// Builds the service from configuration: Postgres with its change feed when
/// `DATABASE_URL` is set, otherwise the in-memory store.
pub async fn build_service(config: &DispatchConfig) -> Result<DispatchService> {
    let search = config.search_config()?;
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            let mut notifier_config = NotifierConfig::new(url.clone());
            notifier_config.timeout = std::time::Duration::from_secs(config.http_timeout_secs);
            Arc::new(HttpNotifier::new(notifier_config)?)
        }
        None => Arc::new(LogNotifier),
    };

    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting dispatch store")?;
            let feed: Arc<dyn ChangeFeed> = Arc::new(PgChangeFeed::start(store.pool()).await?);
            info!("using postgres store");
            Ok(DispatchService::new(
                Arc::new(store),
                feed,
                notifier,
                search,
                config.global_fee_percent,
            ))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Ok(DispatchService::in_memory(
                Arc::new(MemoryStore::new()),
                InMemoryChangeFeed::new(),
                notifier,
                search,
                config.global_fee_percent,
            ))
        }
    }
}
