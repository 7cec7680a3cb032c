//! External boundaries of the dispatcher: the provider change feed and the
//! outbound notification channel.
//!
//! Both carry JSON across process boundaries, so every payload is an explicit
//! tagged record that is validated on decode.

pub mod change;
pub mod notify;

pub use change::{
    decode_change, encode_change, ChangeFeed, FeedError, FeedItem, FeedSubscription,
    InMemoryChangeFeed, PgChangeFeed, ProviderChange, ProviderRecord, PROVIDER_CHANNEL,
};
pub use notify::{
    notify_detached, HttpNotifier, LogNotifier, NotificationPayload, Notifier, NotifierConfig,
    NotifyError, RetryDisposition, WithdrawReason,
};

pub const CRATE_NAME: &str = "rsd-feed";
