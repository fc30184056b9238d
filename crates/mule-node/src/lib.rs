//! Mule node-layer bundle store and routing.
//!
//! This crate wires together the queue store, TTL reaper, cache budgets,
//! the web-of-trust store, forwarding decisions and the contact sync
//! protocol behind the [`BundleLayer`] facade.

pub mod budget;
pub mod config;
pub mod forwarding;
pub mod persistence;
pub mod queue;
pub mod reaper;
pub mod receive;
pub mod runtime;
pub mod service;
pub mod subscriptions;
pub mod sync;
pub mod trust;

pub use budget::{BatteryProfile, CacheStats, PowerMode};
pub use config::{BundleLayerConfig, ConfigError, LocalScope, NodeRole};
pub use forwarding::{PeerContact, SkipReason};
pub use persistence::{NodeSnapshot, PersistenceError};
pub use queue::{BundleFilter, ExpiryReason, QueueName, QueueStats, StoredBundle};
pub use reaper::ReapReport;
pub use receive::{DropReason, ReceiveOutcome};
pub use runtime::{spawn_background, BackgroundTasks, RuntimeStats};
pub use service::{BundleLayer, LayerParams, SubmitError, SubmitRequest, SyncReport};
pub use subscriptions::{Subscription, SubscriptionFilter};
pub use sync::SyncError;
pub use trust::{RevokeOutcome, TrustConfig, TrustError, TrustExplanation};
