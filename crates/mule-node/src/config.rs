use std::time::Duration;

use mule_codec::{TtlTable, DEFAULT_HOP_LIMIT};
use mule_core::clock::DAY;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::BatteryProfile;
use crate::trust::TrustConfig;

/// Role-derived speculative caching behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Keeps only what it is subscribed to or addressed by.
    #[default]
    Client,
    /// Caches every emergency bundle and pushes it to every peer.
    Bridge,
    /// Caches every knowledge bundle and answers queries over it.
    Library,
}

/// How the `local` audience boundary is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LocalScope {
    /// Peers at most `radius` mesh hops away.
    HopRadius { radius: u8 },
    /// Peers attached to the same access point as this node.
    SameAccessPoint,
}

impl Default for LocalScope {
    fn default() -> Self {
        LocalScope::HopRadius { radius: 2 }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Tunables consumed by the bundle layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleLayerConfig {
    pub role: NodeRole,
    pub storage_budget_bytes: u64,
    /// Eviction starts once usage reaches this share of the storage budget.
    pub storage_high_water_ratio: f64,
    pub bandwidth_budget_bytes_per_hour: u64,
    /// Normal/low forwarding is deferred above this share of the hourly budget.
    pub bandwidth_defer_ratio: f64,
    pub battery_profile: BatteryProfile,
    pub ttl: TtlTable,
    pub hop_limit_default: u8,
    pub trust: TrustConfig,
    /// Minimum peer trust for `trusted` audience bundles.
    pub trusted_audience_threshold: f64,
    pub local_scope: LocalScope,
    #[serde(with = "humantime_serde")]
    pub audit_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub reaper_period: Duration,
    #[serde(with = "humantime_serde")]
    pub reconcile_period: Duration,
    /// Base drain/sync poll period before battery scaling.
    #[serde(with = "humantime_serde")]
    pub forward_period: Duration,
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
    /// Most bundles offered to one peer per contact.
    pub max_offer_per_contact: usize,
}

impl Default for BundleLayerConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Client,
            storage_budget_bytes: 64 * 1024 * 1024,
            storage_high_water_ratio: 0.95,
            bandwidth_budget_bytes_per_hour: 16 * 1024 * 1024,
            bandwidth_defer_ratio: 0.90,
            battery_profile: BatteryProfile::Balanced,
            ttl: TtlTable::default(),
            hop_limit_default: DEFAULT_HOP_LIMIT,
            trust: TrustConfig::default(),
            trusted_audience_threshold: 0.6,
            local_scope: LocalScope::default(),
            audit_retention: Duration::from_secs(7 * DAY),
            reaper_period: Duration::from_secs(60),
            reconcile_period: Duration::from_secs(30),
            forward_period: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(30),
            max_offer_per_contact: 512,
        }
    }
}

impl BundleLayerConfig {
    /// Checks cross-field constraints and pins the TTL table into range.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.storage_budget_bytes == 0 {
            return Err(ConfigError::Invalid("storage budget must be positive"));
        }
        if !(0.0..=1.0).contains(&self.storage_high_water_ratio)
            || self.storage_high_water_ratio == 0.0
        {
            return Err(ConfigError::Invalid("storage high-water ratio must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.bandwidth_defer_ratio) {
            return Err(ConfigError::Invalid("bandwidth defer ratio must be in [0, 1]"));
        }
        if self.hop_limit_default == 0 {
            return Err(ConfigError::Invalid("hop limit default must be positive"));
        }
        if !(0.0..1.0).contains(&self.trust.decay) || self.trust.decay == 0.0 {
            return Err(ConfigError::Invalid("trust decay must be in (0, 1)"));
        }
        if self.trust.revocation_quorum == 0 {
            return Err(ConfigError::Invalid("revocation quorum must be positive"));
        }
        if self.sync_timeout.is_zero() {
            return Err(ConfigError::Invalid("sync timeout must be positive"));
        }
        self.ttl = self.ttl.clamped();
        Ok(self)
    }

    pub fn audit_retention_secs(&self) -> u64 {
        self.audit_retention.as_secs()
    }
}
