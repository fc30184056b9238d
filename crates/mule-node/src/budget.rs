use std::cmp::Reverse;
use std::time::Duration;

use mule_core::clock::HOUR;
use mule_core::{BundleId, Priority, UnixSeconds};
use serde::{Deserialize, Serialize};

use crate::config::BundleLayerConfig;
use crate::queue::QueueName;

/// Battery level (percent) below which the node drops to emergency-only.
pub const LOW_BATTERY_PERCENT: u8 = 20;
/// Battery level (percent) below which the node stops transmitting.
pub const CRITICAL_BATTERY_PERCENT: u8 = 10;

/// Operator-chosen energy posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryProfile {
    Aggressive,
    #[default]
    Balanced,
    Conservative,
}

impl BatteryProfile {
    fn poll_multiplier(self) -> u32 {
        match self {
            BatteryProfile::Aggressive => 1,
            BatteryProfile::Balanced => 2,
            BatteryProfile::Conservative => 4,
        }
    }
}

/// Power mode derived from the current battery level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerMode {
    Normal,
    /// Emergency-only forwarding, no speculative caching, slower polling.
    Low,
    /// No outbound transmission attempts.
    ReceiveOnly,
}

impl PowerMode {
    pub fn from_battery(level_percent: u8) -> Self {
        if level_percent < CRITICAL_BATTERY_PERCENT {
            PowerMode::ReceiveOnly
        } else if level_percent < LOW_BATTERY_PERCENT {
            PowerMode::Low
        } else {
            PowerMode::Normal
        }
    }

    pub fn may_transmit(self, priority: Priority) -> bool {
        match self {
            PowerMode::Normal => true,
            PowerMode::Low => priority == Priority::Emergency,
            PowerMode::ReceiveOnly => false,
        }
    }
}

/// Bandwidth, battery and storage-limit bookkeeping for one node.
///
/// Storage usage itself is owned by the queue store; this type only holds
/// the limits applied to it.
#[derive(Debug, Clone)]
pub struct CacheBudget {
    storage_budget_bytes: u64,
    storage_high_water_ratio: f64,
    bandwidth_budget_bytes_per_hour: u64,
    bandwidth_defer_ratio: f64,
    bandwidth_window: u64,
    bandwidth_sent: u64,
    bandwidth_received: u64,
    battery_profile: BatteryProfile,
    battery_level: u8,
}

/// Point-in-time cache account, as reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub storage_used_bytes: u64,
    pub storage_budget_bytes: u64,
    pub bandwidth_used_bytes_this_hour: u64,
    pub bandwidth_received_bytes_this_hour: u64,
    pub bandwidth_budget_bytes_per_hour: u64,
    pub battery_profile: BatteryProfile,
    pub battery_level: u8,
    pub power_mode: PowerMode,
}

impl CacheBudget {
    pub fn new(config: &BundleLayerConfig) -> Self {
        Self {
            storage_budget_bytes: config.storage_budget_bytes,
            storage_high_water_ratio: config.storage_high_water_ratio,
            bandwidth_budget_bytes_per_hour: config.bandwidth_budget_bytes_per_hour,
            bandwidth_defer_ratio: config.bandwidth_defer_ratio,
            bandwidth_window: 0,
            bandwidth_sent: 0,
            bandwidth_received: 0,
            battery_profile: config.battery_profile,
            battery_level: 100,
        }
    }

    pub fn storage_limits(&self) -> StorageLimits {
        StorageLimits {
            budget_bytes: self.storage_budget_bytes,
            high_water_bytes: (self.storage_budget_bytes as f64 * self.storage_high_water_ratio)
                as u64,
        }
    }

    pub fn set_battery_level(&mut self, level_percent: u8) {
        self.battery_level = level_percent.min(100);
    }

    pub fn set_battery_profile(&mut self, profile: BatteryProfile) {
        self.battery_profile = profile;
    }

    pub fn power_mode(&self) -> PowerMode {
        PowerMode::from_battery(self.battery_level)
    }

    /// Whether role-driven speculative caching is currently allowed.
    pub fn allows_speculative_caching(&self) -> bool {
        self.battery_profile != BatteryProfile::Conservative
            && self.power_mode() == PowerMode::Normal
    }

    /// Scales the base poll period by profile and power mode.
    pub fn poll_interval(&self, base: Duration) -> Duration {
        let mut factor = self.battery_profile.poll_multiplier();
        if self.power_mode() != PowerMode::Normal {
            factor *= 2;
        }
        base * factor
    }

    fn window_of(now: UnixSeconds) -> u64 {
        now / HOUR
    }

    fn roll(&mut self, now: UnixSeconds) {
        let window = Self::window_of(now);
        if window != self.bandwidth_window {
            self.bandwidth_window = window;
            self.bandwidth_sent = 0;
            self.bandwidth_received = 0;
        }
    }

    /// Bytes sent in the hour containing `now`.
    pub fn bandwidth_used(&self, now: UnixSeconds) -> u64 {
        if Self::window_of(now) == self.bandwidth_window {
            self.bandwidth_sent
        } else {
            0
        }
    }

    /// True when forwarding `priority` should wait for the next window.
    pub fn should_defer(&self, priority: Priority, now: UnixSeconds) -> bool {
        self.should_defer_after(priority, now, 0)
    }

    /// Like [`Self::should_defer`], counting `planned_bytes` not yet sent
    /// in this window.
    pub fn should_defer_after(
        &self,
        priority: Priority,
        now: UnixSeconds,
        planned_bytes: u64,
    ) -> bool {
        if priority.ignores_bandwidth_budget() {
            return false;
        }
        let threshold =
            (self.bandwidth_budget_bytes_per_hour as f64 * self.bandwidth_defer_ratio) as u64;
        self.bandwidth_used(now).saturating_add(planned_bytes) >= threshold
    }

    /// Records bytes of completed outbound transfers.
    pub fn record_sent(&mut self, bytes: u64, now: UnixSeconds) {
        self.roll(now);
        self.bandwidth_sent = self.bandwidth_sent.saturating_add(bytes);
    }

    /// Records bytes of completed inbound transfers.
    pub fn record_received(&mut self, bytes: u64, now: UnixSeconds) {
        self.roll(now);
        self.bandwidth_received = self.bandwidth_received.saturating_add(bytes);
    }

    pub fn stats(&self, storage_used_bytes: u64, now: UnixSeconds) -> CacheStats {
        let current = Self::window_of(now) == self.bandwidth_window;
        CacheStats {
            storage_used_bytes,
            storage_budget_bytes: self.storage_budget_bytes,
            bandwidth_used_bytes_this_hour: if current { self.bandwidth_sent } else { 0 },
            bandwidth_received_bytes_this_hour: if current {
                self.bandwidth_received
            } else {
                0
            },
            bandwidth_budget_bytes_per_hour: self.bandwidth_budget_bytes_per_hour,
            battery_profile: self.battery_profile,
            battery_level: self.battery_level,
            power_mode: self.power_mode(),
        }
    }
}

/// Storage ceilings handed to the queue store for admission and reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLimits {
    pub budget_bytes: u64,
    /// Reconcile evicts while usage is at or above this mark.
    pub high_water_bytes: u64,
}

/// Minimal view of a stored bundle used to choose eviction victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub bundle_id: BundleId,
    pub queue: QueueName,
    pub priority: Priority,
    pub speculative: bool,
    pub hops_remaining: u8,
    pub created_at: UnixSeconds,
    pub size_bytes: u64,
}

impl EvictionCandidate {
    /// Whether evicting this entry loses a live emergency bundle.
    fn is_live_emergency(&self) -> bool {
        self.priority == Priority::Emergency && !self.queue.is_terminal()
    }

    /// Held only for audit; any admission may reclaim it.
    fn is_reclaimable(&self) -> bool {
        matches!(self.queue, QueueName::Expired | QueueName::Quarantine)
    }

    fn class(&self) -> u8 {
        match self.queue {
            QueueName::Expired => 0,
            QueueName::Quarantine => 1,
            _ if self.is_live_emergency() => 4,
            _ if self.speculative => 2,
            _ => 3,
        }
    }
}

/// Sorts candidates so the first element is the next victim.
///
/// Order: expired, quarantined, speculative, then lowest priority, nearest
/// hop limit, oldest. Live emergency bundles always sort last.
pub fn sort_eviction_order(candidates: &mut [EvictionCandidate]) {
    candidates.sort_by_key(|c| {
        (
            c.class(),
            Reverse(c.priority),
            c.hops_remaining,
            c.created_at,
            c.bundle_id,
        )
    });
}

/// Outcome of planning an admission against the storage budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionPlan {
    /// Admit after evicting these bundles, in order.
    Admit { evict: Vec<BundleId> },
    /// Non-emergency bundle does not fit.
    Reject { used: u64, budget: u64 },
}

/// Plans admission of `incoming_size` bytes of `priority` into a store
/// holding `candidates` (`used` bytes in total).
pub fn plan_admission(
    mut candidates: Vec<EvictionCandidate>,
    used: u64,
    incoming_size: u64,
    priority: Priority,
    limits: StorageLimits,
) -> AdmissionPlan {
    let fits = |used: u64| used.saturating_add(incoming_size) <= limits.budget_bytes;
    if fits(used) {
        return AdmissionPlan::Admit { evict: Vec::new() };
    }

    // Non-emergency bundles may only displace expired and quarantined
    // entries, which sort ahead of everything else.
    let emergency = priority == Priority::Emergency;
    sort_eviction_order(&mut candidates);
    let mut evict = Vec::new();
    let mut remaining = used;
    for victim in candidates {
        if fits(remaining) || (!emergency && !victim.is_reclaimable()) {
            break;
        }
        remaining = remaining.saturating_sub(victim.size_bytes);
        evict.push(victim.bundle_id);
    }
    if !emergency && !fits(remaining) {
        return AdmissionPlan::Reject {
            used,
            budget: limits.budget_bytes,
        };
    }
    AdmissionPlan::Admit { evict }
}

/// Picks victims until usage falls below the high-water mark.
pub fn plan_reconcile(
    mut candidates: Vec<EvictionCandidate>,
    used: u64,
    limits: StorageLimits,
) -> Vec<BundleId> {
    if used < limits.high_water_bytes {
        return Vec::new();
    }
    sort_eviction_order(&mut candidates);
    let non_emergency_left = candidates.iter().filter(|c| !c.is_live_emergency()).count();
    let mut evict = Vec::new();
    let mut remaining = used;
    for victim in candidates.into_iter().take(non_emergency_left) {
        if remaining < limits.high_water_bytes {
            break;
        }
        remaining = remaining.saturating_sub(victim.size_bytes);
        evict.push(victim.bundle_id);
    }
    evict
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        plan_admission, plan_reconcile, sort_eviction_order, AdmissionPlan, BatteryProfile,
        CacheBudget, EvictionCandidate, PowerMode, StorageLimits,
    };
    use crate::config::BundleLayerConfig;
    use crate::queue::QueueName;
    use mule_core::clock::HOUR;
    use mule_core::{BundleId, Priority};

    fn cand(n: u8, queue: QueueName, priority: Priority, created_at: u64) -> EvictionCandidate {
        EvictionCandidate {
            bundle_id: BundleId([n; 32]),
            queue,
            priority,
            speculative: false,
            hops_remaining: 10,
            created_at,
            size_bytes: 1,
        }
    }

    fn limits(budget: u64) -> StorageLimits {
        StorageLimits {
            budget_bytes: budget,
            high_water_bytes: budget * 95 / 100,
        }
    }

    #[test]
    fn eviction_order_is_expired_then_low_and_never_emergency_first() {
        let mut c = vec![
            cand(1, QueueName::Pending, Priority::Emergency, 1),
            cand(2, QueueName::Inbox, Priority::Low, 5),
            cand(3, QueueName::Expired, Priority::Normal, 9),
        ];
        sort_eviction_order(&mut c);
        let ids: Vec<u8> = c.iter().map(|c| c.bundle_id.0[0]).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn speculative_goes_before_subscribed_and_hops_then_age_break_ties() {
        let mut speculative_entry = cand(1, QueueName::Inbox, Priority::Perishable, 9);
        speculative_entry.speculative = true;
        let mut near_limit = cand(2, QueueName::Pending, Priority::Normal, 9);
        near_limit.hops_remaining = 1;
        let old = cand(3, QueueName::Pending, Priority::Normal, 1);
        let young = cand(4, QueueName::Pending, Priority::Normal, 5);
        let mut c = vec![young, old, near_limit, speculative_entry];
        sort_eviction_order(&mut c);
        let ids: Vec<u8> = c.iter().map(|c| c.bundle_id.0[0]).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn speculative_emergency_still_outlives_subscribed_low() {
        let mut speculative_entry = cand(1, QueueName::Inbox, Priority::Emergency, 1);
        speculative_entry.speculative = true;
        let mut c = vec![speculative_entry, cand(2, QueueName::Inbox, Priority::Low, 9)];
        sort_eviction_order(&mut c);
        assert_eq!(c[0].bundle_id, BundleId([2; 32]));
    }

    #[test]
    fn full_cache_rejects_normal_and_evicts_oldest_low_for_emergency() {
        let mut stored = Vec::new();
        for n in 0..96_u8 {
            let priority = if n < 4 { Priority::Low } else { Priority::Normal };
            stored.push(cand(n, QueueName::Pending, priority, 100 + u64::from(n)));
        }

        assert_eq!(
            plan_admission(stored.clone(), 96, 5, Priority::Normal, limits(100)),
            AdmissionPlan::Reject {
                used: 96,
                budget: 100
            }
        );
        assert_eq!(
            plan_admission(stored, 96, 5, Priority::Emergency, limits(100)),
            AdmissionPlan::Admit {
                evict: vec![BundleId([0; 32])]
            }
        );
    }

    #[test]
    fn normal_admission_reclaims_audit_entries_but_nothing_live() {
        let mut stored = vec![
            cand(1, QueueName::Expired, Priority::Normal, 1),
            cand(2, QueueName::Quarantine, Priority::Low, 2),
        ];
        for n in 10..106_u8 {
            stored.push(cand(n, QueueName::Pending, Priority::Low, u64::from(n)));
        }

        assert_eq!(
            plan_admission(stored.clone(), 98, 4, Priority::Normal, limits(100)),
            AdmissionPlan::Admit {
                evict: vec![BundleId([1; 32]), BundleId([2; 32])]
            }
        );
        assert_eq!(
            plan_admission(stored, 98, 5, Priority::Normal, limits(100)),
            AdmissionPlan::Reject {
                used: 98,
                budget: 100
            }
        );
    }

    #[test]
    fn admission_within_budget_evicts_nothing() {
        assert_eq!(
            plan_admission(Vec::new(), 10, 5, Priority::Low, limits(100)),
            AdmissionPlan::Admit { evict: Vec::new() }
        );
    }

    #[test]
    fn reconcile_drains_below_high_water_and_spares_emergency() {
        let mut stored = vec![cand(9, QueueName::Pending, Priority::Emergency, 1)];
        for n in 0..97_u8 {
            stored.push(cand(n, QueueName::Inbox, Priority::Normal, u64::from(n)));
        }
        let evicted = plan_reconcile(stored, 98, limits(100));
        assert_eq!(evicted.len(), 4);
        assert!(!evicted.contains(&BundleId([9; 32])));

        let only_emergency = vec![cand(9, QueueName::Pending, Priority::Emergency, 1)];
        assert!(plan_reconcile(only_emergency, 99, limits(1)).is_empty());
    }

    #[test]
    fn bandwidth_defers_normal_but_never_emergency_or_perishable() {
        let cfg = BundleLayerConfig {
            bandwidth_budget_bytes_per_hour: 1_000,
            ..BundleLayerConfig::default()
        };
        let mut budget = CacheBudget::new(&cfg);
        let now = 10 * HOUR;
        budget.record_sent(900, now);
        assert!(budget.should_defer(Priority::Normal, now));
        assert!(budget.should_defer(Priority::Low, now));
        assert!(!budget.should_defer(Priority::Emergency, now));
        assert!(!budget.should_defer(Priority::Perishable, now));
        assert!(!budget.should_defer(Priority::Normal, now + HOUR));
        assert_eq!(budget.stats(0, now + HOUR).bandwidth_used_bytes_this_hour, 0);
    }

    #[test]
    fn battery_thresholds_gate_transmission_and_speculation() {
        let mut budget = CacheBudget::new(&BundleLayerConfig::default());
        assert_eq!(budget.power_mode(), PowerMode::Normal);
        assert!(budget.allows_speculative_caching());

        budget.set_battery_level(19);
        assert_eq!(budget.power_mode(), PowerMode::Low);
        assert!(!budget.allows_speculative_caching());
        assert!(budget.power_mode().may_transmit(Priority::Emergency));
        assert!(!budget.power_mode().may_transmit(Priority::Perishable));

        budget.set_battery_level(9);
        assert!(!budget.power_mode().may_transmit(Priority::Emergency));
    }

    #[test]
    fn poll_interval_scales_with_profile_and_power() {
        let mut budget = CacheBudget::new(&BundleLayerConfig::default());
        let base = Duration::from_secs(10);
        assert_eq!(budget.poll_interval(base), Duration::from_secs(20));
        budget.set_battery_profile(BatteryProfile::Aggressive);
        assert_eq!(budget.poll_interval(base), Duration::from_secs(10));
        budget.set_battery_level(15);
        assert_eq!(budget.poll_interval(base), Duration::from_secs(20));
        budget.set_battery_profile(BatteryProfile::Conservative);
        assert!(!budget.allows_speculative_caching());
    }
}
