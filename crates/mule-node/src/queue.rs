use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mule_codec::Bundle;
use mule_core::{BundleId, NodeId, Priority, UnixSeconds};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{
    plan_admission, plan_reconcile, AdmissionPlan, EvictionCandidate, StorageLimits,
};

/// Lifecycle state of a stored bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Inbox,
    Outbox,
    Pending,
    Delivered,
    Expired,
    Quarantine,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::Inbox,
        QueueName::Outbox,
        QueueName::Pending,
        QueueName::Delivered,
        QueueName::Expired,
        QueueName::Quarantine,
    ];

    /// Queues the TTL reaper sweeps into `expired`.
    pub fn is_active(self) -> bool {
        matches!(self, QueueName::Inbox | QueueName::Outbox | QueueName::Pending)
    }

    /// Queues whose entries are purged after the audit window.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueName::Expired | QueueName::Quarantine)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Inbox => "inbox",
            QueueName::Outbox => "outbox",
            QueueName::Pending => "pending",
            QueueName::Delivered => "delivered",
            QueueName::Expired => "expired",
            QueueName::Quarantine => "quarantine",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Queue membership record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub bundle_id: BundleId,
    pub queue: QueueName,
    /// When the bundle entered its current queue.
    pub enqueued_at: UnixSeconds,
    pub size_bytes: u64,
}

/// Why a bundle left active routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpiryReason {
    Ttl,
    HopLimit,
}

/// A bundle together with its queue entry and local metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBundle {
    pub entry: QueueEntry,
    pub bundle: Bundle,
    /// Retained for role utility rather than a local interest.
    pub speculative: bool,
    pub received_from: Option<NodeId>,
    pub expiry_reason: Option<ExpiryReason>,
}

impl StoredBundle {
    fn eviction_candidate(&self) -> EvictionCandidate {
        EvictionCandidate {
            bundle_id: self.entry.bundle_id,
            queue: self.entry.queue,
            priority: self.bundle.priority,
            speculative: self.speculative,
            hops_remaining: self.bundle.hops_remaining(),
            created_at: self.bundle.created_at,
            size_bytes: self.entry.size_bytes,
        }
    }

    fn order_key(&self) -> (Priority, UnixSeconds, BundleId) {
        (
            self.bundle.priority,
            self.bundle.created_at,
            self.entry.bundle_id,
        )
    }
}

/// Predicate over stored bundles. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleFilter {
    pub priority: Option<Priority>,
    pub topic: Option<String>,
    pub payload_type: Option<String>,
    pub tag: Option<String>,
    pub speculative: Option<bool>,
    pub signer: Option<NodeId>,
}

impl BundleFilter {
    pub fn matches(&self, stored: &StoredBundle) -> bool {
        let bundle = &stored.bundle;
        if self.priority.is_some_and(|p| p != bundle.priority) {
            return false;
        }
        if let Some(topic) = &self.topic {
            if bundle.topic.as_deref() != Some(topic.as_str()) {
                return false;
            }
        }
        if let Some(kind) = &self.payload_type {
            if bundle.payload.payload_type() != kind {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !bundle.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if self.speculative.is_some_and(|s| s != stored.speculative) {
            return false;
        }
        if self.signer.is_some_and(|s| s != bundle.signer_id) {
            return false;
        }
        true
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("bundle {0} is already stored")]
    Duplicate(BundleId),
    #[error("bundle {0} is not stored")]
    NotFound(BundleId),
    #[error("bundle {bundle_id} is in {actual:?}, expected {expected:?}")]
    WrongQueue {
        bundle_id: BundleId,
        expected: QueueName,
        actual: QueueName,
    },
    #[error("transition {from:?} -> {to:?} is not allowed")]
    IllegalTransition { from: QueueName, to: QueueName },
    #[error("bundles cannot enter {0:?} directly")]
    IllegalEntry(QueueName),
    #[error("storage budget exceeded: {used} of {budget} bytes in use")]
    BudgetExceeded { used: u64, budget: u64 },
}

/// Parameters for inserting a bundle.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub bundle_id: BundleId,
    pub bundle: Bundle,
    pub queue: QueueName,
    pub size_bytes: u64,
    pub speculative: bool,
    pub received_from: Option<NodeId>,
}

/// Result of a budget-aware insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub entry: QueueEntry,
    pub evicted: Vec<StoredBundle>,
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: QueueName,
    pub count: usize,
    pub bytes: u64,
}

/// Serializable queue contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub entries: Vec<StoredBundle>,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: HashMap<BundleId, StoredBundle>,
    counts: [usize; 6],
    bytes: [u64; 6],
}

impl QueueInner {
    fn insert(&mut self, stored: StoredBundle) {
        let idx = stored.entry.queue.index();
        self.counts[idx] += 1;
        self.bytes[idx] += stored.entry.size_bytes;
        self.entries.insert(stored.entry.bundle_id, stored);
    }

    fn remove(&mut self, id: &BundleId) -> Option<StoredBundle> {
        let stored = self.entries.remove(id)?;
        let idx = stored.entry.queue.index();
        self.counts[idx] -= 1;
        self.bytes[idx] -= stored.entry.size_bytes;
        Some(stored)
    }

    fn relocate(&mut self, id: &BundleId, to: QueueName, now: UnixSeconds) -> Option<QueueEntry> {
        let mut stored = self.remove(id)?;
        stored.entry.queue = to;
        stored.entry.enqueued_at = now;
        let entry = stored.entry;
        self.insert(stored);
        Some(entry)
    }

    fn total_bytes(&self) -> u64 {
        self.bytes.iter().sum()
    }

    fn candidates(&self) -> Vec<EvictionCandidate> {
        self.entries
            .values()
            .map(StoredBundle::eviction_candidate)
            .collect()
    }

    fn sorted_in(&self, queue: QueueName, filter: &BundleFilter) -> Vec<&StoredBundle> {
        let mut out: Vec<&StoredBundle> = self
            .entries
            .values()
            .filter(|s| s.entry.queue == queue && filter.matches(*s))
            .collect();
        out.sort_by_key(|s| s.order_key());
        out
    }
}

/// Single owner of every stored bundle and its queue membership.
///
/// Each operation takes the store lock once, so a transition is never
/// observable half-done and a bundle is never in two queues.
#[derive(Debug, Clone, Default)]
pub struct QueueStore {
    inner: Arc<Mutex<QueueInner>>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue store lock")
    }

    fn check_entry(new: &NewEntry) -> Result<(), QueueError> {
        match new.queue {
            QueueName::Inbox | QueueName::Outbox | QueueName::Quarantine => Ok(()),
            other => Err(QueueError::IllegalEntry(other)),
        }
    }

    fn stored_from(new: NewEntry, now: UnixSeconds) -> StoredBundle {
        StoredBundle {
            entry: QueueEntry {
                bundle_id: new.bundle_id,
                queue: new.queue,
                enqueued_at: now,
                size_bytes: new.size_bytes,
            },
            bundle: new.bundle,
            speculative: new.speculative,
            received_from: new.received_from,
            expiry_reason: None,
        }
    }

    /// Inserts a bundle into `inbox`, `outbox` or `quarantine` without a budget check.
    pub fn enqueue(&self, new: NewEntry, now: UnixSeconds) -> Result<QueueEntry, QueueError> {
        Self::check_entry(&new)?;
        let mut inner = self.lock();
        if inner.entries.contains_key(&new.bundle_id) {
            return Err(QueueError::Duplicate(new.bundle_id));
        }
        let stored = Self::stored_from(new, now);
        let entry = stored.entry;
        inner.insert(stored);
        Ok(entry)
    }

    /// Budget-aware insert: rejects or evicts per the admission plan, atomically.
    pub fn admit(
        &self,
        new: NewEntry,
        now: UnixSeconds,
        limits: StorageLimits,
    ) -> Result<Admitted, QueueError> {
        Self::check_entry(&new)?;
        let mut inner = self.lock();
        if inner.entries.contains_key(&new.bundle_id) {
            return Err(QueueError::Duplicate(new.bundle_id));
        }
        let plan = plan_admission(
            inner.candidates(),
            inner.total_bytes(),
            new.size_bytes,
            new.bundle.priority,
            limits,
        );
        let victims = match plan {
            AdmissionPlan::Reject { used, budget } => {
                return Err(QueueError::BudgetExceeded { used, budget })
            }
            AdmissionPlan::Admit { evict } => evict,
        };
        let evicted = victims.iter().filter_map(|id| inner.remove(id)).collect();
        let stored = Self::stored_from(new, now);
        let entry = stored.entry;
        inner.insert(stored);
        Ok(Admitted { entry, evicted })
    }

    /// Evicts until usage is below the high-water mark.
    pub fn reconcile(&self, limits: StorageLimits) -> Vec<StoredBundle> {
        let mut inner = self.lock();
        let victims = plan_reconcile(inner.candidates(), inner.total_bytes(), limits);
        victims.iter().filter_map(|id| inner.remove(id)).collect()
    }

    /// Moves `bundle_id` from `from` to `to` along a permitted edge.
    ///
    /// Permitted: inbox/outbox → pending, and pending → delivered for
    /// bundles that requested a receipt. Expiry goes through [`Self::expire`].
    pub fn move_bundle(
        &self,
        bundle_id: BundleId,
        from: QueueName,
        to: QueueName,
        now: UnixSeconds,
    ) -> Result<QueueEntry, QueueError> {
        let mut inner = self.lock();
        let stored = inner
            .entries
            .get(&bundle_id)
            .ok_or(QueueError::NotFound(bundle_id))?;
        if stored.entry.queue != from {
            return Err(QueueError::WrongQueue {
                bundle_id,
                expected: from,
                actual: stored.entry.queue,
            });
        }
        let allowed = match (from, to) {
            (QueueName::Inbox | QueueName::Outbox, QueueName::Pending) => true,
            (QueueName::Pending, QueueName::Delivered) => {
                stored.bundle.receipt_policy.wants_receipt()
            }
            _ => false,
        };
        if !allowed {
            return Err(QueueError::IllegalTransition { from, to });
        }
        inner
            .relocate(&bundle_id, to, now)
            .ok_or(QueueError::NotFound(bundle_id))
    }

    /// Moves an active bundle to `expired`, tagging why.
    pub fn expire(
        &self,
        bundle_id: BundleId,
        reason: ExpiryReason,
        now: UnixSeconds,
    ) -> Result<QueueEntry, QueueError> {
        let mut inner = self.lock();
        let stored = inner
            .entries
            .get_mut(&bundle_id)
            .ok_or(QueueError::NotFound(bundle_id))?;
        if !stored.entry.queue.is_active() {
            return Err(QueueError::IllegalTransition {
                from: stored.entry.queue,
                to: QueueName::Expired,
            });
        }
        stored.expiry_reason = Some(reason);
        inner
            .relocate(&bundle_id, QueueName::Expired, now)
            .ok_or(QueueError::NotFound(bundle_id))
    }

    /// Removes and returns the highest-priority entry of `queue` matching `filter`.
    pub fn dequeue(&self, queue: QueueName, filter: &BundleFilter) -> Option<StoredBundle> {
        let mut inner = self.lock();
        let id = inner
            .sorted_in(queue, filter)
            .first()
            .map(|s| s.entry.bundle_id)?;
        inner.remove(&id)
    }

    /// Entries of `queue` matching `filter`, in priority then age order.
    pub fn list(&self, queue: QueueName, filter: &BundleFilter, limit: usize) -> Vec<StoredBundle> {
        self.lock()
            .sorted_in(queue, filter)
            .into_iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn delete(&self, bundle_id: BundleId) -> Result<StoredBundle, QueueError> {
        self.lock()
            .remove(&bundle_id)
            .ok_or(QueueError::NotFound(bundle_id))
    }

    pub fn get(&self, bundle_id: &BundleId) -> Option<StoredBundle> {
        self.lock().entries.get(bundle_id).cloned()
    }

    pub fn contains(&self, bundle_id: &BundleId) -> bool {
        self.lock().entries.contains_key(bundle_id)
    }

    pub fn queue_of(&self, bundle_id: &BundleId) -> Option<QueueName> {
        self.lock().entries.get(bundle_id).map(|s| s.entry.queue)
    }

    /// Advances the local hop counter after a committed transfer.
    ///
    /// Returns the new count.
    pub fn record_hop(&self, bundle_id: BundleId) -> Result<u8, QueueError> {
        let mut inner = self.lock();
        let stored = inner
            .entries
            .get_mut(&bundle_id)
            .ok_or(QueueError::NotFound(bundle_id))?;
        stored.bundle.hop_count = stored.bundle.hop_count.saturating_add(1);
        Ok(stored.bundle.hop_count)
    }

    /// Ids of `queues` entries satisfying `pred`.
    pub fn select_ids<F>(&self, queues: &[QueueName], pred: F) -> Vec<BundleId>
    where
        F: Fn(&StoredBundle) -> bool,
    {
        self.lock()
            .entries
            .values()
            .filter(|s| queues.contains(&s.entry.queue) && pred(*s))
            .map(|s| s.entry.bundle_id)
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes()
    }

    /// Stats for one queue, or for all six in declaration order.
    pub fn stats(&self, queue: Option<QueueName>) -> Vec<QueueStats> {
        let inner = self.lock();
        let queues: Vec<QueueName> = match queue {
            Some(q) => vec![q],
            None => QueueName::ALL.to_vec(),
        };
        queues
            .into_iter()
            .map(|q| QueueStats {
                queue: q,
                count: inner.counts[q.index()],
                bytes: inner.bytes[q.index()],
            })
            .collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();
        let mut entries: Vec<StoredBundle> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|s| (s.entry.queue, s.order_key()));
        QueueSnapshot { entries }
    }

    /// Replaces all contents with `snapshot`.
    pub fn restore(&self, snapshot: QueueSnapshot) {
        let mut inner = self.lock();
        *inner = QueueInner::default();
        for stored in snapshot.entries {
            inner.insert(stored);
        }
    }
}
