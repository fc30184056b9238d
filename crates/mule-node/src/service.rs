use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use mule_codec::{create_bundle, encode_bundle_cbor, Bundle, BundleOptions, CodecError, Payload};
use mule_core::{Audience, BundleId, Clock, NodeId, Priority, ReceiptPolicy, UnixSeconds};
use mule_crypto::identity::NodeIdentity;
use mule_crypto::signing::{Ed25519Signer, Ed25519Verifier};
use mule_transport::PeerLink;
use thiserror::Error;

use crate::budget::{BatteryProfile, CacheBudget, CacheStats};
use crate::config::{BundleLayerConfig, ConfigError};
use crate::forwarding::{plan_for_peer, ForwardingContext, PeerContact, SkipReason};
use crate::persistence::{NodeSnapshot, PersistenceError};
use crate::queue::{
    BundleFilter, ExpiryReason, NewEntry, QueueError, QueueName, QueueStats, QueueStore,
    StoredBundle,
};
use crate::reaper::{reap, ReapReport};
use crate::receive::{DropReason, ReceiveOutcome};
use crate::runtime::RuntimeStats;
use crate::subscriptions::{Subscription, SubscriptionFilter, SubscriptionRegistry};
use crate::sync::{run_session, IndexEntry, SessionOffer, SyncError};
use crate::trust::{PeerView, RevokeOutcome, TrustError, TrustExplanation, TrustStore};

const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 1024;
const DECLINED_CAPACITY: usize = 4096;

/// Errors surfaced to local producers.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("malformed submission: {0}")]
    Malformed(#[from] CodecError),
    #[error("storage budget exhausted: {used}/{budget} bytes")]
    BudgetExceeded { used: u64, budget: u64 },
    #[error("trust update rejected: {0}")]
    Trust(#[from] TrustError),
}

/// A producer's request to originate one bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitRequest {
    pub payload_type: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub audience: Audience,
    pub topic: Option<String>,
    pub tags: Vec<String>,
    /// Overrides the TTL table.
    pub ttl: Option<Duration>,
    /// Overrides the configured default hop limit.
    pub hop_limit: Option<u8>,
    pub receipt_policy: ReceiptPolicy,
    pub recipient: Option<NodeId>,
}

impl SubmitRequest {
    pub fn new(payload_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            payload_type: payload_type.into(),
            payload,
            ..Self::default()
        }
    }
}

/// Summary of one committed contact with a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub peer: Option<NodeId>,
    pub offered: usize,
    pub transmitted: Vec<BundleId>,
    /// Transmitted bundles whose hop counter reached the limit.
    pub saturated: Vec<BundleId>,
    /// Transferred but not kept by the peer; no hop was spent on these.
    pub declined: Vec<BundleId>,
    pub deferred: usize,
    pub skipped: usize,
    pub received: Vec<ReceiveOutcome>,
}

/// Construction inputs for [`BundleLayer::new`].
pub struct LayerParams {
    pub config: BundleLayerConfig,
    pub identity: NodeIdentity,
    pub clock: Arc<dyn Clock>,
    /// Access point this node is attached to, for `same-access-point` scope.
    pub local_access_point: Option<String>,
}

pub(crate) struct LayerInner {
    pub(crate) config: BundleLayerConfig,
    pub(crate) identity: NodeIdentity,
    pub(crate) signer: Ed25519Signer,
    pub(crate) verifier: Ed25519Verifier,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) queues: QueueStore,
    pub(crate) budget: Mutex<CacheBudget>,
    pub(crate) trust: Mutex<TrustStore>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) stats: Mutex<RuntimeStats>,
    // ids this node turned down for good; not requested again
    pub(crate) declined: Mutex<LruCache<BundleId, ()>>,
    pub(crate) local_access_point: Option<String>,
}

/// Node-local bundle layer: queue store, budgets, trust and forwarding
/// behind one cloneable handle shared by producers, sync handlers and
/// background tasks.
#[derive(Clone)]
pub struct BundleLayer {
    pub(crate) inner: Arc<LayerInner>,
}

impl std::fmt::Debug for BundleLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleLayer")
            .field("node_id", &self.inner.identity.node_id())
            .field("role", &self.inner.config.role)
            .finish_non_exhaustive()
    }
}

impl BundleLayer {
    pub fn new(params: LayerParams) -> Result<Self, ConfigError> {
        let config = params.config.validated()?;
        let budget = CacheBudget::new(&config);
        let trust = TrustStore::new(config.trust);
        Ok(Self {
            inner: Arc::new(LayerInner {
                signer: params.identity.signer(),
                verifier: Ed25519Verifier,
                identity: params.identity,
                clock: params.clock,
                queues: QueueStore::new(),
                budget: Mutex::new(budget),
                trust: Mutex::new(trust),
                subscriptions: SubscriptionRegistry::new(SUBSCRIPTION_CHANNEL_CAPACITY),
                stats: Mutex::new(RuntimeStats::default()),
                declined: Mutex::new(LruCache::new(
                    NonZeroUsize::new(DECLINED_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                )),
                local_access_point: params.local_access_point,
                config,
            }),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.identity.node_id()
    }

    pub fn config(&self) -> &BundleLayerConfig {
        &self.inner.config
    }

    pub(crate) fn now(&self) -> UnixSeconds {
        self.inner.clock.now()
    }

    pub(crate) fn budget(&self) -> MutexGuard<'_, CacheBudget> {
        self.inner.budget.lock().expect("cache budget lock")
    }

    pub(crate) fn trust(&self) -> MutexGuard<'_, TrustStore> {
        self.inner.trust.lock().expect("trust store lock")
    }

    pub(crate) fn stats_mut(&self) -> MutexGuard<'_, RuntimeStats> {
        self.inner.stats.lock().expect("runtime stats lock")
    }

    pub(crate) fn declined(&self) -> MutexGuard<'_, LruCache<BundleId, ()>> {
        self.inner.declined.lock().expect("declined ids lock")
    }

    pub(crate) fn queues(&self) -> &QueueStore {
        &self.inner.queues
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.subscriptions
    }

    /// Signs and stores a new bundle in `outbox`.
    ///
    /// Only malformed input and hard storage exhaustion are errors;
    /// resubmitting identical content returns the existing id.
    pub fn submit(&self, request: SubmitRequest) -> Result<BundleId, SubmitError> {
        let payload = Payload::from_parts(&request.payload_type, request.payload)?;
        let options = BundleOptions {
            priority: request.priority,
            audience: request.audience,
            topic: request.topic,
            tags: request.tags,
            ttl_secs: request.ttl.map(|ttl| ttl.as_secs()),
            hop_limit: request.hop_limit,
            receipt_policy: request.receipt_policy,
            recipient: request.recipient,
        };
        self.originate(payload, options)
    }

    pub(crate) fn originate(
        &self,
        payload: Payload,
        mut options: BundleOptions,
    ) -> Result<BundleId, SubmitError> {
        let now = self.now();
        options.hop_limit = options
            .hop_limit
            .or(Some(self.inner.config.hop_limit_default));
        let bundle = create_bundle(
            payload,
            options,
            now,
            &self.inner.config.ttl,
            &self.inner.signer,
        )?;
        let bundle_id = bundle.id()?;
        let size_bytes = encode_bundle_cbor(&bundle)?.len() as u64;
        let priority = bundle.priority;
        let limits = self.budget().storage_limits();

        let admitted = self.queues().admit(
            NewEntry {
                bundle_id,
                bundle,
                queue: QueueName::Outbox,
                size_bytes,
                speculative: false,
                received_from: None,
            },
            now,
            limits,
        );
        match admitted {
            Ok(admitted) => {
                self.note_evictions(&admitted.evicted);
                self.stats_mut().submitted += 1;
                tracing::info!(bundle_id = %bundle_id, ?priority, size_bytes, "bundle submitted");
                Ok(bundle_id)
            }
            Err(QueueError::Duplicate(existing)) => Ok(existing),
            Err(QueueError::BudgetExceeded { used, budget }) => {
                self.stats_mut().rejected += 1;
                tracing::info!(bundle_id = %bundle_id, used, budget, "submission rejected at capacity");
                Err(SubmitError::BudgetExceeded { used, budget })
            }
            Err(err) => {
                tracing::error!(bundle_id = %bundle_id, error = %err, "outbox admission failed");
                Err(CodecError::InvalidBundle("bundle could not be stored").into())
            }
        }
    }

    /// Vouches for `vouchee` locally and publishes the vouch as a bundle.
    pub fn vouch(&self, vouchee: NodeId) -> Result<BundleId, SubmitError> {
        let now = self.now();
        self.trust().vouch(self.node_id(), vouchee, now)?;
        self.originate(Payload::Vouch { vouchee }, self.control_options())
    }

    /// Revokes (or votes to revoke) `voucher -> vouchee` and publishes the
    /// revocation as a bundle.
    pub fn revoke(
        &self,
        voucher: NodeId,
        vouchee: NodeId,
        reason: &str,
    ) -> Result<(BundleId, RevokeOutcome), SubmitError> {
        let now = self.now();
        let outcome = self
            .trust()
            .revoke(self.node_id(), voucher, vouchee, reason, now)?;
        let bundle_id = self.originate(
            Payload::Revocation {
                voucher,
                vouchee,
                reason: reason.to_string(),
            },
            self.control_options(),
        )?;
        Ok((bundle_id, outcome))
    }

    fn control_options(&self) -> BundleOptions {
        BundleOptions {
            ttl_secs: Some(self.inner.config.ttl.knowledge_secs),
            ..BundleOptions::default()
        }
    }

    /// Streams bundles matching `filter`: those already held first, then new
    /// arrivals. Resubscribing with the same filter replays again.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.declined().clear();
        let queues = self.queues().clone();
        self.subscriptions().subscribe(filter, move |filter| {
            let mut held: Vec<StoredBundle> = queues
                .select_ids(
                    &[QueueName::Inbox, QueueName::Pending, QueueName::Delivered],
                    |s| {
                        !s.speculative
                            && (s.entry.queue != QueueName::Pending || s.received_from.is_some())
                            && filter.matches(&s.bundle)
                    },
                )
                .into_iter()
                .filter_map(|id| queues.get(&id))
                .collect();
            held.sort_by_key(|s| (s.entry.enqueued_at, s.bundle.created_at, s.entry.bundle_id));
            held.into_iter()
                .map(|s| (s.entry.bundle_id, s.bundle))
                .collect()
        })
    }

    /// Held bundles matching `filter` across active and delivered queues,
    /// speculative entries included, most urgent first.
    pub fn query(&self, filter: &BundleFilter, limit: usize) -> Vec<StoredBundle> {
        let mut out: Vec<StoredBundle> = [
            QueueName::Inbox,
            QueueName::Outbox,
            QueueName::Pending,
            QueueName::Delivered,
        ]
        .into_iter()
        .flat_map(|queue| self.queues().list(queue, filter, limit))
        .collect();
        out.sort_by_key(|s| (s.bundle.priority, s.bundle.created_at, s.entry.bundle_id));
        out.truncate(limit);
        out
    }

    pub fn get(&self, bundle_id: &BundleId) -> Option<StoredBundle> {
        self.queues().get(bundle_id)
    }

    pub fn queue_of(&self, bundle_id: &BundleId) -> Option<QueueName> {
        self.queues().queue_of(bundle_id)
    }

    pub fn queue_stats(&self, queue: Option<QueueName>) -> Vec<QueueStats> {
        self.queues().stats(queue)
    }

    pub fn cache_stats(&self) -> CacheStats {
        let used = self.queues().total_bytes();
        self.budget().stats(used, self.now())
    }

    pub fn runtime_stats(&self) -> RuntimeStats {
        *self.stats_mut()
    }

    pub fn set_battery_level(&self, level_percent: u8) {
        let mut budget = self.budget();
        let before = budget.power_mode();
        budget.set_battery_level(level_percent);
        let after = budget.power_mode();
        if before != after {
            drop(budget);
            self.declined().clear();
            tracing::info!(level_percent, ?after, "power mode changed");
        }
    }

    pub fn set_battery_profile(&self, profile: BatteryProfile) {
        self.budget().set_battery_profile(profile);
    }

    /// Forwarding poll period after battery scaling.
    pub fn poll_interval(&self, base: Duration) -> Duration {
        self.budget().poll_interval(base)
    }

    pub fn add_genesis(&self, node: NodeId) -> bool {
        self.trust().add_genesis(node)
    }

    pub fn trust_score(&self, node: NodeId) -> f64 {
        self.trust().trust(node)
    }

    pub fn explain_trust(&self, node: NodeId) -> TrustExplanation {
        self.trust().explain(node)
    }

    pub fn peers(&self) -> Vec<PeerView> {
        self.trust().peers()
    }

    pub fn export_trust_json(&self) -> Result<String, serde_json::Error> {
        self.trust().export_json()
    }

    /// Schedules inbox and outbox bundles for forwarding.
    ///
    /// Bundles addressed to this node stay in `inbox`; copies already at
    /// their hop limit go to `expired` instead.
    pub fn drain_to_pending(&self) -> usize {
        let now = self.now();
        let local = self.node_id();
        let ids = self
            .queues()
            .select_ids(&[QueueName::Inbox, QueueName::Outbox], |s| {
                s.bundle.recipient != Some(local)
            });
        let mut moved = 0;
        for id in ids {
            let Some(stored) = self.queues().get(&id) else {
                continue;
            };
            if stored.bundle.hop_limit_reached() {
                self.expire_saturated(id, now);
                continue;
            }
            if self
                .queues()
                .move_bundle(id, stored.entry.queue, QueueName::Pending, now)
                .is_ok()
            {
                moved += 1;
            }
        }
        if moved > 0 {
            tracing::debug!(moved, "bundles scheduled for forwarding");
        }
        moved
    }

    fn expire_saturated(&self, bundle_id: BundleId, now: UnixSeconds) -> bool {
        match self.queues().expire(bundle_id, ExpiryReason::HopLimit, now) {
            Ok(_) => {
                self.stats_mut().expired += 1;
                tracing::debug!(bundle_id = %bundle_id, "hop limit reached; bundle expired");
                true
            }
            Err(_) => false,
        }
    }

    /// Runs one contact with `contact` over `link`.
    ///
    /// Nothing is committed for transmitted bundles unless the whole
    /// exchange completes within the configured timeout: on failure hop
    /// counters and byte accounting are untouched and bundles stay pending.
    pub async fn sync_with(
        &self,
        link: &dyn PeerLink,
        contact: PeerContact,
    ) -> Result<SyncReport, SyncError> {
        let peer = contact.peer_id;
        let now = self.now();
        self.trust().record_seen(peer, now);
        self.drain_to_pending();

        let pending = self
            .queues()
            .list(QueueName::Pending, &BundleFilter::default(), usize::MAX);
        let peer_trust = self.trust_score(peer);
        let plan = {
            let budget = self.budget();
            let ctx = ForwardingContext {
                now,
                role: self.inner.config.role,
                local_scope: self.inner.config.local_scope,
                local_access_point: self.inner.local_access_point.as_deref(),
                trusted_threshold: self.inner.config.trusted_audience_threshold,
                budget: &budget,
            };
            plan_for_peer(
                pending,
                &contact,
                peer_trust,
                &ctx,
                self.inner.config.max_offer_per_contact,
            )
        };

        let mut report = SyncReport {
            peer: Some(peer),
            deferred: plan.skipped_for(SkipReason::BandwidthDeferred),
            skipped: plan.skipped.len(),
            ..SyncReport::default()
        };
        for (id, reason) in &plan.skipped {
            if *reason == SkipReason::HopLimitReached && self.expire_saturated(*id, now) {
                report.saturated.push(*id);
            }
        }

        let mut offer = SessionOffer::default();
        for stored in &plan.transmit {
            let frame = match encode_bundle_cbor(&stored.bundle.next_hop_copy()) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(bundle_id = %stored.entry.bundle_id, error = %err, "bundle not encodable; not offered");
                    continue;
                }
            };
            offer.index.push(IndexEntry {
                bundle_id: stored.entry.bundle_id,
                priority: stored.bundle.priority,
                expires_at: stored.bundle.expires_at,
                size_bytes: frame.len() as u64,
            });
            offer.frames.insert(stored.entry.bundle_id, frame);
        }

        let mut received_bytes = 0_u64;
        let session = run_session(
            link,
            offer,
            |id| self.holds_for_sync(id) || self.declined().contains(id),
            |frame| {
                received_bytes += frame.len() as u64;
                let outcome = self.receive_frame(&frame, Some(peer));
                let kept = self.note_sync_outcome(&outcome);
                report.received.push(outcome);
                kept
            },
        );
        let outcome = match tokio::time::timeout(self.inner.config.sync_timeout, session).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                self.stats_mut().sync_failures += 1;
                tracing::warn!(peer = %peer.short(), error = %err, "sync failed; pending bundles kept");
                return Err(err);
            }
            Err(_) => {
                self.stats_mut().sync_failures += 1;
                tracing::warn!(peer = %peer.short(), "sync timed out; pending bundles kept");
                return Err(SyncError::Timeout);
            }
        };

        let commit_at = self.now();
        let mut sent_bytes = 0_u64;
        for entry in &outcome.sent {
            sent_bytes += entry.size_bytes;
            if !outcome.acknowledged.contains(&entry.bundle_id) {
                report.declined.push(entry.bundle_id);
                continue;
            }
            let Ok(count) = self.queues().record_hop(entry.bundle_id) else {
                continue;
            };
            report.transmitted.push(entry.bundle_id);
            let limit = self
                .queues()
                .get(&entry.bundle_id)
                .map_or(u8::MAX, |s| s.bundle.hop_limit);
            if count >= limit && self.expire_saturated(entry.bundle_id, commit_at) {
                report.saturated.push(entry.bundle_id);
            }
        }
        {
            let mut budget = self.budget();
            budget.record_sent(sent_bytes, commit_at);
            budget.record_received(received_bytes, commit_at);
        }
        self.trust()
            .record_sent(peer, report.transmitted.len() as u64);
        {
            let mut stats = self.stats_mut();
            stats.sync_sessions += 1;
            stats.transmitted += report.transmitted.len() as u64;
            stats.deferred += report.deferred as u64;
        }
        report.offered = outcome.offered;
        tracing::info!(
            peer = %peer.short(),
            offered = report.offered,
            transmitted = report.transmitted.len(),
            declined = report.declined.len(),
            received = report.received.len(),
            deferred = report.deferred,
            "sync committed"
        );
        Ok(report)
    }

    /// Held outside quarantine. A quarantined forged copy must not stop the
    /// genuine bundle from being requested.
    fn holds_for_sync(&self, bundle_id: &BundleId) -> bool {
        matches!(self.queues().queue_of(bundle_id), Some(q) if q != QueueName::Quarantine)
    }

    /// Reports the id of a kept bundle and remembers ids turned down for
    /// good, so later contacts do not request them again.
    fn note_sync_outcome(&self, outcome: &ReceiveOutcome) -> Option<BundleId> {
        match outcome {
            ReceiveOutcome::Accepted { bundle_id, .. }
            | ReceiveOutcome::ReceiptApplied { bundle_id, .. } => Some(*bundle_id),
            ReceiveOutcome::Dropped {
                bundle_id: Some(bundle_id),
                reason,
            } => {
                if matches!(
                    reason,
                    DropReason::NotInterested
                        | DropReason::NotRecipient
                        | DropReason::Saturated
                        | DropReason::Expired
                        | DropReason::Malformed(_)
                ) {
                    self.declined().put(*bundle_id, ());
                }
                None
            }
            _ => None,
        }
    }

    /// One reaper pass at the current time.
    pub fn reap(&self) -> ReapReport {
        let report = reap(
            self.queues(),
            self.now(),
            self.inner.config.audit_retention_secs(),
        );
        let mut stats = self.stats_mut();
        stats.expired += report.expired.len() as u64;
        stats.purged += report.purged.len() as u64;
        report
    }

    /// Evicts down to the high-water mark if storage is under pressure.
    pub fn reconcile_budget(&self) -> Vec<BundleId> {
        let limits = self.budget().storage_limits();
        let evicted = self.queues().reconcile(limits);
        self.note_evictions(&evicted);
        evicted.into_iter().map(|s| s.entry.bundle_id).collect()
    }

    pub(crate) fn note_evictions(&self, evicted: &[StoredBundle]) {
        if evicted.is_empty() {
            return;
        }
        self.stats_mut().evicted += evicted.len() as u64;
        for stored in evicted {
            tracing::info!(
                bundle_id = %stored.entry.bundle_id,
                queue = ?stored.entry.queue,
                priority = ?stored.bundle.priority,
                speculative = stored.speculative,
                "bundle evicted"
            );
        }
    }

    /// Captures queues, trust graph and counters for persistence.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.node_id(),
            queues: self.queues().snapshot(),
            trust: self.trust().snapshot(),
            stats: self.runtime_stats(),
        }
    }

    /// Replaces queues, trust graph and counters with `snapshot`. Snapshots
    /// of another node are refused.
    ///
    /// Trust tunables stay as configured, and genesis anchors added before
    /// the restore are kept alongside the restored ones.
    pub fn restore(&self, snapshot: NodeSnapshot) -> Result<(), PersistenceError> {
        if snapshot.node_id != self.node_id() {
            return Err(PersistenceError::ForeignSnapshot(snapshot.node_id));
        }
        self.queues().restore(snapshot.queues);
        {
            let mut trust = self.trust();
            let anchors = trust.genesis();
            let mut restored = TrustStore::from_snapshot(self.inner.config.trust, snapshot.trust);
            for node in anchors {
                restored.add_genesis(node);
            }
            *trust = restored;
        }
        *self.stats_mut() = snapshot.stats;
        Ok(())
    }

    pub(crate) fn receipt_options(&self, acknowledged: &Bundle) -> BundleOptions {
        let remaining = acknowledged
            .expires_at
            .saturating_sub(self.now())
            .max(1);
        BundleOptions {
            priority: acknowledged.priority,
            audience: Audience::Private,
            recipient: Some(acknowledged.signer_id),
            ttl_secs: Some(remaining),
            hop_limit: Some(acknowledged.hop_limit),
            ..BundleOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{BundleLayer, LayerParams, SubmitError, SubmitRequest};
    use crate::config::BundleLayerConfig;
    use crate::queue::{BundleFilter, ExpiryReason, QueueName};
    use mule_core::clock::{DAY, HOUR};
    use mule_core::{ManualClock, Priority, TOPIC_MUTUAL_AID};
    use mule_crypto::identity::NodeIdentity;

    const NOW: u64 = 1_700_000_000;

    fn layer_with(config: BundleLayerConfig) -> (BundleLayer, ManualClock) {
        let clock = ManualClock::new(NOW);
        let layer = BundleLayer::new(LayerParams {
            config,
            identity: NodeIdentity::from_secret([7; 32]),
            clock: Arc::new(clock.clone()),
            local_access_point: None,
        })
        .expect("layer should build");
        (layer, clock)
    }

    fn layer() -> (BundleLayer, ManualClock) {
        layer_with(BundleLayerConfig::default())
    }

    #[test]
    fn submit_lands_in_outbox_with_default_hop_limit() {
        let (layer, _) = layer();
        let id = layer
            .submit(SubmitRequest::new("listing", b"bike for trade".to_vec()))
            .expect("submit should succeed");
        let stored = layer.get(&id).expect("bundle should be stored");
        assert_eq!(stored.entry.queue, QueueName::Outbox);
        assert_eq!(stored.bundle.hop_limit, 20);
        assert_eq!(stored.bundle.hop_count, 0);
        assert_eq!(stored.bundle.signer_id, layer.node_id());
        assert_eq!(layer.runtime_stats().submitted, 1);
    }

    #[test]
    fn identical_submission_returns_same_id() {
        let (layer, _) = layer();
        let a = layer
            .submit(SubmitRequest::new("listing", vec![1]))
            .expect("first submit");
        let b = layer
            .submit(SubmitRequest::new("listing", vec![1]))
            .expect("second submit");
        assert_eq!(a, b);
        assert_eq!(layer.queue_stats(Some(QueueName::Outbox))[0].count, 1);
    }

    #[test]
    fn malformed_submissions_are_rejected_at_the_boundary() {
        let (layer, _) = layer();
        let err = layer
            .submit(SubmitRequest::new("", vec![1]))
            .expect_err("empty payload type must fail");
        assert!(matches!(err, SubmitError::Malformed(_)));

        let err = layer
            .submit(SubmitRequest::new("receipt", vec![1]))
            .expect_err("reserved payload type must fail");
        assert!(matches!(err, SubmitError::Malformed(_)));

        let mut request = SubmitRequest::new("listing", vec![1]);
        request.ttl = Some(Duration::ZERO);
        assert!(matches!(
            layer.submit(request),
            Err(SubmitError::Malformed(_))
        ));
        assert_eq!(layer.queues().total_bytes(), 0);
    }

    #[test]
    fn perishable_food_gets_a_ttl_within_one_to_three_days() {
        let (layer, _) = layer();
        let mut request = SubmitRequest::new("listing", b"bread".to_vec());
        request.topic = Some(TOPIC_MUTUAL_AID.to_string());
        request.tags = vec!["food".into()];
        let id = layer.submit(request).expect("submit should succeed");
        let bundle = layer.get(&id).expect("stored").bundle;
        let ttl = bundle.expires_at - bundle.created_at;
        assert!((DAY..=3 * DAY).contains(&ttl), "ttl {ttl} out of range");
    }

    #[test]
    fn hard_capacity_rejects_normal_but_admits_emergency() {
        let (layer, _) = layer_with(BundleLayerConfig {
            storage_budget_bytes: 700,
            ..BundleLayerConfig::default()
        });
        let mut filled = Vec::new();
        for n in 0..50_u8 {
            match layer.submit(SubmitRequest::new("listing", vec![n; 40])) {
                Ok(id) => filled.push(id),
                Err(SubmitError::BudgetExceeded { .. }) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert!(!filled.is_empty());
        assert!(layer.runtime_stats().rejected >= 1);

        let mut urgent = SubmitRequest::new("listing", vec![0xEE; 40]);
        urgent.priority = Priority::Emergency;
        let id = layer.submit(urgent).expect("emergency is never rejected");
        assert_eq!(layer.queue_of(&id), Some(QueueName::Outbox));
        assert!(layer.runtime_stats().evicted >= 1);
    }

    #[test]
    fn reaped_bundles_make_room_for_normal_submissions() {
        let (layer, clock) = layer_with(BundleLayerConfig {
            storage_budget_bytes: 700,
            ..BundleLayerConfig::default()
        });
        let mut n = 0_u8;
        loop {
            let request = SubmitRequest {
                ttl: Some(Duration::from_secs(HOUR)),
                ..SubmitRequest::new("listing", vec![n; 40])
            };
            match layer.submit(request) {
                Ok(_) => n += 1,
                Err(SubmitError::BudgetExceeded { .. }) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert!(n > 0);

        clock.advance(HOUR);
        assert_eq!(layer.reap().expired.len(), usize::from(n));
        let id = layer
            .submit(SubmitRequest::new("listing", vec![0xAB; 40]))
            .expect("expired entries should be reclaimed");
        assert_eq!(layer.queue_of(&id), Some(QueueName::Outbox));
        assert!(layer.runtime_stats().evicted >= 1);
    }

    #[test]
    fn restore_keeps_genesis_added_before_it() {
        let (layer, _) = layer();
        let anchor = NodeIdentity::from_secret([9; 32]).node_id();
        let older = layer.snapshot();

        layer.add_genesis(anchor);
        layer.restore(older).expect("own snapshot should restore");
        assert_eq!(layer.trust_score(anchor), 1.0);
    }

    #[test]
    fn drain_moves_outbox_to_pending_and_reaper_expires() {
        let (layer, clock) = layer();
        let mut request = SubmitRequest::new("listing", vec![9]);
        request.ttl = Some(Duration::from_secs(HOUR));
        let id = layer.submit(request).expect("submit");
        assert_eq!(layer.drain_to_pending(), 1);
        assert_eq!(layer.queue_of(&id), Some(QueueName::Pending));

        clock.advance(HOUR);
        let report = layer.reap();
        assert_eq!(report.expired, vec![id]);
        let stored = layer.get(&id).expect("held for audit");
        assert_eq!(stored.entry.queue, QueueName::Expired);
        assert_eq!(stored.expiry_reason, Some(ExpiryReason::Ttl));
    }

    #[test]
    fn query_spans_queues_in_priority_order() {
        let (layer, _) = layer();
        let low = layer
            .submit(SubmitRequest {
                priority: Priority::Low,
                ..SubmitRequest::new("listing", vec![1])
            })
            .expect("low");
        layer.drain_to_pending();
        let urgent = layer
            .submit(SubmitRequest {
                priority: Priority::Emergency,
                ..SubmitRequest::new("listing", vec![2])
            })
            .expect("urgent");
        let found = layer.query(&BundleFilter::default(), 10);
        let ids: Vec<_> = found.iter().map(|s| s.entry.bundle_id).collect();
        assert_eq!(ids, vec![urgent, low]);
        assert_eq!(layer.query(&BundleFilter::default(), 1).len(), 1);
    }

    #[test]
    fn vouch_applies_locally_and_emits_control_bundle() {
        let (layer, _) = layer();
        let me = layer.node_id();
        let friend = NodeIdentity::from_secret([8; 32]).node_id();
        layer.add_genesis(me);
        let id = layer.vouch(friend).expect("vouch should succeed");
        assert!((layer.trust_score(friend) - 0.8).abs() < 1e-9);
        let stored = layer.get(&id).expect("vouch bundle stored");
        assert_eq!(stored.bundle.payload.payload_type(), "vouch");

        assert!(matches!(layer.vouch(me), Err(SubmitError::Trust(_))));
        layer.revoke(me, friend, "lost key").expect("revoke");
        assert_eq!(layer.trust_score(friend), 0.0);
    }

    #[test]
    fn low_battery_slows_polling() {
        let (layer, _) = layer();
        let base = Duration::from_secs(10);
        let normal = layer.poll_interval(base);
        layer.set_battery_level(15);
        assert_eq!(layer.poll_interval(base), normal * 2);
        assert_eq!(layer.cache_stats().battery_level, 15);
    }
}
