use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use mule_codec::Bundle;
use mule_core::BundleId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Topic and/or payload-type predicate. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub topic: Option<String>,
    pub payload_type: Option<String>,
}

impl SubscriptionFilter {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into().trim().to_lowercase()),
            payload_type: None,
        }
    }

    pub fn payload_type(payload_type: impl Into<String>) -> Self {
        Self {
            topic: None,
            payload_type: Some(payload_type.into()),
        }
    }

    pub fn matches(&self, bundle: &Bundle) -> bool {
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
        true
    }
}

/// A bundle that just became visible to local consumers.
#[derive(Debug, Clone)]
pub struct BundleEvent {
    pub bundle_id: BundleId,
    pub bundle: Bundle,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    filters: HashMap<u64, SubscriptionFilter>,
}

/// Live local interests plus the fan-out channel feeding them.
#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    events: broadcast::Sender<Arc<BundleEvent>>,
}

impl SubscriptionRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::default(),
            events,
        }
    }

    /// True when at least one live subscription matches `bundle`.
    pub fn is_interested(&self, bundle: &Bundle) -> bool {
        self.inner
            .lock()
            .expect("subscription lock")
            .filters
            .values()
            .any(|f| f.matches(bundle))
    }

    pub fn active(&self) -> usize {
        self.inner.lock().expect("subscription lock").filters.len()
    }

    /// Fans `bundle` out to live subscriptions.
    pub fn publish(&self, bundle_id: BundleId, bundle: Bundle) {
        // No receivers is not an error.
        let _ = self.events.send(Arc::new(BundleEvent { bundle_id, bundle }));
    }

    /// Registers `filter` and returns its stream.
    ///
    /// The live channel is joined before `replay` is read, so nothing that
    /// arrives in between is lost; replayed ids are not repeated live.
    pub fn subscribe<F>(&self, filter: SubscriptionFilter, replay: F) -> Subscription
    where
        F: FnOnce(&SubscriptionFilter) -> Vec<(BundleId, Bundle)>,
    {
        let rx = self.events.subscribe();
        let id = {
            let mut inner = self.inner.lock().expect("subscription lock");
            inner.next_id += 1;
            let id = inner.next_id;
            inner.filters.insert(id, filter.clone());
            id
        };
        let backlog: VecDeque<(BundleId, Bundle)> = replay(&filter).into();
        let replayed = backlog.iter().map(|(id, _)| *id).collect();
        Subscription {
            id,
            filter,
            registry: Arc::clone(&self.inner),
            backlog,
            replayed,
            rx,
        }
    }
}

/// Lazy stream of matching bundles: replayed backlog first, then live
/// arrivals. Dropping it withdraws the interest.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    filter: SubscriptionFilter,
    registry: Arc<Mutex<RegistryInner>>,
    backlog: VecDeque<(BundleId, Bundle)>,
    replayed: HashSet<BundleId>,
    rx: broadcast::Receiver<Arc<BundleEvent>>,
}

impl Subscription {
    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    fn accept(&self, event: &BundleEvent) -> bool {
        !self.replayed.contains(&event.bundle_id) && self.filter.matches(&event.bundle)
    }

    /// Waits for the next matching bundle. `None` once the layer is gone.
    pub async fn next(&mut self) -> Option<Bundle> {
        if let Some((_, bundle)) = self.backlog.pop_front() {
            return Some(bundle);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accept(&event) => return Some(event.bundle.clone()),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscription lagged; bundles skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching bundle without waiting.
    pub fn try_next(&mut self) -> Option<Bundle> {
        if let Some((_, bundle)) = self.backlog.pop_front() {
            return Some(bundle);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.accept(&event) => return Some(event.bundle.clone()),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscription lagged; bundles skipped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.registry.lock() {
            inner.filters.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SubscriptionFilter, SubscriptionRegistry};
    use mule_codec::{create_bundle, Bundle, BundleOptions, Payload, TtlTable};
    use mule_core::BundleId;
    use mule_crypto::signing::Ed25519Signer;

    fn bundle(topic: &str, kind: &str, n: u8) -> (BundleId, Bundle) {
        let b = create_bundle(
            Payload::from_parts(kind, vec![n]).expect("payload"),
            BundleOptions {
                topic: Some(topic.into()),
                ..BundleOptions::default()
            },
            1_700_000_000,
            &TtlTable::default(),
            &Ed25519Signer::from_secret([4; 32]),
        )
        .expect("bundle should build");
        (b.id().expect("id"), b)
    }

    #[test]
    fn filter_matches_topic_and_payload_type() {
        let (_, b) = bundle("mutual-aid", "listing", 1);
        assert!(SubscriptionFilter::topic("Mutual-Aid").matches(&b));
        assert!(!SubscriptionFilter::topic("knowledge").matches(&b));
        assert!(SubscriptionFilter::payload_type("listing").matches(&b));
        assert!(!SubscriptionFilter::payload_type("discovery").matches(&b));
        assert!(SubscriptionFilter::default().matches(&b));
    }

    #[test]
    fn interest_lives_as_long_as_the_subscription() {
        let registry = SubscriptionRegistry::new(16);
        let (_, b) = bundle("market", "listing", 1);
        assert!(!registry.is_interested(&b));
        let sub = registry.subscribe(SubscriptionFilter::topic("market"), |_| Vec::new());
        assert!(registry.is_interested(&b));
        assert_eq!(registry.active(), 1);
        drop(sub);
        assert!(!registry.is_interested(&b));
    }

    #[tokio::test]
    async fn replay_then_live_without_duplicates() {
        let registry = SubscriptionRegistry::new(16);
        let old = bundle("market", "listing", 1);
        let fresh = bundle("market", "listing", 2);
        let other = bundle("weather", "listing", 3);

        let replay = vec![old.clone()];
        let mut sub = registry.subscribe(SubscriptionFilter::topic("market"), move |_| replay);
        registry.publish(old.0, old.1.clone());
        registry.publish(other.0, other.1.clone());
        registry.publish(fresh.0, fresh.1.clone());

        assert_eq!(sub.next().await, Some(old.1));
        assert_eq!(sub.next().await, Some(fresh.1));
        assert_eq!(sub.try_next(), None);
    }
}
