use mule_core::{BundleId, UnixSeconds};
use serde::{Deserialize, Serialize};

use crate::queue::{ExpiryReason, QueueName, QueueStore};

/// Result of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Active bundles moved to `expired` because their TTL ran out.
    pub expired: Vec<BundleId>,
    /// Terminal entries removed after the audit window.
    pub purged: Vec<BundleId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.purged.is_empty()
    }
}

/// Runs one reaper pass at `now`.
///
/// Idempotent: entries another task already moved or removed are skipped.
pub fn reap(store: &QueueStore, now: UnixSeconds, audit_retention_secs: u64) -> ReapReport {
    let mut report = ReapReport::default();

    let due = store.select_ids(
        &[QueueName::Inbox, QueueName::Outbox, QueueName::Pending],
        |s| s.bundle.is_expired(now),
    );
    for id in due {
        if store.expire(id, ExpiryReason::Ttl, now).is_ok() {
            tracing::debug!(bundle_id = %id, "bundle expired");
            report.expired.push(id);
        }
    }

    let stale = store.select_ids(&[QueueName::Expired, QueueName::Quarantine], |s| {
        s.entry.enqueued_at.saturating_add(audit_retention_secs) <= now
    });
    for id in stale {
        if store.delete(id).is_ok() {
            report.purged.push(id);
        }
    }

    if !report.is_empty() {
        tracing::info!(
            expired = report.expired.len(),
            purged = report.purged.len(),
            "reaper pass"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::reap;
    use crate::queue::{ExpiryReason, NewEntry, QueueName, QueueStore};
    use mule_codec::{create_bundle, BundleOptions, Payload, TtlTable};
    use mule_core::clock::{DAY, HOUR};
    use mule_core::BundleId;
    use mule_crypto::signing::Ed25519Signer;

    const NOW: u64 = 1_700_000_000;
    const AUDIT: u64 = 7 * DAY;

    fn put(store: &QueueStore, n: u8, queue: QueueName, ttl: u64) -> BundleId {
        let bundle = create_bundle(
            Payload::from_parts("listing", vec![n]).expect("payload"),
            BundleOptions {
                ttl_secs: Some(ttl),
                ..BundleOptions::default()
            },
            NOW,
            &TtlTable::default(),
            &Ed25519Signer::from_secret([n; 32]),
        )
        .expect("bundle should build");
        let bundle_id = bundle.id().expect("id");
        store
            .enqueue(
                NewEntry {
                    bundle_id,
                    bundle,
                    queue,
                    size_bytes: 10,
                    speculative: false,
                    received_from: None,
                },
                NOW,
            )
            .expect("enqueue should succeed");
        bundle_id
    }

    #[test]
    fn expires_due_bundles_from_active_queues() {
        let store = QueueStore::new();
        let short = put(&store, 1, QueueName::Outbox, HOUR);
        let long = put(&store, 2, QueueName::Inbox, DAY);

        let report = reap(&store, NOW + HOUR - 1, AUDIT);
        assert!(report.is_empty());

        let report = reap(&store, NOW + HOUR, AUDIT);
        assert_eq!(report.expired, vec![short]);
        assert_eq!(store.queue_of(&short), Some(QueueName::Expired));
        assert_eq!(
            store.get(&short).expect("still held").expiry_reason,
            Some(ExpiryReason::Ttl)
        );
        assert_eq!(store.queue_of(&long), Some(QueueName::Inbox));

        // Second pass at the same instant changes nothing.
        assert!(reap(&store, NOW + HOUR, AUDIT).is_empty());
    }

    #[test]
    fn purges_terminal_entries_after_audit_window() {
        let store = QueueStore::new();
        let bad = put(&store, 3, QueueName::Quarantine, 30 * DAY);
        let gone = put(&store, 4, QueueName::Outbox, HOUR);
        reap(&store, NOW + HOUR, AUDIT);

        let report = reap(&store, NOW + AUDIT, AUDIT);
        assert_eq!(report.purged, vec![bad]);
        assert!(store.contains(&gone));

        let report = reap(&store, NOW + HOUR + AUDIT, AUDIT);
        assert_eq!(report.purged, vec![gone]);
        assert!(!store.contains(&gone));
    }
}
