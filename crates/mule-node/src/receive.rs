use mule_codec::{
    create_bundle, decode_bundle_cbor, encode_bundle_cbor, validate_for_delivery, Bundle,
    CodecError, Payload, ValidationError,
};
use mule_core::{Audience, BundleId, NodeId, Priority, UnixSeconds, TOPIC_KNOWLEDGE};

use crate::config::NodeRole;
use crate::queue::{NewEntry, QueueError, QueueName};
use crate::service::BundleLayer;

/// Why an inbound bundle was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed(&'static str),
    Duplicate,
    Expired,
    /// Private bundle addressed to another node.
    NotRecipient,
    /// No subscription, no recipient match and no role-driven caching.
    NotInterested,
    /// At its hop limit and of no local interest.
    Saturated,
    BudgetExceeded,
    /// Signature invalid on a copy of a bundle already held under its id.
    Forged,
    /// Receipt from a node that may not acknowledge the referenced bundle.
    UnauthorizedReceipt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Stored in `inbox`.
    Accepted {
        bundle_id: BundleId,
        speculative: bool,
    },
    /// Signature failed; held in `quarantine` for audit only.
    Quarantined { bundle_id: BundleId },
    /// Receipt consumed; `delivered` reports whether the acknowledged
    /// bundle moved to `delivered`.
    ReceiptApplied {
        bundle_id: BundleId,
        acknowledges: BundleId,
        delivered: bool,
    },
    Dropped {
        bundle_id: Option<BundleId>,
        reason: DropReason,
    },
}

impl ReceiveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiveOutcome::Accepted { .. })
    }
}

fn malformed_reason(err: &CodecError) -> &'static str {
    match err {
        CodecError::InvalidBundle(reason) => reason,
        CodecError::Decode(_) => "undecodable frame",
        CodecError::Encode(_) => "bundle does not serialize",
        CodecError::Signing(_) => "unusable signer key",
    }
}

impl BundleLayer {
    /// Decodes and ingests one wire frame from `from` (`None` for local
    /// injection).
    pub fn receive_frame(&self, frame: &[u8], from: Option<NodeId>) -> ReceiveOutcome {
        self.stats_mut().received += 1;
        match decode_bundle_cbor(frame) {
            Ok(bundle) => self.ingest(bundle, frame.len() as u64, from),
            Err(err) => self.dropped(None, DropReason::Malformed(malformed_reason(&err)), from),
        }
    }

    /// Routes a decoded bundle: quarantine, drop, receipt handling or inbox.
    pub fn receive_bundle(&self, bundle: Bundle, from: Option<NodeId>) -> ReceiveOutcome {
        self.stats_mut().received += 1;
        let size_bytes = match encode_bundle_cbor(&bundle) {
            Ok(bytes) => bytes.len() as u64,
            Err(err) => {
                return self.dropped(None, DropReason::Malformed(malformed_reason(&err)), from)
            }
        };
        self.ingest(bundle, size_bytes, from)
    }

    fn ingest(&self, bundle: Bundle, size_bytes: u64, from: Option<NodeId>) -> ReceiveOutcome {
        let now = self.now();
        let bundle_id = match bundle.validate_schema().and_then(|_| bundle.id()) {
            Ok(id) => id,
            Err(err) => {
                return self.dropped(None, DropReason::Malformed(malformed_reason(&err)), from)
            }
        };

        // The id excludes the signature: a held id says nothing about this
        // copy, and a forged copy may sit in quarantine under the genuine id.
        let quarantined_copy = match self.queues().queue_of(&bundle_id) {
            Some(QueueName::Quarantine) => true,
            Some(_) => {
                if !matches!(bundle.verify_signature(&self.inner.verifier), Ok(true)) {
                    return self.reject_forged_copy(bundle_id, &bundle, from);
                }
                self.stats_mut().duplicates += 1;
                tracing::debug!(bundle_id = %bundle_id, "duplicate bundle ignored");
                return ReceiveOutcome::Dropped {
                    bundle_id: Some(bundle_id),
                    reason: DropReason::Duplicate,
                };
            }
            None => false,
        };

        match validate_for_delivery(&bundle, now, &self.inner.verifier) {
            Ok(_) => {}
            Err(ValidationError::SignatureInvalid) => {
                return self.quarantine(bundle_id, bundle, size_bytes, from, quarantined_copy, now)
            }
            Err(ValidationError::Expired) => {
                return self.dropped(Some(bundle_id), DropReason::Expired, from)
            }
            Err(ValidationError::Malformed(reason)) => {
                return self.dropped(Some(bundle_id), DropReason::Malformed(reason), from)
            }
            Err(ValidationError::HopLimitReached) => {
                return self.dropped(Some(bundle_id), DropReason::Saturated, from)
            }
        }
        if quarantined_copy {
            if let Err(err) = self.queues().delete(bundle_id) {
                tracing::debug!(bundle_id = %bundle_id, error = %err, "quarantined copy already gone");
            }
        }

        let local = self.node_id();
        if bundle.audience == Audience::Private && bundle.recipient != Some(local) {
            return self.dropped(Some(bundle_id), DropReason::NotRecipient, from);
        }
        if let Payload::Receipt { acknowledges } = bundle.payload {
            if bundle.recipient == Some(local) {
                return self.apply_receipt(bundle_id, acknowledges, bundle.signer_id, from, now);
            }
        }

        let addressed = bundle.recipient == Some(local);
        let subscribed = self.subscriptions().is_interested(&bundle);
        let control = matches!(
            bundle.payload,
            Payload::Vouch { .. } | Payload::Revocation { .. }
        );
        let interested = addressed || subscribed || control;
        let speculative = !interested && self.speculative_eligible(&bundle);
        if !interested && !speculative {
            return self.dropped(Some(bundle_id), DropReason::NotInterested, from);
        }
        if bundle.hop_limit_reached() && !interested {
            self.stats_mut().saturated += 1;
            return self.dropped(Some(bundle_id), DropReason::Saturated, from);
        }

        let limits = self.budget().storage_limits();
        let admitted = self.queues().admit(
            NewEntry {
                bundle_id,
                bundle: bundle.clone(),
                queue: QueueName::Inbox,
                size_bytes,
                speculative,
                received_from: from,
            },
            now,
            limits,
        );
        match admitted {
            Ok(admitted) => self.note_evictions(&admitted.evicted),
            Err(QueueError::BudgetExceeded { used, budget }) => {
                self.stats_mut().rejected += 1;
                tracing::debug!(bundle_id = %bundle_id, used, budget, "inbound bundle rejected at capacity");
                return self.dropped(Some(bundle_id), DropReason::BudgetExceeded, from);
            }
            Err(_) => return self.dropped(Some(bundle_id), DropReason::Duplicate, from),
        }

        if let Some(peer) = from {
            self.trust().record_received(peer, 1);
        }
        self.apply_control(&bundle, now);
        {
            let mut stats = self.stats_mut();
            stats.accepted += 1;
            if speculative {
                stats.speculative += 1;
            }
        }
        tracing::debug!(
            bundle_id = %bundle_id,
            priority = ?bundle.priority,
            speculative,
            from = ?from.map(|p| p.short()),
            "bundle accepted"
        );

        let wants_receipt = bundle.receipt_policy.wants_receipt()
            && bundle.signer_id != local
            && (addressed || (bundle.recipient.is_none() && subscribed));
        if wants_receipt {
            self.emit_receipt(bundle_id, &bundle);
        }
        if !speculative {
            self.subscriptions().publish(bundle_id, bundle);
        }
        ReceiveOutcome::Accepted {
            bundle_id,
            speculative,
        }
    }

    fn speculative_eligible(&self, bundle: &Bundle) -> bool {
        let role_wants = match self.config().role {
            NodeRole::Bridge => bundle.priority == Priority::Emergency,
            NodeRole::Library => bundle.topic.as_deref() == Some(TOPIC_KNOWLEDGE),
            NodeRole::Client => false,
        };
        role_wants && self.budget().allows_speculative_caching()
    }

    fn quarantine(
        &self,
        bundle_id: BundleId,
        bundle: Bundle,
        size_bytes: u64,
        from: Option<NodeId>,
        already_held: bool,
        now: UnixSeconds,
    ) -> ReceiveOutcome {
        if let Some(peer) = from {
            self.trust().record_verification_failure(peer);
        }
        self.stats_mut().quarantined += 1;
        tracing::warn!(
            bundle_id = %bundle_id,
            signer = %bundle.signer_id.short(),
            from = ?from.map(|p| p.short()),
            "signature invalid; bundle quarantined"
        );
        if already_held {
            return ReceiveOutcome::Quarantined { bundle_id };
        }
        let limits = self.budget().storage_limits();
        let admitted = self.queues().admit(
            NewEntry {
                bundle_id,
                bundle,
                queue: QueueName::Quarantine,
                size_bytes,
                speculative: false,
                received_from: from,
            },
            now,
            limits,
        );
        match admitted {
            Ok(admitted) => {
                self.note_evictions(&admitted.evicted);
                ReceiveOutcome::Quarantined { bundle_id }
            }
            Err(_) => ReceiveOutcome::Dropped {
                bundle_id: Some(bundle_id),
                reason: DropReason::BudgetExceeded,
            },
        }
    }

    fn reject_forged_copy(
        &self,
        bundle_id: BundleId,
        bundle: &Bundle,
        from: Option<NodeId>,
    ) -> ReceiveOutcome {
        if let Some(peer) = from {
            self.trust().record_verification_failure(peer);
        }
        self.stats_mut().quarantined += 1;
        tracing::warn!(
            bundle_id = %bundle_id,
            signer = %bundle.signer_id.short(),
            from = ?from.map(|p| p.short()),
            "signature invalid on copy of held bundle"
        );
        self.dropped(Some(bundle_id), DropReason::Forged, from)
    }

    /// Only bundles this node originated with a receipt policy can be
    /// acknowledged, and only by their recipient when they name one.
    fn receipt_authorized(&self, original: &Bundle, receipt_signer: NodeId) -> bool {
        original.signer_id == self.node_id()
            && original.receipt_policy.wants_receipt()
            && original.recipient.map_or(true, |r| r == receipt_signer)
    }

    fn apply_receipt(
        &self,
        bundle_id: BundleId,
        acknowledges: BundleId,
        receipt_signer: NodeId,
        from: Option<NodeId>,
        now: UnixSeconds,
    ) -> ReceiveOutcome {
        let authorized = self
            .queues()
            .get(&acknowledges)
            .map_or(true, |stored| self.receipt_authorized(&stored.bundle, receipt_signer));
        if !authorized {
            tracing::warn!(
                acknowledges = %acknowledges,
                signer = %receipt_signer.short(),
                "receipt from unauthorized signer ignored"
            );
            return self.dropped(Some(bundle_id), DropReason::UnauthorizedReceipt, from);
        }
        if let Some(peer) = from {
            self.trust().record_received(peer, 1);
        }
        let delivered = self
            .queues()
            .move_bundle(acknowledges, QueueName::Pending, QueueName::Delivered, now)
            .is_ok();
        if delivered {
            self.stats_mut().receipts += 1;
            tracing::info!(bundle_id = %acknowledges, "receipt received; bundle delivered");
            if let Some(stored) = self.queues().get(&acknowledges) {
                self.subscriptions().publish(acknowledges, stored.bundle);
            }
        } else {
            tracing::debug!(bundle_id = %acknowledges, "receipt for bundle not awaiting one");
        }
        ReceiveOutcome::ReceiptApplied {
            bundle_id,
            acknowledges,
            delivered,
        }
    }

    /// Applies vouch and revocation bundles to the local trust graph. The
    /// bundle signer acts as voucher or revoker.
    fn apply_control(&self, bundle: &Bundle, now: UnixSeconds) {
        let signer = bundle.signer_id;
        let result = match &bundle.payload {
            Payload::Vouch { vouchee } => self.trust().vouch(signer, *vouchee, now).map(|_| ()),
            Payload::Revocation {
                voucher,
                vouchee,
                reason,
            } => self
                .trust()
                .revoke(signer, *voucher, *vouchee, reason, now)
                .map(|_| ()),
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!(signer = %signer.short(), error = %err, "trust update ignored");
        }
    }

    fn emit_receipt(&self, acknowledges: BundleId, original: &Bundle) {
        let receipt = create_bundle(
            Payload::Receipt { acknowledges },
            self.receipt_options(original),
            self.now(),
            &self.config().ttl,
            &self.inner.signer,
        );
        let result = receipt.map_err(|e| e.to_string()).and_then(|receipt| {
            let bundle_id = receipt.id().map_err(|e| e.to_string())?;
            let size_bytes = encode_bundle_cbor(&receipt)
                .map_err(|e| e.to_string())?
                .len() as u64;
            self.queues()
                .enqueue(
                    NewEntry {
                        bundle_id,
                        bundle: receipt,
                        queue: QueueName::Outbox,
                        size_bytes,
                        speculative: false,
                        received_from: None,
                    },
                    self.now(),
                )
                .map_err(|e| e.to_string())
        });
        match result {
            Ok(entry) => tracing::debug!(
                bundle_id = %entry.bundle_id,
                acknowledges = %acknowledges,
                "receipt queued"
            ),
            Err(err) => tracing::warn!(acknowledges = %acknowledges, error = %err, "receipt not queued"),
        }
    }

    fn dropped(
        &self,
        bundle_id: Option<BundleId>,
        reason: DropReason,
        from: Option<NodeId>,
    ) -> ReceiveOutcome {
        if reason != DropReason::Saturated {
            self.stats_mut().dropped += 1;
        }
        tracing::debug!(
            bundle_id = ?bundle_id,
            ?reason,
            from = ?from.map(|p| p.short()),
            "inbound bundle dropped"
        );
        ReceiveOutcome::Dropped { bundle_id, reason }
    }
}
