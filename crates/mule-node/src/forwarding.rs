use mule_core::{Audience, BundleId, NodeId, Priority, UnixSeconds};

use crate::budget::{CacheBudget, PowerMode};
use crate::config::{LocalScope, NodeRole};
use crate::queue::StoredBundle;

/// A currently reachable peer as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContact {
    pub peer_id: NodeId,
    /// Mesh hops to the peer; 1 for a neighbour.
    pub hop_distance: u8,
    /// Access point the peer is attached to, if known.
    pub access_point: Option<String>,
    /// True for a point-to-point link with no relay in between.
    pub direct: bool,
}

impl PeerContact {
    /// Directly linked neighbour with no access-point information.
    pub fn direct(peer_id: NodeId) -> Self {
        Self {
            peer_id,
            hop_distance: 1,
            access_point: None,
            direct: true,
        }
    }
}

/// Why a bundle was not offered to a peer this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    ReceiveOnly,
    EmergencyOnly,
    HopLimitReached,
    Expired,
    ReceivedFromPeer,
    PeerIsSigner,
    OutsideLocalScope,
    InsufficientTrust,
    NotRecipient,
    NotDirect,
    BandwidthDeferred,
}

/// Per-bundle, per-peer outcome. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Transmit,
    Skip(SkipReason),
}

/// Everything the engine reads besides the bundle and the peer.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingContext<'a> {
    pub now: UnixSeconds,
    pub role: NodeRole,
    pub local_scope: LocalScope,
    pub local_access_point: Option<&'a str>,
    pub trusted_threshold: f64,
    pub budget: &'a CacheBudget,
}

/// Strict forwarding rank; lower goes first.
pub fn forwarding_rank(priority: Priority, audience: Audience) -> u8 {
    match (priority, audience) {
        (Priority::Emergency, _) => 0,
        (Priority::Perishable, _) => 1,
        (Priority::Normal, Audience::Trusted | Audience::Private) => 2,
        (Priority::Normal, Audience::Public | Audience::Local) => 3,
        (Priority::Low, _) => 4,
    }
}

fn within_local_scope(ctx: &ForwardingContext<'_>, peer: &PeerContact) -> bool {
    match ctx.local_scope {
        LocalScope::HopRadius { radius } => peer.hop_distance <= radius,
        LocalScope::SameAccessPoint => match (ctx.local_access_point, &peer.access_point) {
            (Some(local), Some(remote)) => local == remote,
            _ => false,
        },
    }
}

/// Decides whether `stored` may go to `peer` right now.
///
/// Checks run in order: power, hop limit, expiry, loop avoidance, audience,
/// bandwidth. The first failing check names the skip reason.
pub fn decide(
    stored: &StoredBundle,
    peer: &PeerContact,
    peer_trust: f64,
    ctx: &ForwardingContext<'_>,
) -> ForwardDecision {
    let bundle = &stored.bundle;
    match ctx.budget.power_mode() {
        PowerMode::ReceiveOnly => return ForwardDecision::Skip(SkipReason::ReceiveOnly),
        mode if !mode.may_transmit(bundle.priority) => {
            return ForwardDecision::Skip(SkipReason::EmergencyOnly)
        }
        _ => {}
    }
    if bundle.hop_limit_reached() {
        return ForwardDecision::Skip(SkipReason::HopLimitReached);
    }
    if bundle.is_expired(ctx.now) {
        return ForwardDecision::Skip(SkipReason::Expired);
    }
    if stored.received_from == Some(peer.peer_id) {
        return ForwardDecision::Skip(SkipReason::ReceivedFromPeer);
    }
    if bundle.signer_id == peer.peer_id {
        return ForwardDecision::Skip(SkipReason::PeerIsSigner);
    }

    let bridge_push = ctx.role == NodeRole::Bridge && bundle.priority == Priority::Emergency;
    match bundle.audience {
        Audience::Public => {}
        Audience::Local => {
            if !bridge_push && !within_local_scope(ctx, peer) {
                return ForwardDecision::Skip(SkipReason::OutsideLocalScope);
            }
        }
        Audience::Trusted => {
            if peer_trust < ctx.trusted_threshold {
                return ForwardDecision::Skip(SkipReason::InsufficientTrust);
            }
        }
        Audience::Private => {
            if bundle.recipient != Some(peer.peer_id) {
                return ForwardDecision::Skip(SkipReason::NotRecipient);
            }
            if !peer.direct {
                return ForwardDecision::Skip(SkipReason::NotDirect);
            }
        }
    }

    if ctx.budget.should_defer(bundle.priority, ctx.now) {
        return ForwardDecision::Skip(SkipReason::BandwidthDeferred);
    }
    ForwardDecision::Transmit
}

/// Ordered offer list for one peer contact.
#[derive(Debug, Clone, Default)]
pub struct ForwardPlan {
    /// Bundles to offer, most urgent first.
    pub transmit: Vec<StoredBundle>,
    pub skipped: Vec<(BundleId, SkipReason)>,
}

impl ForwardPlan {
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|(_, r)| *r == reason).count()
    }
}

/// Runs [`decide`] over `pending` and orders the survivors by rank, then age.
///
/// Bytes already planned for this contact count toward the bandwidth
/// window, so one contact cannot carry budgeted traffic past the deferral
/// threshold.
pub fn plan_for_peer(
    pending: Vec<StoredBundle>,
    peer: &PeerContact,
    peer_trust: f64,
    ctx: &ForwardingContext<'_>,
    max_offer: usize,
) -> ForwardPlan {
    let mut plan = ForwardPlan::default();
    let mut eligible = Vec::new();
    for stored in pending {
        match decide(&stored, peer, peer_trust, ctx) {
            ForwardDecision::Transmit => eligible.push(stored),
            ForwardDecision::Skip(reason) => plan.skipped.push((stored.entry.bundle_id, reason)),
        }
    }
    eligible.sort_by_key(|s| {
        (
            forwarding_rank(s.bundle.priority, s.bundle.audience),
            s.bundle.created_at,
            s.entry.bundle_id,
        )
    });

    let mut planned_bytes = 0_u64;
    for stored in eligible {
        if plan.transmit.len() >= max_offer {
            break;
        }
        if ctx
            .budget
            .should_defer_after(stored.bundle.priority, ctx.now, planned_bytes)
        {
            plan.skipped
                .push((stored.entry.bundle_id, SkipReason::BandwidthDeferred));
            continue;
        }
        planned_bytes = planned_bytes.saturating_add(stored.entry.size_bytes);
        plan.transmit.push(stored);
    }
    plan
}
