use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use mule_core::{NodeId, UnixSeconds};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables for vouch-chain trust computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Multiplier applied per vouch hop away from a genesis node.
    pub decay: f64,
    /// Longest vouch chain considered.
    pub max_depth: usize,
    /// Distinct co-vouchers needed to revoke an edge on the voucher's behalf.
    pub revocation_quorum: usize,
    pub memo_capacity: usize,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            decay: 0.8,
            max_depth: 8,
            revocation_quorum: 2,
            memo_capacity: 1024,
        }
    }
}

/// Directed trust edge. Only `revoked*` fields ever change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vouch {
    pub voucher: NodeId,
    pub vouchee: NodeId,
    pub created_at: UnixSeconds,
    pub revoked: bool,
    pub revoked_at: Option<UnixSeconds>,
    pub revoked_reason: Option<String>,
}

/// Per-peer contact counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: NodeId,
    pub last_seen_at: Option<UnixSeconds>,
    pub bundles_sent_count: u64,
    pub bundles_received_count: u64,
    pub verification_failure_count: u64,
}

impl PeerRecord {
    fn new(peer_id: NodeId) -> Self {
        Self {
            peer_id,
            last_seen_at: None,
            bundles_sent_count: 0,
            bundles_received_count: 0,
            verification_failure_count: 0,
        }
    }
}

/// Peer record joined with its computed trust score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    pub record: PeerRecord,
    pub trust_score: f64,
}

/// Structured breakdown of a trust score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustExplanation {
    pub node: NodeId,
    pub score: f64,
    pub genesis: bool,
    /// Best vouch chain, genesis first, ending at `node`. Empty when unreachable.
    pub path: Vec<NodeId>,
    pub active_vouchers: usize,
    pub revoked_vouchers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
    /// Vote recorded; quorum not reached yet.
    Pending {
        votes: usize,
        quorum: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrustError {
    #[error("node cannot vouch for itself")]
    SelfVouch,
    #[error("no vouch from {voucher} for {vouchee}")]
    UnknownVouch { voucher: NodeId, vouchee: NodeId },
    #[error("{revoker} may not revoke vouches issued by {voucher}")]
    Unauthorized { revoker: NodeId, voucher: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RevocationVotes {
    voucher: NodeId,
    vouchee: NodeId,
    voters: Vec<NodeId>,
}

/// Serializable trust store contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustSnapshot {
    config: TrustConfig,
    genesis: Vec<NodeId>,
    vouches: Vec<Vouch>,
    revocation_votes: Vec<RevocationVotes>,
    peers: Vec<PeerRecord>,
}

/// Vouch graph, genesis anchors and peer records.
///
/// Scores are never stored: each is the best attenuated path to a genesis
/// node, memoized until the next graph mutation.
#[derive(Debug)]
pub struct TrustStore {
    config: TrustConfig,
    genesis: BTreeSet<NodeId>,
    vouches: HashMap<(NodeId, NodeId), Vouch>,
    // vouchee -> vouchers with an active edge
    incoming: HashMap<NodeId, BTreeSet<NodeId>>,
    revocation_votes: HashMap<(NodeId, NodeId), BTreeSet<NodeId>>,
    peers: HashMap<NodeId, PeerRecord>,
    memo: LruCache<NodeId, Vec<NodeId>>,
}

impl TrustStore {
    pub fn new(config: TrustConfig) -> Self {
        let capacity = NonZeroUsize::new(config.memo_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            genesis: BTreeSet::new(),
            vouches: HashMap::new(),
            incoming: HashMap::new(),
            revocation_votes: HashMap::new(),
            peers: HashMap::new(),
            memo: LruCache::new(capacity),
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Marks `node` as a trust anchor (score 1.0).
    pub fn add_genesis(&mut self, node: NodeId) -> bool {
        let added = self.genesis.insert(node);
        if added {
            self.memo.clear();
        }
        added
    }

    pub fn genesis(&self) -> Vec<NodeId> {
        self.genesis.iter().copied().collect()
    }

    pub fn is_genesis(&self, node: &NodeId) -> bool {
        self.genesis.contains(node)
    }

    /// Records an active vouch edge. Re-vouching after a revocation
    /// replaces the revoked record. Returns false if already active.
    pub fn vouch(
        &mut self,
        voucher: NodeId,
        vouchee: NodeId,
        now: UnixSeconds,
    ) -> Result<bool, TrustError> {
        if voucher == vouchee {
            return Err(TrustError::SelfVouch);
        }
        if self
            .vouches
            .get(&(voucher, vouchee))
            .is_some_and(|v| !v.revoked)
        {
            return Ok(false);
        }
        self.vouches.insert(
            (voucher, vouchee),
            Vouch {
                voucher,
                vouchee,
                created_at: now,
                revoked: false,
                revoked_at: None,
                revoked_reason: None,
            },
        );
        self.incoming.entry(vouchee).or_default().insert(voucher);
        self.revocation_votes.remove(&(voucher, vouchee));
        self.memo.clear();
        tracing::debug!(voucher = %voucher.short(), vouchee = %vouchee.short(), "vouch recorded");
        Ok(true)
    }

    /// Requests revocation of `voucher -> vouchee` on behalf of `revoker`.
    ///
    /// The voucher revokes immediately; anyone holding an active vouch for
    /// the voucher casts one vote toward the configured quorum.
    pub fn revoke(
        &mut self,
        revoker: NodeId,
        voucher: NodeId,
        vouchee: NodeId,
        reason: &str,
        now: UnixSeconds,
    ) -> Result<RevokeOutcome, TrustError> {
        let Some(existing) = self.vouches.get(&(voucher, vouchee)) else {
            return Err(TrustError::UnknownVouch { voucher, vouchee });
        };
        if existing.revoked {
            return Ok(RevokeOutcome::AlreadyRevoked);
        }

        if revoker != voucher {
            if !self.is_active(revoker, voucher) {
                return Err(TrustError::Unauthorized { revoker, voucher });
            }
            let voters = self
                .revocation_votes
                .entry((voucher, vouchee))
                .or_default();
            voters.insert(revoker);
            let votes = voters.len();
            if votes < self.config.revocation_quorum {
                return Ok(RevokeOutcome::Pending {
                    votes,
                    quorum: self.config.revocation_quorum,
                });
            }
        }

        if let Some(edge) = self.vouches.get_mut(&(voucher, vouchee)) {
            edge.revoked = true;
            edge.revoked_at = Some(now);
            edge.revoked_reason = Some(reason.to_string());
        }
        if let Some(set) = self.incoming.get_mut(&vouchee) {
            set.remove(&voucher);
            if set.is_empty() {
                self.incoming.remove(&vouchee);
            }
        }
        self.revocation_votes.remove(&(voucher, vouchee));
        self.memo.clear();
        tracing::info!(
            voucher = %voucher.short(),
            vouchee = %vouchee.short(),
            revoker = %revoker.short(),
            reason,
            "vouch revoked"
        );
        Ok(RevokeOutcome::Revoked)
    }

    fn is_active(&self, voucher: NodeId, vouchee: NodeId) -> bool {
        self.incoming
            .get(&vouchee)
            .is_some_and(|set| set.contains(&voucher))
    }

    pub fn vouch_record(&self, voucher: NodeId, vouchee: NodeId) -> Option<&Vouch> {
        self.vouches.get(&(voucher, vouchee))
    }

    /// Breadth-first search backwards along active edges; the first genesis
    /// reached is the best path since decay is uniform per hop.
    fn search_best_path(&self, node: NodeId) -> Vec<NodeId> {
        if self.genesis.contains(&node) {
            return vec![node];
        }
        let mut toward_target: HashMap<NodeId, NodeId> = HashMap::new();
        let mut visited: HashSet<NodeId> = HashSet::from([node]);
        let mut frontier: VecDeque<(NodeId, usize)> = VecDeque::from([(node, 0)]);

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= self.config.max_depth {
                continue;
            }
            let Some(vouchers) = self.incoming.get(&current) else {
                continue;
            };
            for voucher in vouchers {
                if !visited.insert(*voucher) {
                    continue;
                }
                toward_target.insert(*voucher, current);
                if self.genesis.contains(voucher) {
                    let mut path = vec![*voucher];
                    let mut cursor = *voucher;
                    while let Some(next) = toward_target.get(&cursor) {
                        path.push(*next);
                        cursor = *next;
                    }
                    return path;
                }
                frontier.push_back((*voucher, depth + 1));
            }
        }
        Vec::new()
    }

    fn best_path(&mut self, node: NodeId) -> Vec<NodeId> {
        if let Some(path) = self.memo.get(&node) {
            return path.clone();
        }
        let path = self.search_best_path(node);
        self.memo.put(node, path.clone());
        path
    }

    fn score_for_path(&self, path: &[NodeId]) -> f64 {
        match path.len() {
            0 => 0.0,
            len => self.config.decay.powi((len - 1) as i32),
        }
    }

    /// Trust in `[0.0, 1.0]`; 0.0 when no active chain reaches a genesis node.
    pub fn trust(&mut self, node: NodeId) -> f64 {
        let path = self.best_path(node);
        self.score_for_path(&path)
    }

    pub fn explain(&mut self, node: NodeId) -> TrustExplanation {
        let path = self.best_path(node);
        let (mut active_vouchers, mut revoked_vouchers) = (0, 0);
        for vouch in self.vouches.values().filter(|v| v.vouchee == node) {
            if vouch.revoked {
                revoked_vouchers += 1;
            } else {
                active_vouchers += 1;
            }
        }
        TrustExplanation {
            node,
            score: self.score_for_path(&path),
            genesis: self.genesis.contains(&node),
            path,
            active_vouchers,
            revoked_vouchers,
        }
    }

    fn peer_mut(&mut self, peer: NodeId) -> &mut PeerRecord {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerRecord::new(peer))
    }

    pub fn record_seen(&mut self, peer: NodeId, now: UnixSeconds) {
        self.peer_mut(peer).last_seen_at = Some(now);
    }

    pub fn record_sent(&mut self, peer: NodeId, bundles: u64) {
        let record = self.peer_mut(peer);
        record.bundles_sent_count = record.bundles_sent_count.saturating_add(bundles);
    }

    pub fn record_received(&mut self, peer: NodeId, bundles: u64) {
        let record = self.peer_mut(peer);
        record.bundles_received_count = record.bundles_received_count.saturating_add(bundles);
    }

    pub fn record_verification_failure(&mut self, peer: NodeId) {
        let record = self.peer_mut(peer);
        record.verification_failure_count = record.verification_failure_count.saturating_add(1);
    }

    pub fn peer(&mut self, peer: NodeId) -> Option<PeerView> {
        let record = self.peers.get(&peer)?.clone();
        Some(PeerView {
            trust_score: self.trust(peer),
            record,
        })
    }

    pub fn peers(&mut self) -> Vec<PeerView> {
        let mut ids: Vec<NodeId> = self.peers.keys().copied().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.peer(id)).collect()
    }

    pub fn snapshot(&self) -> TrustSnapshot {
        let mut vouches: Vec<Vouch> = self.vouches.values().cloned().collect();
        vouches.sort_by_key(|v| (v.voucher, v.vouchee));
        let mut revocation_votes: Vec<RevocationVotes> = self
            .revocation_votes
            .iter()
            .map(|((voucher, vouchee), voters)| RevocationVotes {
                voucher: *voucher,
                vouchee: *vouchee,
                voters: voters.iter().copied().collect(),
            })
            .collect();
        revocation_votes.sort_by_key(|r| (r.voucher, r.vouchee));
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.peer_id);
        TrustSnapshot {
            config: self.config,
            genesis: self.genesis.iter().copied().collect(),
            vouches,
            revocation_votes,
            peers,
        }
    }

    /// Rebuilds a store from `snapshot` under the running `config`; the
    /// tunables recorded in the snapshot are informational only.
    pub fn from_snapshot(config: TrustConfig, snapshot: TrustSnapshot) -> Self {
        let mut store = Self::new(config);
        store.genesis = snapshot.genesis.into_iter().collect();
        for vouch in snapshot.vouches {
            if !vouch.revoked {
                store
                    .incoming
                    .entry(vouch.vouchee)
                    .or_default()
                    .insert(vouch.voucher);
            }
            store.vouches.insert((vouch.voucher, vouch.vouchee), vouch);
        }
        for votes in snapshot.revocation_votes {
            store
                .revocation_votes
                .insert((votes.voucher, votes.vouchee), votes.voters.into_iter().collect());
        }
        store.peers = snapshot
            .peers
            .into_iter()
            .map(|p| (p.peer_id, p))
            .collect();
        store
    }

    /// Exports the complete trust state as JSON.
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Imports the trust graph and peer records from JSON.
    pub fn import_json(config: TrustConfig, json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_snapshot(config, serde_json::from_str(json)?))
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new(TrustConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::{RevokeOutcome, TrustConfig, TrustError, TrustStore};
    use mule_core::NodeId;

    const ALICE: NodeId = NodeId([0xA1; 32]);
    const BOB: NodeId = NodeId([0xB0; 32]);
    const CAROL: NodeId = NodeId([0xC0; 32]);
    const DAVE: NodeId = NodeId([0xD0; 32]);
    const ERIN: NodeId = NodeId([0xE0; 32]);

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn genesis_vouch_then_revoke_drops_to_zero() {
        let mut store = TrustStore::default();
        store.add_genesis(ALICE);
        assert!(approx(store.trust(ALICE), 1.0));
        store.vouch(ALICE, BOB, 10).expect("vouch should apply");
        assert!(approx(store.trust(BOB), 0.8));

        let outcome = store
            .revoke(ALICE, ALICE, BOB, "lost device", 20)
            .expect("voucher may revoke");
        assert_eq!(outcome, RevokeOutcome::Revoked);
        assert!(approx(store.trust(BOB), 0.0));

        let record = store.vouch_record(ALICE, BOB).expect("edge is kept");
        assert!(record.revoked);
        assert_eq!(record.revoked_at, Some(20));
        assert_eq!(record.revoked_reason.as_deref(), Some("lost device"));
    }

    #[test]
    fn revoking_one_path_keeps_the_other() {
        let mut store = TrustStore::default();
        store.add_genesis(ALICE);
        store.vouch(ALICE, CAROL, 1).expect("vouch");
        store.vouch(ALICE, BOB, 1).expect("vouch");
        store.vouch(CAROL, BOB, 1).expect("vouch");
        assert!(approx(store.trust(BOB), 0.8));

        store
            .revoke(ALICE, ALICE, BOB, "", 2)
            .expect("voucher may revoke");
        assert!(approx(store.trust(BOB), 0.64));
        assert_eq!(store.explain(BOB).path, vec![ALICE, CAROL, BOB]);
    }

    #[test]
    fn independent_genesis_paths_survive_revocation() {
        let mut store = TrustStore::default();
        store.add_genesis(ALICE);
        store.add_genesis(DAVE);
        store.vouch(ALICE, BOB, 1).expect("vouch");
        store.vouch(DAVE, BOB, 1).expect("vouch");
        store.revoke(ALICE, ALICE, BOB, "", 2).expect("revoke");
        assert!(approx(store.trust(BOB), 0.8));
    }

    #[test]
    fn cycles_and_depth_are_bounded() {
        let mut store = TrustStore::new(TrustConfig {
            max_depth: 2,
            ..TrustConfig::default()
        });
        store.vouch(BOB, CAROL, 1).expect("vouch");
        store.vouch(CAROL, BOB, 1).expect("vouch");
        assert!(approx(store.trust(BOB), 0.0));

        store.add_genesis(ALICE);
        store.vouch(ALICE, DAVE, 1).expect("vouch");
        store.vouch(DAVE, ERIN, 1).expect("vouch");
        store.vouch(ERIN, BOB, 1).expect("vouch");
        assert!(approx(store.trust(ERIN), 0.64));
        assert!(approx(store.trust(BOB), 0.0));
    }

    #[test]
    fn quorum_revocation_needs_distinct_co_vouchers() {
        let mut store = TrustStore::default();
        store.add_genesis(ALICE);
        store.vouch(ALICE, BOB, 1).expect("vouch");
        store.vouch(CAROL, ALICE, 1).expect("vouch");
        store.vouch(DAVE, ALICE, 1).expect("vouch");

        assert_eq!(
            store.revoke(ERIN, ALICE, BOB, "spam", 2),
            Err(TrustError::Unauthorized {
                revoker: ERIN,
                voucher: ALICE
            })
        );
        assert_eq!(
            store.revoke(CAROL, ALICE, BOB, "spam", 2),
            Ok(RevokeOutcome::Pending { votes: 1, quorum: 2 })
        );
        assert_eq!(
            store.revoke(CAROL, ALICE, BOB, "spam", 3),
            Ok(RevokeOutcome::Pending { votes: 1, quorum: 2 })
        );
        assert_eq!(
            store.revoke(DAVE, ALICE, BOB, "spam", 4),
            Ok(RevokeOutcome::Revoked)
        );
        assert!(approx(store.trust(BOB), 0.0));
        assert_eq!(
            store.revoke(ALICE, ALICE, BOB, "again", 5),
            Ok(RevokeOutcome::AlreadyRevoked)
        );
    }

    #[test]
    fn revoke_unknown_edge_and_self_vouch_fail() {
        let mut store = TrustStore::default();
        assert!(matches!(
            store.revoke(ALICE, ALICE, BOB, "", 1),
            Err(TrustError::UnknownVouch { .. })
        ));
        assert_eq!(store.vouch(ALICE, ALICE, 1), Err(TrustError::SelfVouch));
    }

    #[test]
    fn revouch_after_revocation_restores_trust() {
        let mut store = TrustStore::default();
        store.add_genesis(ALICE);
        store.vouch(ALICE, BOB, 1).expect("vouch");
        store.revoke(ALICE, ALICE, BOB, "", 2).expect("revoke");
        assert_eq!(store.vouch(ALICE, BOB, 3), Ok(true));
        assert_eq!(store.vouch(ALICE, BOB, 4), Ok(false));
        assert!(approx(store.trust(BOB), 0.8));
    }

    #[test]
    fn peer_records_count_and_report_trust() {
        let mut store = TrustStore::default();
        store.add_genesis(ALICE);
        store.record_seen(ALICE, 50);
        store.record_sent(ALICE, 3);
        store.record_received(ALICE, 2);
        store.record_verification_failure(BOB);

        let alice = store.peer(ALICE).expect("alice is known");
        assert_eq!(alice.record.last_seen_at, Some(50));
        assert_eq!(alice.record.bundles_sent_count, 3);
        assert_eq!(alice.record.bundles_received_count, 2);
        assert!(approx(alice.trust_score, 1.0));
        let bob = store.peer(BOB).expect("bob is known");
        assert_eq!(bob.record.verification_failure_count, 1);
        assert_eq!(store.peers().len(), 2);
        assert!(store.peer(CAROL).is_none());
    }

    #[test]
    fn json_export_import_preserves_scores() {
        let mut store = TrustStore::default();
        store.add_genesis(ALICE);
        store.vouch(ALICE, BOB, 1).expect("vouch");
        store.vouch(BOB, CAROL, 1).expect("vouch");
        store.vouch(DAVE, ALICE, 1).expect("vouch");
        store.revoke(DAVE, ALICE, CAROL, "", 2).expect_err("no such edge");
        store.vouch(ALICE, CAROL, 1).expect("vouch");
        store.revoke(DAVE, ALICE, CAROL, "", 2).expect("vote");
        store.record_verification_failure(ERIN);

        let json = store.export_json().expect("trust should export");
        let mut restored =
            TrustStore::import_json(TrustConfig::default(), &json).expect("trust should import");
        assert!(approx(restored.trust(CAROL), 0.8));
        assert!(approx(restored.trust(BOB), 0.8));
        assert_eq!(
            restored
                .peer(ERIN)
                .expect("peer kept")
                .record
                .verification_failure_count,
            1
        );
        assert_eq!(restored.snapshot(), store.snapshot());
    }

    #[test]
    fn import_runs_under_the_callers_config() {
        let mut store = TrustStore::new(TrustConfig {
            decay: 0.5,
            ..TrustConfig::default()
        });
        store.add_genesis(ALICE);
        store.vouch(ALICE, BOB, 1).expect("vouch");
        let json = store.export_json().expect("trust should export");

        let mut restored =
            TrustStore::import_json(TrustConfig::default(), &json).expect("trust should import");
        assert_eq!(restored.config(), &TrustConfig::default());
        assert!(approx(restored.trust(BOB), 0.8));
    }
}
