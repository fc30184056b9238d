//! In-process multi-node harness for bundle layer scenarios.
//!
//! Nodes share one manual clock and meet over in-memory links, so contact
//! schedules and TTL expiry are fully deterministic.

use std::sync::Arc;

use mule_core::clock::UnixSeconds;
use mule_core::{ManualClock, NodeId};
use mule_crypto::identity::NodeIdentity;
use mule_node::{
    BundleLayer, BundleLayerConfig, LayerParams, NodeRole, PeerContact, SyncError, SyncReport,
};
use mule_transport::InMemoryLink;

pub const SIM_EPOCH: UnixSeconds = 1_700_000_000;

/// A simulated device.
#[derive(Debug, Clone)]
pub struct SimNode {
    pub name: &'static str,
    pub layer: BundleLayer,
}

impl SimNode {
    pub fn id(&self) -> NodeId {
        self.layer.node_id()
    }
}

/// A set of nodes sharing one clock.
#[derive(Debug)]
pub struct Mesh {
    pub clock: ManualClock,
    seed: u8,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            clock: ManualClock::new(SIM_EPOCH),
            seed: 0,
        }
    }

    /// Adds a node with a deterministic identity and `config`.
    pub fn node_with(&mut self, name: &'static str, config: BundleLayerConfig) -> SimNode {
        self.seed = self.seed.wrapping_add(1);
        let layer = BundleLayer::new(LayerParams {
            config,
            identity: NodeIdentity::from_secret([self.seed; 32]),
            clock: Arc::new(self.clock.clone()),
            local_access_point: None,
        })
        .unwrap_or_else(|err| panic!("sim node {name} config rejected: {err}"));
        SimNode { name, layer }
    }

    pub fn node(&mut self, name: &'static str, role: NodeRole) -> SimNode {
        self.node_with(
            name,
            BundleLayerConfig {
                role,
                ..BundleLayerConfig::default()
            },
        )
    }
}

/// Reports from both sides of one contact.
#[derive(Debug)]
pub struct ContactReport {
    pub a: Result<SyncReport, SyncError>,
    pub b: Result<SyncReport, SyncError>,
}

/// Brings `a` and `b` into direct contact and runs one sync on each side.
pub async fn contact(a: &SimNode, b: &SimNode) -> ContactReport {
    let (link_a, link_b) = InMemoryLink::pair(a.id(), b.id());
    let (ra, rb) = tokio::join!(
        a.layer.sync_with(&link_a, PeerContact::direct(b.id())),
        b.layer.sync_with(&link_b, PeerContact::direct(a.id())),
    );
    ContactReport { a: ra, b: rb }
}
