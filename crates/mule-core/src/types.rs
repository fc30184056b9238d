use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MuleError;

/// Topic whose bundles get the perishable TTL window when tagged as food.
pub const TOPIC_MUTUAL_AID: &str = "mutual-aid";
/// Topic whose bundles get long-term retention and library caching.
pub const TOPIC_KNOWLEDGE: &str = "knowledge";

const BUNDLE_ID_PREFIX: &str = "b:sha256:";

/// Node identity: the node's raw Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Short hex prefix used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = MuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|_| MuleError::Decode("node id is not hex"))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| MuleError::InvalidInput("node id must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Content address of a bundle, rendered as `b:sha256:<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId(pub [u8; 32]);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BUNDLE_ID_PREFIX}{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleId({})", &hex::encode(self.0)[..12])
    }
}

impl FromStr for BundleId {
    type Err = MuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix(BUNDLE_ID_PREFIX)
            .ok_or(MuleError::Decode("bundle id must start with b:sha256:"))?;
        let raw = hex::decode(hex_part).map_err(|_| MuleError::Decode("bundle id is not hex"))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| MuleError::InvalidInput("bundle id digest must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Bundle urgency. Declaration order is urgency order: `Emergency < Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Emergency,
    Perishable,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Emergency and perishable traffic bypass the bandwidth budget.
    pub fn ignores_bandwidth_budget(self) -> bool {
        matches!(self, Priority::Emergency | Priority::Perishable)
    }
}

/// Distribution scope controlling which peers may receive a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    Public,
    Local,
    Trusted,
    Private,
}

/// Whether the producer wants an acknowledgment bundle back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptPolicy {
    #[default]
    None,
    Requested,
    Required,
}

impl ReceiptPolicy {
    pub fn wants_receipt(self) -> bool {
        !matches!(self, ReceiptPolicy::None)
    }
}
