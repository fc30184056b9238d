use mule_core::error::MuleError;
use mule_core::NodeId;
use rand::RngCore;

use crate::signing::{Ed25519Signer, Signer};

/// A node's long-lived signing identity.
#[derive(Clone)]
pub struct NodeIdentity {
    secret: [u8; 32],
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generates a fresh identity from the OS random source.
    pub fn generate() -> Self {
        let mut secret = [0_u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let node_id = Ed25519Signer::from_secret(secret).node_id();
        Self { secret, node_id }
    }

    /// Parses a hex-encoded 32-byte secret, as stored in key files.
    pub fn from_secret_hex(hex_secret: &str) -> Result<Self, MuleError> {
        let raw = hex::decode(hex_secret.trim())
            .map_err(|_| MuleError::Decode("identity secret is not hex"))?;
        let secret: [u8; 32] = raw
            .try_into()
            .map_err(|_| MuleError::InvalidInput("identity secret must be 32 bytes"))?;
        Ok(Self::from_secret(secret))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn signer(&self) -> Ed25519Signer {
        Ed25519Signer::from_secret(self.secret)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::NodeIdentity;
    use crate::signing::Signer;

    #[test]
    fn secret_hex_round_trip_preserves_node_id() {
        let identity = NodeIdentity::generate();
        let restored =
            NodeIdentity::from_secret_hex(&identity.secret_hex()).expect("hex should parse");
        assert_eq!(restored.node_id(), identity.node_id());
        assert_eq!(restored.signer().node_id(), identity.node_id());
    }

    #[test]
    fn generated_identities_differ() {
        assert_ne!(
            NodeIdentity::generate().node_id(),
            NodeIdentity::generate().node_id()
        );
    }

    #[test]
    fn rejects_short_secret() {
        assert!(NodeIdentity::from_secret_hex("abcd").is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let identity = NodeIdentity::from_secret([0x5A; 32]);
        assert!(!format!("{identity:?}").contains(&identity.secret_hex()));
    }
}
