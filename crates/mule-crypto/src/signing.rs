use ed25519_dalek::{
    Signature as DalekSignature, Signer as DalekSignerTrait, SigningKey,
    Verifier as DalekVerifierTrait, VerifyingKey,
};
use mule_core::NodeId;
use thiserror::Error;

/// Errors returned by signing/verification helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    /// Pubkey bytes are not a valid Ed25519 verifying key.
    #[error("invalid public key bytes")]
    InvalidPublicKey,
}

/// Trait for message signing backends.
pub trait Signer: Send + Sync {
    /// Signs `msg` and returns a 64-byte signature.
    fn sign(&self, msg: &[u8]) -> Result<[u8; 64], SigningError>;
    /// Returns the signer's node identity (its raw public key).
    fn node_id(&self) -> NodeId;
}

/// Trait for signature verification backends.
pub trait Verifier: Send + Sync {
    /// Verifies a signature against `(signer, msg)`.
    ///
    /// `Ok(false)` means a well-formed key rejected the signature.
    fn verify(&self, signer: NodeId, msg: &[u8], sig: [u8; 64]) -> Result<bool, SigningError>;
}

/// Ed25519 signing implementation backed by `ed25519-dalek`.
#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Creates a signer from a 32-byte secret key.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, msg: &[u8]) -> Result<[u8; 64], SigningError> {
        Ok(self.signing_key.sign(msg).to_bytes())
    }

    fn node_id(&self) -> NodeId {
        NodeId(self.signing_key.verifying_key().to_bytes())
    }
}

/// Stateless Ed25519 verifier. Node ids are self-certifying public keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, signer: NodeId, msg: &[u8], sig: [u8; 64]) -> Result<bool, SigningError> {
        let verifying_key =
            VerifyingKey::from_bytes(&signer.0).map_err(|_| SigningError::InvalidPublicKey)?;
        let signature = DalekSignature::from_bytes(&sig);
        Ok(verifying_key.verify_strict(msg, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::{Ed25519Signer, Ed25519Verifier, Signer, SigningError, Verifier};
    use mule_core::NodeId;

    #[test]
    fn sign_and_verify_round_trip() {
        let signer = Ed25519Signer::from_secret([0x42_u8; 32]);
        let msg = b"mule signed bundle";

        let signature = signer.sign(msg).expect("sign should succeed");
        let ok = Ed25519Verifier
            .verify(signer.node_id(), msg, signature)
            .expect("verify should succeed");
        assert!(ok);
    }

    #[test]
    fn verify_fails_when_message_changes() {
        let signer = Ed25519Signer::from_secret([0x10_u8; 32]);
        let signature = signer.sign(b"original").expect("sign should succeed");
        let ok = Ed25519Verifier
            .verify(signer.node_id(), b"tampered", signature)
            .expect("verify should run");
        assert!(!ok);
    }

    #[test]
    fn verify_fails_for_other_signer() {
        let alice = Ed25519Signer::from_secret([0xAA_u8; 32]);
        let bob = Ed25519Signer::from_secret([0xBB_u8; 32]);
        let signature = alice.sign(b"message").expect("sign should succeed");
        let ok = Ed25519Verifier
            .verify(bob.node_id(), b"message", signature)
            .expect("verify should run");
        assert!(!ok);
    }

    #[test]
    fn verify_reports_invalid_public_key() {
        let signer = Ed25519Signer::from_secret([0x01_u8; 32]);
        let signature = signer.sign(b"message").expect("sign should succeed");
        // y = 2 does not decompress to a curve point.
        let mut bogus = [0_u8; 32];
        bogus[0] = 0x02;
        let err = Ed25519Verifier
            .verify(NodeId(bogus), b"message", signature)
            .expect_err("invalid point must be rejected");
        assert_eq!(err, SigningError::InvalidPublicKey);
    }
}
