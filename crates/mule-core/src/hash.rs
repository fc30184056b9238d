use sha2::{Digest, Sha256};

/// Computes SHA-256 and returns the raw 32-byte digest.
pub fn sha256_32(input: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(input);
    let mut out = [0_u8; 32];
    out.copy_from_slice(&digest);
    out
}
