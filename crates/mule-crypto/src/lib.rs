//! Cryptographic helpers used by Mule.
//!
//! Bundles are authenticated, not encrypted: this crate only provides
//! Ed25519 signing/verification abstractions and node identity keys.

pub mod identity;
pub mod signing;
