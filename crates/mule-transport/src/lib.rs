//! Transport abstractions for Mule.
//!
//! The node runtime only depends on the byte-oriented [`link::PeerLink`]
//! contract; radio, Wi-Fi and test links implement it.

pub mod link;

pub use link::{InMemoryLink, LinkError, LinkHealthSnapshot, PeerLink};
