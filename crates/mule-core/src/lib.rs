//! Core Mule primitives shared across crates.
//!
//! Includes identifiers, routing enums, hash helpers, clocks, and base errors.

pub mod clock;
pub mod error;
pub mod hash;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, UnixSeconds};
pub use types::{
    Audience, BundleId, NodeId, Priority, ReceiptPolicy, TOPIC_KNOWLEDGE, TOPIC_MUTUAL_AID,
};
