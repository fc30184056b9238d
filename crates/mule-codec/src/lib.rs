//! Mule wire codec primitives.
//!
//! Defines the canonical bundle schema, content addressing, default TTL
//! assignment, and typed validation.

pub mod bundle;
pub mod error;
pub mod payload;
pub mod ttl;

pub use bundle::{
    create_bundle, decode_bundle_cbor, encode_bundle_cbor, normalize_tags, validate,
    validate_for_delivery, Bundle, BundleOptions, Signature, DEFAULT_HOP_LIMIT,
};
pub use error::{CodecError, ValidationError};
pub use payload::Payload;
pub use ttl::TtlTable;
