use std::fmt;

use mule_core::hash::sha256_32;
use mule_core::{Audience, BundleId, NodeId, Priority, ReceiptPolicy, UnixSeconds};
use mule_crypto::signing::{Signer, Verifier};
use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CodecError, ValidationError};
use crate::payload::Payload;
use crate::ttl::TtlTable;

/// Bundle wire version.
pub const BUNDLE_V1_VERSION: u16 = 1;
/// Hop limit applied when the producer does not set one.
pub const DEFAULT_HOP_LIMIT: u8 = 20;
pub const MAX_TAGS: usize = 16;
pub const MAX_TAG_LEN: usize = 64;
pub const MAX_TOPIC_LEN: usize = 64;

/// Ed25519 signature bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SignatureVisitor;

        impl<'de> Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("exactly 64 signature bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, raw: &[u8]) -> Result<Signature, E> {
                let bytes: [u8; 64] = raw
                    .try_into()
                    .map_err(|_| E::invalid_length(raw.len(), &self))?;
                Ok(Signature(bytes))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Signature, A::Error> {
                let mut raw = Vec::with_capacity(64);
                while let Some(byte) = seq.next_element::<u8>()? {
                    raw.push(byte);
                }
                self.visit_bytes(&raw)
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

/// Signed, content-addressed unit of store-and-forward transfer.
///
/// Everything except `hop_count` and `signature` is covered by both the
/// bundle id and the signature, so relays can advance the hop counter
/// without invalidating either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub version: u16,
    pub created_at: UnixSeconds,
    pub expires_at: UnixSeconds,
    pub priority: Priority,
    pub audience: Audience,
    pub topic: Option<String>,
    /// Normalized: lowercase, trimmed, sorted, deduplicated.
    pub tags: Vec<String>,
    pub payload: Payload,
    pub hop_count: u8,
    pub hop_limit: u8,
    pub receipt_policy: ReceiptPolicy,
    /// Addressee of a private bundle.
    pub recipient: Option<NodeId>,
    pub signer_id: NodeId,
    pub signature: Signature,
}

#[derive(Serialize)]
struct CanonicalBundleV1<'a> {
    version: u16,
    created_at: UnixSeconds,
    expires_at: UnixSeconds,
    priority: Priority,
    audience: Audience,
    topic: &'a Option<String>,
    tags: &'a [String],
    payload: &'a Payload,
    hop_limit: u8,
    receipt_policy: ReceiptPolicy,
    recipient: Option<NodeId>,
    signer_id: NodeId,
}

impl Bundle {
    /// Validates bundle schema and field consistency.
    pub fn validate_schema(&self) -> Result<(), CodecError> {
        if self.version != BUNDLE_V1_VERSION {
            return Err(CodecError::InvalidBundle("unsupported bundle version"));
        }
        if self.expires_at <= self.created_at {
            return Err(CodecError::InvalidBundle("expires_at must follow created_at"));
        }
        if self.hop_limit == 0 {
            return Err(CodecError::InvalidBundle("hop_limit must be positive"));
        }
        if let Some(topic) = &self.topic {
            if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
                return Err(CodecError::InvalidBundle("topic length out of range"));
            }
            if normalize_topic(Some(topic)).as_deref() != Some(topic.as_str()) {
                return Err(CodecError::InvalidBundle("topic is not normalized"));
            }
        }
        if self.tags.len() > MAX_TAGS {
            return Err(CodecError::InvalidBundle("too many tags"));
        }
        if self
            .tags
            .iter()
            .any(|tag| tag.is_empty() || tag.len() > MAX_TAG_LEN)
        {
            return Err(CodecError::InvalidBundle("tag length out of range"));
        }
        if normalize_tags(&self.tags) != self.tags {
            return Err(CodecError::InvalidBundle("tags are not normalized"));
        }
        match (self.audience, self.recipient) {
            (Audience::Private, None) => {
                return Err(CodecError::InvalidBundle("private bundle needs a recipient"))
            }
            (Audience::Private, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                return Err(CodecError::InvalidBundle(
                    "recipient is only valid on private bundles",
                ))
            }
        }
        self.payload.validate()
    }

    /// Deterministic bytes covered by the id and the signature.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let canonical = CanonicalBundleV1 {
            version: self.version,
            created_at: self.created_at,
            expires_at: self.expires_at,
            priority: self.priority,
            audience: self.audience,
            topic: &self.topic,
            tags: &self.tags,
            payload: &self.payload,
            hop_limit: self.hop_limit,
            receipt_policy: self.receipt_policy,
            recipient: self.recipient,
            signer_id: self.signer_id,
        };
        let mut out = Vec::new();
        ciborium::ser::into_writer(&canonical, &mut out)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Content address: SHA-256 over the canonical bytes.
    pub fn id(&self) -> Result<BundleId, CodecError> {
        Ok(BundleId(sha256_32(&self.canonical_bytes()?)))
    }

    pub fn is_expired(&self, now: UnixSeconds) -> bool {
        self.expires_at <= now
    }

    pub fn hop_limit_reached(&self) -> bool {
        self.hop_count >= self.hop_limit
    }

    /// Hops left before the bundle stops being forwardable.
    pub fn hops_remaining(&self) -> u8 {
        self.hop_limit.saturating_sub(self.hop_count)
    }

    /// Copy carried over the wire after one more hop.
    pub fn next_hop_copy(&self) -> Bundle {
        let mut copy = self.clone();
        copy.hop_count = copy.hop_count.saturating_add(1);
        copy
    }

    /// Verifies the signature against `signer_id`.
    pub fn verify_signature(&self, verifier: &dyn Verifier) -> Result<bool, CodecError> {
        let message = self.canonical_bytes()?;
        Ok(verifier.verify(self.signer_id, &message, self.signature.0)?)
    }
}

/// Producer-side options for [`create_bundle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleOptions {
    pub priority: Priority,
    pub audience: Audience,
    pub topic: Option<String>,
    pub tags: Vec<String>,
    /// Explicit lifetime in seconds; defaults from the TTL table when unset.
    pub ttl_secs: Option<u64>,
    pub hop_limit: Option<u8>,
    pub receipt_policy: ReceiptPolicy,
    pub recipient: Option<NodeId>,
}

/// Lowercases, trims, sorts and deduplicates tags, dropping empties.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn normalize_topic(topic: Option<&String>) -> Option<String> {
    topic
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
}

/// Builds, stamps and signs a new bundle.
pub fn create_bundle(
    payload: Payload,
    options: BundleOptions,
    now: UnixSeconds,
    ttl_table: &TtlTable,
    signer: &dyn Signer,
) -> Result<Bundle, CodecError> {
    let topic = normalize_topic(options.topic.as_ref());
    let tags = normalize_tags(&options.tags);
    let ttl = match options.ttl_secs {
        Some(0) => return Err(CodecError::InvalidBundle("ttl must be positive")),
        Some(ttl) => ttl,
        None => ttl_table.ttl_for(options.priority, topic.as_deref(), &tags),
    };

    let mut bundle = Bundle {
        version: BUNDLE_V1_VERSION,
        created_at: now,
        expires_at: now.saturating_add(ttl),
        priority: options.priority,
        audience: options.audience,
        topic,
        tags,
        payload,
        hop_count: 0,
        hop_limit: options.hop_limit.unwrap_or(DEFAULT_HOP_LIMIT),
        receipt_policy: options.receipt_policy,
        recipient: options.recipient,
        signer_id: signer.node_id(),
        signature: Signature([0_u8; 64]),
    };
    bundle.validate_schema()?;
    bundle.signature = Signature(signer.sign(&bundle.canonical_bytes()?)?);
    Ok(bundle)
}

/// Full receive-side validation: schema, hop limit, expiry, then signature.
///
/// Returns the bundle id on success.
pub fn validate(
    bundle: &Bundle,
    now: UnixSeconds,
    verifier: &dyn Verifier,
) -> Result<BundleId, ValidationError> {
    bundle.validate_schema()?;
    if bundle.hop_limit_reached() {
        return Err(ValidationError::HopLimitReached);
    }
    validate_for_delivery(bundle, now, verifier)
}

/// Validation for local delivery only: like [`validate`] but a saturated
/// hop counter is accepted, since the copy will not be forwarded again.
pub fn validate_for_delivery(
    bundle: &Bundle,
    now: UnixSeconds,
    verifier: &dyn Verifier,
) -> Result<BundleId, ValidationError> {
    bundle.validate_schema()?;
    if bundle.is_expired(now) {
        return Err(ValidationError::Expired);
    }
    if !bundle.verify_signature(verifier)? {
        return Err(ValidationError::SignatureInvalid);
    }
    Ok(bundle.id()?)
}

/// Encodes a bundle to its CBOR wire form.
pub fn encode_bundle_cbor(bundle: &Bundle) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(bundle, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a bundle from its CBOR wire form. Schema is not checked here.
pub fn decode_bundle_cbor(bytes: &[u8]) -> Result<Bundle, CodecError> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{
        create_bundle, decode_bundle_cbor, encode_bundle_cbor, validate, validate_for_delivery,
        BundleOptions, Signature, DEFAULT_HOP_LIMIT,
    };
    use crate::error::{CodecError, ValidationError};
    use crate::payload::Payload;
    use crate::ttl::{TtlTable, PERISHABLE_TTL_RANGE};
    use mule_core::{Audience, NodeId, Priority};
    use mule_crypto::signing::{Ed25519Signer, Ed25519Verifier};

    const NOW: u64 = 1_700_000_000;

    fn signer() -> Ed25519Signer {
        Ed25519Signer::from_secret([7_u8; 32])
    }

    fn food_offer() -> super::Bundle {
        create_bundle(
            Payload::Listing {
                bytes: b"20kg rice at the hall".to_vec(),
            },
            BundleOptions {
                topic: Some("Mutual-Aid".into()),
                tags: vec!["Food ".into(), "rice".into(), "food".into()],
                ..BundleOptions::default()
            },
            NOW,
            &TtlTable::default(),
            &signer(),
        )
        .expect("bundle should build")
    }

    #[test]
    fn create_normalizes_and_assigns_perishable_ttl() {
        let bundle = food_offer();
        assert_eq!(bundle.topic.as_deref(), Some("mutual-aid"));
        assert_eq!(bundle.tags, vec!["food".to_string(), "rice".to_string()]);
        assert_eq!(bundle.hop_count, 0);
        assert_eq!(bundle.hop_limit, DEFAULT_HOP_LIMIT);
        let ttl = bundle.expires_at - bundle.created_at;
        assert!(ttl >= PERISHABLE_TTL_RANGE.0 && ttl <= PERISHABLE_TTL_RANGE.1);
        assert!(validate(&bundle, NOW, &Ed25519Verifier).is_ok());
    }

    #[test]
    fn id_is_deterministic_and_ignores_hop_count_and_signature() {
        let a = food_offer();
        let b = food_offer();
        let id = a.id().expect("id");
        assert_eq!(id, b.id().expect("id"));

        let mut hopped = a.next_hop_copy();
        hopped.signature = Signature([0_u8; 64]);
        assert_eq!(hopped.id().expect("id"), id);
        assert_eq!(hopped.hop_count, 1);
    }

    #[test]
    fn forwarded_copy_still_verifies() {
        let copy = food_offer().next_hop_copy().next_hop_copy();
        assert!(validate(&copy, NOW, &Ed25519Verifier).is_ok());
    }

    #[test]
    fn tampered_field_fails_signature() {
        let mut bundle = food_offer();
        bundle.priority = Priority::Emergency;
        assert_eq!(
            validate(&bundle, NOW, &Ed25519Verifier),
            Err(ValidationError::SignatureInvalid)
        );
    }

    #[test]
    fn expired_and_saturated_bundles_are_typed() {
        let bundle = food_offer();
        assert_eq!(
            validate(&bundle, bundle.expires_at, &Ed25519Verifier),
            Err(ValidationError::Expired)
        );

        let mut saturated = bundle.clone();
        saturated.hop_count = saturated.hop_limit;
        assert_eq!(
            validate(&saturated, NOW, &Ed25519Verifier),
            Err(ValidationError::HopLimitReached)
        );
        assert!(validate_for_delivery(&saturated, NOW, &Ed25519Verifier).is_ok());
    }

    #[test]
    fn private_bundle_requires_recipient() {
        let err = create_bundle(
            Payload::Discovery { bytes: vec![1] },
            BundleOptions {
                audience: Audience::Private,
                ..BundleOptions::default()
            },
            NOW,
            &TtlTable::default(),
            &signer(),
        )
        .expect_err("private without recipient must fail");
        assert!(matches!(err, CodecError::InvalidBundle(_)));

        let ok = create_bundle(
            Payload::Discovery { bytes: vec![1] },
            BundleOptions {
                audience: Audience::Private,
                recipient: Some(NodeId([3; 32])),
                ..BundleOptions::default()
            },
            NOW,
            &TtlTable::default(),
            &signer(),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let err = create_bundle(
            Payload::Discovery { bytes: vec![] },
            BundleOptions {
                ttl_secs: Some(0),
                ..BundleOptions::default()
            },
            NOW,
            &TtlTable::default(),
            &signer(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn unnormalized_tags_are_malformed() {
        let mut bundle = food_offer();
        bundle.tags = vec!["rice".into(), "food".into()];
        assert!(matches!(
            validate(&bundle, NOW, &Ed25519Verifier),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn wire_encoding_preserves_bundle() {
        let bundle = food_offer().next_hop_copy();
        let bytes = encode_bundle_cbor(&bundle).expect("encode");
        let decoded = decode_bundle_cbor(&bytes).expect("decode");
        assert_eq!(decoded, bundle);
        assert!(decode_bundle_cbor(&[0xff, 0x00, 0x13]).is_err());
    }
}
