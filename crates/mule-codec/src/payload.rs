use mule_core::{BundleId, NodeId};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub const PAYLOAD_TYPE_LISTING: &str = "listing";
pub const PAYLOAD_TYPE_DISCOVERY: &str = "discovery";
pub const PAYLOAD_TYPE_FILE_CHUNK: &str = "file-chunk";
pub const PAYLOAD_TYPE_RECEIPT: &str = "receipt";
pub const PAYLOAD_TYPE_VOUCH: &str = "vouch";
pub const PAYLOAD_TYPE_REVOCATION: &str = "revocation";

/// Largest payload body accepted in one bundle.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Bundle payload. Application kinds are opaque bytes to this layer; only
/// the control kinds (receipts, vouches, revocations) are interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Payload {
    Listing {
        bytes: Vec<u8>,
    },
    Discovery {
        bytes: Vec<u8>,
    },
    FileChunk {
        bytes: Vec<u8>,
    },
    /// Acknowledges delivery of another bundle to its producer.
    Receipt {
        acknowledges: BundleId,
    },
    /// Signer vouches for `vouchee`.
    Vouch {
        vouchee: NodeId,
    },
    /// Withdraws `voucher`'s vouch for `vouchee`. Signed by the voucher
    /// itself, or by one member of a revocation quorum.
    Revocation {
        voucher: NodeId,
        vouchee: NodeId,
        reason: String,
    },
    /// Unknown application kind carried verbatim.
    Opaque {
        payload_type: String,
        bytes: Vec<u8>,
    },
}

impl Payload {
    /// Builds an application payload from a producer-supplied type name.
    ///
    /// Control type names are reserved and cannot be submitted as raw bytes.
    pub fn from_parts(payload_type: &str, bytes: Vec<u8>) -> Result<Self, CodecError> {
        let payload_type = payload_type.trim();
        if payload_type.is_empty() {
            return Err(CodecError::InvalidBundle("payload type must not be empty"));
        }
        Ok(match payload_type {
            PAYLOAD_TYPE_LISTING => Payload::Listing { bytes },
            PAYLOAD_TYPE_DISCOVERY => Payload::Discovery { bytes },
            PAYLOAD_TYPE_FILE_CHUNK => Payload::FileChunk { bytes },
            PAYLOAD_TYPE_RECEIPT | PAYLOAD_TYPE_VOUCH | PAYLOAD_TYPE_REVOCATION => {
                return Err(CodecError::InvalidBundle("payload type is reserved"))
            }
            other => Payload::Opaque {
                payload_type: other.to_string(),
                bytes,
            },
        })
    }

    pub fn payload_type(&self) -> &str {
        match self {
            Payload::Listing { .. } => PAYLOAD_TYPE_LISTING,
            Payload::Discovery { .. } => PAYLOAD_TYPE_DISCOVERY,
            Payload::FileChunk { .. } => PAYLOAD_TYPE_FILE_CHUNK,
            Payload::Receipt { .. } => PAYLOAD_TYPE_RECEIPT,
            Payload::Vouch { .. } => PAYLOAD_TYPE_VOUCH,
            Payload::Revocation { .. } => PAYLOAD_TYPE_REVOCATION,
            Payload::Opaque { payload_type, .. } => payload_type,
        }
    }

    /// Application bytes, if this is an application kind.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Listing { bytes }
            | Payload::Discovery { bytes }
            | Payload::FileChunk { bytes }
            | Payload::Opaque { bytes, .. } => Some(bytes),
            Payload::Receipt { .. } | Payload::Vouch { .. } | Payload::Revocation { .. } => None,
        }
    }

    pub fn is_control(&self) -> bool {
        self.bytes().is_none()
    }

    pub(crate) fn validate(&self) -> Result<(), CodecError> {
        if let Some(bytes) = self.bytes() {
            if bytes.len() > MAX_PAYLOAD_BYTES {
                return Err(CodecError::InvalidBundle("payload exceeds max size"));
            }
        }
        match self {
            Payload::Opaque { payload_type, .. } if payload_type.trim().is_empty() => {
                Err(CodecError::InvalidBundle("payload type must not be empty"))
            }
            Payload::Revocation { reason, .. } if reason.len() > 256 => {
                Err(CodecError::InvalidBundle("revocation reason too long"))
            }
            _ => Ok(()),
        }
    }
}
