use mule_crypto::signing::SigningError;
use thiserror::Error;

/// Errors returned by bundle codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Bundle-level schema validation failure.
    #[error("invalid bundle: {0}")]
    InvalidBundle(&'static str),
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
}

/// Typed validation outcome; each variant routes a received bundle differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Schema or serialization failure; rejected at the boundary.
    #[error("malformed bundle: {0}")]
    Malformed(&'static str),
    /// `expires_at` is not in the future.
    #[error("bundle expired")]
    Expired,
    /// `hop_count` has reached `hop_limit`.
    #[error("hop limit reached")]
    HopLimitReached,
    /// Signature does not verify against the claimed signer.
    #[error("signature invalid")]
    SignatureInvalid,
}

impl From<CodecError> for ValidationError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidBundle(reason) => ValidationError::Malformed(reason),
            CodecError::Signing(_) => ValidationError::SignatureInvalid,
            CodecError::Encode(_) | CodecError::Decode(_) => {
                ValidationError::Malformed("bundle does not serialize")
            }
        }
    }
}
