//! Errors which occur while bootstrapping an authority or issuing certificates

use std::fmt;

use thiserror::Error;

/// A result type which uses [`CaError`] as the error type.
pub type Result<T> = ::std::result::Result<T, CaError>;

/// Unified error type for certificate issuance.
///
/// Variants fall into two groups. Local validation failures
/// ([`CaError::MalformedRequest`], [`CaError::InvalidSignature`],
/// [`CaError::InvalidValidityPeriod`] and friends) are detected before
/// any call to the key store and will fail again if retried with the same
/// input. Remote failures keep the classification reported by the key
/// store, see [`CaError::is_retryable`].
#[derive(Debug, Error)]
pub enum CaError {
    /// The certificate signing request could not be decoded.
    #[error("Malformed certificate signing request: {0}")]
    MalformedRequest(#[source] der::Error),

    /// The certificate signing request was not signed by the key it contains.
    #[error("Certificate signing request signature is invalid: {0}")]
    InvalidSignature(String),

    /// No certificate exists yet for the named issuer.
    #[error("No certificate found for issuer {0}")]
    UnknownIssuer(String),

    /// A validity period of zero or fewer units was requested.
    #[error("Validity period must be positive, got {0}")]
    InvalidValidityPeriod(i64),

    /// The key store could not be reached, or asked us to slow down.
    #[error("Key store unavailable: {0}")]
    RemoteUnavailable(#[source] RemoteError),

    /// The caller's identity lacks rights on the named key.
    #[error("Key store denied access: {0}")]
    RemotePermissionDenied(#[source] RemoteError),

    /// Any other failure reported by the key store.
    #[error("Key store error: {0}")]
    Remote(#[source] RemoteError),

    /// Some required data was missing when building a request.
    #[error("Required request data is missing: {0}")]
    MissingField(&'static str),

    /// A distinguished name could not be parsed.
    #[error("Invalid distinguished name {name:?}: {source}")]
    InvalidName {
        /// The name as it was provided.
        name: String,
        /// The underlying parser error.
        #[source]
        source: der::Error,
    },

    /// The issuer certificate does not carry the CA basic constraint.
    #[error("Issuer {0} is not a certificate authority")]
    IssuerNotAuthority(String),

    /// An intermediate was requested which would violate the issuer's path length.
    #[error("Issuer path length {issuer} does not permit an intermediate with path length {requested:?}")]
    PathLengthExceeded {
        /// Path length constraint on the issuer certificate.
        issuer: u8,
        /// Path length requested for the new intermediate.
        requested: Option<u8>,
    },

    /// An error occured while encoding or decoding DER.
    #[error("An error occured while encoding a DER structure: {0}")]
    Encoding(#[from] der::Error),

    /// A public key or algorithm identifier could not be encoded.
    #[error("An error occured while encoding a public key: {0}")]
    PublicKey(#[from] x509_cert::spki::Error),

    /// A local signing key failed to produce a signature.
    #[error("An error occured while signing: {0}")]
    Signing(#[source] signature::Error),

    /// An error occured while decoding a PEM document.
    #[error("An error occured while decoding a PEM document: {0}")]
    Pem(#[from] pem_rfc7468::Error),

    /// A configured validity period is outside the permitted range.
    #[error("Number of days specified as the certificate validity period should be between 1 and {max}, got {days}")]
    ValidityOutOfRange {
        /// The configured validity, in days.
        days: i64,
        /// The largest permitted validity, in days.
        max: i64,
    },

    /// The settings file could not be parsed.
    #[error("Invalid settings: {0}")]
    Settings(#[from] serde_json::Error),

    /// An I/O error occured while reading or writing a local file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaError {
    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Only transient key store failures are retryable; every local
    /// validation failure requires the input to change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaError::RemoteUnavailable(_))
    }

    /// Whether this error originated in the key store.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CaError::RemoteUnavailable(_) | CaError::RemotePermissionDenied(_) | CaError::Remote(_)
        )
    }
}

impl From<RemoteError> for CaError {
    fn from(error: RemoteError) -> Self {
        match error.kind() {
            RemoteErrorKind::Unavailable => CaError::RemoteUnavailable(error),
            RemoteErrorKind::PermissionDenied => CaError::RemotePermissionDenied(error),
            _ => CaError::Remote(error),
        }
    }
}

/// Classification of a failure reported by a key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RemoteErrorKind {
    /// Network failure, timeout, throttling or a server-side error.
    Unavailable,

    /// The caller is not authorized for the requested operation.
    PermissionDenied,

    /// The named key or certificate does not exist.
    NotFound,

    /// The name is already in use in a conflicting form.
    Conflict,

    /// The store rejected the request as invalid.
    Rejected,

    /// The store responded with something we could not understand.
    Protocol,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::Unavailable => f.write_str("unavailable"),
            RemoteErrorKind::PermissionDenied => f.write_str("permission denied"),
            RemoteErrorKind::NotFound => f.write_str("not found"),
            RemoteErrorKind::Conflict => f.write_str("conflict"),
            RemoteErrorKind::Rejected => f.write_str("rejected"),
            RemoteErrorKind::Protocol => f.write_str("protocol error"),
        }
    }
}

/// A failure reported by a [`RemoteKeyStore`][crate::remote::RemoteKeyStore].
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    kind: RemoteErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl RemoteError {
    /// Create a new error of the given kind.
    pub fn new<M: Into<String>>(kind: RemoteErrorKind, message: M) -> Self {
        RemoteError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause to this error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Constructor for a protocol error wrapping a decoding failure.
    pub fn protocol<E>(message: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RemoteError::new(RemoteErrorKind::Protocol, message).with_source(source)
    }

    /// The classification of this error.
    pub fn kind(&self) -> RemoteErrorKind {
        self.kind
    }

    /// Human readable description from the key store.
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_classification_is_preserved() {
        let err: CaError = RemoteError::new(RemoteErrorKind::Unavailable, "throttled").into();
        assert!(matches!(err, CaError::RemoteUnavailable(_)));
        assert!(err.is_retryable());
        assert!(err.is_remote());

        let err: CaError = RemoteError::new(RemoteErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, CaError::RemotePermissionDenied(_)));
        assert!(!err.is_retryable());

        let err: CaError = RemoteError::new(RemoteErrorKind::Conflict, "taken").into();
        match err {
            CaError::Remote(inner) => assert_eq!(inner.kind(), RemoteErrorKind::Conflict),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn local_errors_are_not_retryable() {
        assert!(!CaError::InvalidValidityPeriod(0).is_retryable());
        assert!(!CaError::UnknownIssuer("root-ca".into()).is_retryable());
        assert!(!CaError::InvalidSignature("bad".into()).is_remote());
    }

    static_assertions::assert_impl_all!(CaError: Send, Sync);
    static_assertions::assert_impl_all!(RemoteError: Send, Sync);
}
