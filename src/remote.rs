//! # The remote signing capability
//!
//! Authority keys live in a remote key store and never leave it. This module
//! defines the narrow interface the issuance pipeline needs from such a store,
//! see [`RemoteKeyStore`]. Keys are only ever referred to through an opaque
//! [`KeyHandle`], and signing is exposed as a `digest -> signature` capability
//! bound to one handle with [`bind_key`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use der::Decode;
use x509_cert::name::Name;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::Certificate;

use crate::error::RemoteError;
use crate::request::{IssuerIdentity, ValidityWindow};

/// Signature schemes an authority key may use.
///
/// All schemes sign a SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256.
    RsaPkcs1Sha256,

    /// ECDSA over NIST P-256 using SHA-256, with DER encoded signatures.
    EcdsaP256Sha256,
}

impl SigningAlgorithm {
    /// The algorithm identifier placed in certificates signed with this scheme.
    pub fn identifier(&self) -> AlgorithmIdentifierOwned {
        match self {
            SigningAlgorithm::RsaPkcs1Sha256 => AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
                parameters: Some(der::asn1::Any::null()),
            },
            SigningAlgorithm::EcdsaP256Sha256 => AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::ECDSA_WITH_SHA_256,
                parameters: None,
            },
        }
    }

    /// The JSON Web Algorithm name of this scheme.
    pub fn jose_name(&self) -> &'static str {
        match self {
            SigningAlgorithm::RsaPkcs1Sha256 => "RS256",
            SigningAlgorithm::EcdsaP256Sha256 => "ES256",
        }
    }

    /// The scheme matching a public key, if it is supported.
    pub fn for_public_key(spki: &SubjectPublicKeyInfoOwned) -> Option<Self> {
        let oid = spki.algorithm.oid;
        if oid == const_oid::db::rfc5912::RSA_ENCRYPTION {
            return Some(SigningAlgorithm::RsaPkcs1Sha256);
        }

        if oid == const_oid::db::rfc5912::ID_EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|params| params.decode_as::<const_oid::ObjectIdentifier>().ok());
            if curve == Some(const_oid::db::rfc5912::SECP_256_R_1) {
                return Some(SigningAlgorithm::EcdsaP256Sha256);
            }
        }

        None
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.jose_name())
    }
}

/// Opaque reference to a key held by the key store.
///
/// A handle identifies a key and the scheme it signs with, and nothing else:
/// there is no way to get key material out of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle {
    id: String,
    algorithm: SigningAlgorithm,
}

impl KeyHandle {
    /// Create a handle from the store's identifier for the key.
    pub fn new<S: Into<String>>(id: S, algorithm: SigningAlgorithm) -> Self {
        KeyHandle {
            id: id.into(),
            algorithm,
        }
    }

    /// The store's identifier for this key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The signature scheme of this key.
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }
}

/// The current certificate of an authority, along with a handle to its key.
#[derive(Debug, Clone)]
pub struct IssuerCertificate {
    certificate: Certificate,
    der: Vec<u8>,
    key: KeyHandle,
}

impl IssuerCertificate {
    /// Decode a DER certificate fetched from the store.
    pub fn from_der(der: Vec<u8>, key: KeyHandle) -> der::Result<Self> {
        let certificate = Certificate::from_der(&der)?;
        Ok(IssuerCertificate {
            certificate,
            der,
            key,
        })
    }

    /// The decoded certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// The certificate as DER.
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// The subject of the authority certificate, which becomes the issuer
    /// of certificates it signs.
    pub fn subject(&self) -> &Name {
        &self.certificate.tbs_certificate.subject
    }

    /// Handle to the authority's signing key.
    pub fn key(&self) -> &KeyHandle {
        &self.key
    }
}

/// Everything the store needs to create an authority key and certificate.
#[derive(Debug, Clone)]
pub struct AuthorityParameters {
    /// Distinguished name of the authority, in RFC 4514 form.
    pub subject: String,
    /// Validity of the authority certificate.
    pub validity: ValidityWindow,
    /// Size of the key to create, in bits.
    pub key_size: u32,
    /// Size of the signature digest, in bits.
    pub hash_bits: u32,
    /// Maximum number of subordinate authorities.
    pub path_length: u8,
}

/// A key store which performs asymmetric operations on keys it never exposes.
///
/// Implementations carry their own timeout and retry policy. Failures should
/// be classified with [`RemoteErrorKind`][crate::error::RemoteErrorKind] so
/// callers can tell transient faults from authorization problems.
#[async_trait]
pub trait RemoteKeyStore: Send + Sync {
    /// Number of versions of the named key which exist.
    async fn version_count(&self, identity: &IssuerIdentity) -> Result<usize, RemoteError>;

    /// Create an authority key and its certificate under `identity`.
    ///
    /// Stores should refuse to create a key under a name which is already in
    /// use, rather than adding a new version.
    async fn create_authority(
        &self,
        identity: &IssuerIdentity,
        parameters: &AuthorityParameters,
    ) -> Result<(), RemoteError>;

    /// Fetch the current certificate for `identity`, if there is one.
    async fn fetch_certificate(
        &self,
        identity: &IssuerIdentity,
    ) -> Result<Option<IssuerCertificate>, RemoteError>;

    /// Sign a pre-computed digest with the referenced key.
    ///
    /// The signature is returned in the encoding X.509 expects for the key's
    /// scheme.
    async fn sign_digest(&self, key: &KeyHandle, digest: &[u8]) -> Result<Vec<u8>, RemoteError>;
}

#[async_trait]
impl<T> RemoteKeyStore for Arc<T>
where
    T: RemoteKeyStore + ?Sized,
{
    async fn version_count(&self, identity: &IssuerIdentity) -> Result<usize, RemoteError> {
        (**self).version_count(identity).await
    }

    async fn create_authority(
        &self,
        identity: &IssuerIdentity,
        parameters: &AuthorityParameters,
    ) -> Result<(), RemoteError> {
        (**self).create_authority(identity, parameters).await
    }

    async fn fetch_certificate(
        &self,
        identity: &IssuerIdentity,
    ) -> Result<Option<IssuerCertificate>, RemoteError> {
        (**self).fetch_certificate(identity).await
    }

    async fn sign_digest(&self, key: &KeyHandle, digest: &[u8]) -> Result<Vec<u8>, RemoteError> {
        (**self).sign_digest(key, digest).await
    }
}

/// Future returned by a bound signing capability.
pub type SignatureFuture<'s> =
    Pin<Box<dyn Future<Output = Result<Vec<u8>, RemoteError>> + Send + 's>>;

/// Bind the store's sign operation to a single key.
///
/// The returned closure can sign exactly one digest, and knows nothing about
/// the store beyond that.
pub fn bind_key<'s, S>(store: &'s S, key: KeyHandle) -> impl FnOnce(Vec<u8>) -> SignatureFuture<'s>
where
    S: RemoteKeyStore + ?Sized,
{
    move |digest| Box::pin(async move { store.sign_digest(&key, &digest).await })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn algorithm_identifiers() {
        let rsa = SigningAlgorithm::RsaPkcs1Sha256.identifier();
        assert_eq!(
            rsa.oid,
            const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION
        );
        assert!(rsa.parameters.is_some());

        let ec = SigningAlgorithm::EcdsaP256Sha256.identifier();
        assert_eq!(ec.oid, const_oid::db::rfc5912::ECDSA_WITH_SHA_256);
        assert!(ec.parameters.is_none());
    }

    #[test]
    fn algorithm_from_p256_key() {
        use p256::pkcs8::EncodePublicKey;

        let key = p256::SecretKey::random(&mut rand_core::OsRng);
        let der = key.public_key().to_public_key_der().unwrap();
        let spki = SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap();

        assert_eq!(
            SigningAlgorithm::for_public_key(&spki),
            Some(SigningAlgorithm::EcdsaP256Sha256)
        );
    }

    static_assertions::assert_impl_all!(KeyHandle: Send, Sync);
    static_assertions::assert_impl_all!(IssuerCertificate: Send, Sync);
}
