//! Build and sign X.509 Certificate Signing Requests
//!
//! The authority only ever receives CSRs, but devices and subordinate
//! authorities need to produce them. [`CertificateSigningRequest`] creates a
//! PKCS#10 request with any RustCrypto signing key.

use der::asn1::{Any, SetOfVec};
use der::{Decode, Encode};
use signature::{Keypair, Signer};
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::ext::{AsExtension, Extension};
use x509_cert::name::Name;
use x509_cert::spki::{
    DynSignatureAlgorithmIdentifier, EncodePublicKey, SignatureBitStringEncoding,
    SubjectPublicKeyInfoOwned,
};

use crate::error::{CaError, Result};
use crate::request::parse_name;

const PEM_TAG_CSR: &str = "CERTIFICATE REQUEST";

/// The informational content of a certificate signing request.
///
/// Requests always carry a subject distinguished name. A request to be made a
/// certificate authority is placed in the PKCS#9 `extensionRequest`
/// attribute, which an authority is free to ignore.
#[derive(Debug, Clone)]
pub struct CertificateSigningRequest {
    subject: Name,
    authority: Option<Option<u8>>,
}

impl CertificateSigningRequest {
    /// Create a new request for a subject such as `CN=device-42`.
    pub fn new(subject: &str) -> Result<Self> {
        Ok(CertificateSigningRequest {
            subject: parse_name(subject)?,
            authority: None,
        })
    }

    /// Ask to be made a certificate authority with the given path length.
    pub fn request_authority(mut self, path_length: Option<u8>) -> Self {
        self.authority = Some(path_length);
        self
    }

    fn extensions(&self) -> Result<Vec<Extension>> {
        let mut extensions = Vec::new();

        if let Some(path_length) = self.authority {
            let constraints = BasicConstraints {
                ca: true,
                path_len_constraint: path_length,
            };
            let ext = constraints.to_extension(&self.subject, &extensions)?;
            extensions.push(ext);
        }

        Ok(extensions)
    }

    /// Sign this request with `key`, creating an X.509 certificate signing
    /// request serialized using ASN.1 DER.
    pub fn sign<K, S>(self, key: &K) -> Result<SignedCertificateRequest>
    where
        K: Keypair + Signer<S> + DynSignatureAlgorithmIdentifier,
        K::VerifyingKey: EncodePublicKey,
        S: SignatureBitStringEncoding,
    {
        // CSR needs the public key info to know who signed it.
        let public_key = key.verifying_key().to_public_key_der()?;
        let spki = SubjectPublicKeyInfoOwned::from_der(public_key.as_bytes())?;

        let mut attributes = SetOfVec::new();
        let extensions = self.extensions()?;
        if !extensions.is_empty() {
            let mut values = SetOfVec::new();
            values.insert(Any::encode_from(&extensions)?)?;

            attributes.insert(x509_cert::attr::Attribute {
                oid: const_oid::db::rfc5912::ID_EXTENSION_REQ,
                values,
            })?;
        }

        // Create the CSR info, which will be signed once encoded in DER
        let info = x509_cert::request::CertReqInfo {
            version: x509_cert::request::Version::V1,
            subject: self.subject,
            public_key: spki,
            attributes,
        };

        let target = info.to_der()?;
        let signature = key.try_sign(&target).map_err(CaError::Signing)?;

        let csr = x509_cert::request::CertReq {
            info,
            algorithm: key.signature_algorithm_identifier()?,
            signature: signature.to_bitstring()?,
        };

        Ok(SignedCertificateRequest(csr.to_der()?))
    }
}

/// A certificate request, cryptographically signed, and encoded as ASN.1 DER
#[derive(Debug, Clone)]
pub struct SignedCertificateRequest(Vec<u8>);

impl SignedCertificateRequest {
    /// Encode this CSR as a PEM document.
    pub fn to_pem(&self) -> Result<String> {
        Ok(pem_rfc7468::encode_string(
            PEM_TAG_CSR,
            base64ct::LineEnding::default(),
            &self.0,
        )?)
    }
}

impl AsRef<[u8]> for SignedCertificateRequest {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<SignedCertificateRequest> for Vec<u8> {
    fn from(value: SignedCertificateRequest) -> Self {
        value.0
    }
}
