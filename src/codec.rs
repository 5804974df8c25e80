//! X.509 encoding for certificate signing requests and issued certificates
//!
//! The codec never sees private keys. Certificates are assembled as a
//! `TBSCertificate`, digested, and handed to a signing capability which
//! returns the finished signature.

use std::future::Future;

use chrono::{DateTime, Utc};
use const_oid::AssociatedOid;
use der::asn1::{BitString, GeneralizedTime, OctetString, UtcTime};
use der::{Decode, Encode};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use signature::Verifier;
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectKeyIdentifier,
};
use x509_cert::ext::{AsExtension, Extension};
use x509_cert::name::Name;
use x509_cert::request::CertReq;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use crate::error::{CaError, RemoteError, Result};
use crate::remote::SigningAlgorithm;
use crate::request::{CertificateRole, ValidityWindow};

const PEM_TAG_CSR: &str = "CERTIFICATE REQUEST";
const PEM_TAG_CSR_LEGACY: &str = "NEW CERTIFICATE REQUEST";
const PEM_TAG_CERTIFICATE: &str = "CERTIFICATE";

/// Decode a certificate signing request from DER, or from a PEM document.
///
/// Any decoding problem is reported as [`CaError::MalformedRequest`].
pub fn parse_request(data: &[u8]) -> Result<CertReq> {
    let trimmed = data.trim_ascii_start();
    if trimmed.starts_with(b"-----BEGIN") {
        let (label, der) = pem_rfc7468::decode_vec(trimmed)
            .map_err(|err| CaError::MalformedRequest(err.into()))?;
        if label != PEM_TAG_CSR && label != PEM_TAG_CSR_LEGACY {
            return Err(CaError::MalformedRequest(
                pem_rfc7468::Error::Label.into(),
            ));
        }
        return CertReq::from_der(&der).map_err(CaError::MalformedRequest);
    }

    CertReq::from_der(data).map_err(CaError::MalformedRequest)
}

/// Check that a request was signed by the private half of the key it contains.
pub fn verify_request(csr: &CertReq) -> Result<()> {
    let message = csr.info.to_der().map_err(CaError::MalformedRequest)?;
    verify_signature(
        &csr.algorithm,
        &csr.info.public_key,
        &message,
        &csr.signature,
    )
    .map_err(CaError::InvalidSignature)
}

/// Check that `certificate` was signed by the key in `issuer`.
pub fn verify_issued(certificate: &Certificate, issuer: &Certificate) -> Result<()> {
    if certificate.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return Err(CaError::InvalidSignature(format!(
            "certificate issuer {} does not match {}",
            certificate.tbs_certificate.issuer, issuer.tbs_certificate.subject
        )));
    }

    let message = certificate.tbs_certificate.to_der()?;
    verify_signature(
        &certificate.signature_algorithm,
        &issuer.tbs_certificate.subject_public_key_info,
        &message,
        &certificate.signature,
    )
    .map_err(CaError::InvalidSignature)
}

fn verify_signature(
    algorithm: &AlgorithmIdentifierOwned,
    spki: &SubjectPublicKeyInfoOwned,
    message: &[u8],
    signature: &BitString,
) -> ::std::result::Result<(), String> {
    use const_oid::db::rfc5912;

    let signature = signature
        .as_bytes()
        .ok_or_else(|| "signature is not octet aligned".to_owned())?;
    let spki_der = spki.to_der().map_err(|err| err.to_string())?;

    let oid = algorithm.oid;
    if oid == rfc5912::ECDSA_WITH_SHA_256 {
        use p256::pkcs8::DecodePublicKey;

        let key = p256::ecdsa::VerifyingKey::from_public_key_der(&spki_der)
            .map_err(|err| format!("unsupported ECDSA public key: {err}"))?;
        let signature = p256::ecdsa::Signature::from_der(signature)
            .map_err(|err| format!("malformed ECDSA signature: {err}"))?;
        key.verify(message, &signature)
            .map_err(|_| "ECDSA signature does not match".to_owned())
    } else if oid == rfc5912::SHA_256_WITH_RSA_ENCRYPTION {
        verify_rsa::<sha2::Sha256>(&spki_der, message, signature)
    } else if oid == rfc5912::SHA_384_WITH_RSA_ENCRYPTION {
        verify_rsa::<sha2::Sha384>(&spki_der, message, signature)
    } else if oid == rfc5912::SHA_512_WITH_RSA_ENCRYPTION {
        verify_rsa::<sha2::Sha512>(&spki_der, message, signature)
    } else {
        Err(format!("unsupported signature algorithm {oid}"))
    }
}

fn verify_rsa<D>(
    spki_der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> ::std::result::Result<(), String>
where
    D: Digest + AssociatedOid,
{
    use rsa::pkcs8::DecodePublicKey;

    let key = rsa::RsaPublicKey::from_public_key_der(spki_der)
        .map_err(|err| format!("unsupported RSA public key: {err}"))?;
    let signature = rsa::pkcs1v15::Signature::try_from(signature)
        .map_err(|err| format!("malformed RSA signature: {err}"))?;
    rsa::pkcs1v15::VerifyingKey::<D>::new(key)
        .verify(message, &signature)
        .map_err(|_| "RSA signature does not match".to_owned())
}

/// Extensions the requester asked for in the `extensionRequest` attribute.
///
/// These are untrusted, and only ever used for diagnostics.
pub fn requested_extensions(csr: &CertReq) -> Vec<Extension> {
    csr.info
        .attributes
        .iter()
        .filter(|attr| attr.oid == const_oid::db::rfc5912::ID_EXTENSION_REQ)
        .flat_map(|attr| attr.values.iter())
        .filter_map(|value| value.decode_as::<Vec<Extension>>().ok())
        .flatten()
        .collect()
}

/// Whether the requester asked to be made a certificate authority.
pub fn requests_authority(csr: &CertReq) -> bool {
    requested_extensions(csr)
        .iter()
        .filter(|ext| ext.extn_id == BasicConstraints::OID)
        .filter_map(|ext| BasicConstraints::from_der(ext.extn_value.as_bytes()).ok())
        .any(|bc| bc.ca)
}

fn find_extension<T>(certificate: &Certificate) -> Result<Option<T>>
where
    T: AssociatedOid + for<'a> Decode<'a>,
{
    let Some(extensions) = &certificate.tbs_certificate.extensions else {
        return Ok(None);
    };

    extensions
        .iter()
        .find(|ext| ext.extn_id == T::OID)
        .map(|ext| T::from_der(ext.extn_value.as_bytes()))
        .transpose()
        .map_err(CaError::from)
}

/// The basic constraints extension of a certificate, if present.
pub fn basic_constraints(certificate: &Certificate) -> Result<Option<BasicConstraints>> {
    find_extension(certificate)
}

/// The key usage extension of a certificate, if present.
pub fn key_usage(certificate: &Certificate) -> Result<Option<KeyUsage>> {
    find_extension(certificate)
}

/// The subject key identifier of a certificate, if present.
pub fn subject_key_identifier(certificate: &Certificate) -> Result<Option<Vec<u8>>> {
    Ok(find_extension::<SubjectKeyIdentifier>(certificate)?
        .map(|ski| ski.0.as_bytes().to_vec()))
}

/// Key identifier derived from a public key (RFC 7093, method 1).
pub fn key_identifier(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    let digest = Sha256::digest(spki.subject_public_key.raw_bytes());
    digest[..20].to_vec()
}

fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Positive, and never zero.
    bytes[0] &= 0x7F;
    bytes[0] |= 0x01;
    Ok(SerialNumber::new(&bytes)?)
}

fn x509_time(instant: DateTime<Utc>) -> Result<Time> {
    let datetime = der::DateTime::from_system_time(instant.into())?;
    if datetime.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_date_time(datetime)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(datetime)))
    }
}

fn chrono_time(time: &Time) -> DateTime<Utc> {
    DateTime::<Utc>::from(time.to_system_time())
}

// Key encipherment only makes sense for RSA keys (RFC 5480 section 3).
fn leaf_key_usage(public_key: &SubjectPublicKeyInfoOwned) -> KeyUsage {
    if public_key.algorithm.oid == const_oid::db::rfc5912::RSA_ENCRYPTION {
        KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment)
    } else {
        KeyUsage(KeyUsages::DigitalSignature.into())
    }
}

/// The attributes of a certificate to be issued.
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    /// Subject of the new certificate.
    pub subject: Name,
    /// Subject of the issuing authority.
    pub issuer: Name,
    /// Validity of the new certificate.
    pub validity: ValidityWindow,
    /// Public key being certified.
    pub public_key: SubjectPublicKeyInfoOwned,
    /// Role granted by the issuer.
    pub role: CertificateRole,
    /// Key identifier of the issuing authority, if known.
    pub issuer_key_identifier: Option<Vec<u8>>,
    /// Scheme of the issuing key.
    pub signature_algorithm: SigningAlgorithm,
}

impl CertificateTemplate {
    fn extensions(&self) -> Result<Vec<Extension>> {
        let mut extensions = Vec::with_capacity(5);

        let (constraints, usage) = match self.role {
            CertificateRole::Leaf => (
                BasicConstraints {
                    ca: false,
                    path_len_constraint: None,
                },
                leaf_key_usage(&self.public_key),
            ),
            CertificateRole::Authority { path_length } => (
                BasicConstraints {
                    ca: true,
                    path_len_constraint: path_length,
                },
                KeyUsage(
                    KeyUsages::KeyCertSign | KeyUsages::CRLSign | KeyUsages::DigitalSignature,
                ),
            ),
        };

        let ext = constraints.to_extension(&self.subject, &extensions)?;
        extensions.push(ext);
        let ext = usage.to_extension(&self.subject, &extensions)?;
        extensions.push(ext);

        if !self.role.is_authority() {
            let eku = ExtendedKeyUsage(vec![
                const_oid::db::rfc5280::ID_KP_SERVER_AUTH,
                const_oid::db::rfc5280::ID_KP_CLIENT_AUTH,
            ]);
            let ext = eku.to_extension(&self.subject, &extensions)?;
            extensions.push(ext);
        }

        let ski = SubjectKeyIdentifier(OctetString::new(key_identifier(&self.public_key))?);
        let ext = ski.to_extension(&self.subject, &extensions)?;
        extensions.push(ext);

        if let Some(issuer_key) = &self.issuer_key_identifier {
            let aki = AuthorityKeyIdentifier {
                key_identifier: Some(OctetString::new(issuer_key.clone())?),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            };
            let ext = aki.to_extension(&self.subject, &extensions)?;
            extensions.push(ext);
        }

        Ok(extensions)
    }

    /// Assemble the to-be-signed certificate structure.
    pub fn to_tbs(&self) -> Result<TbsCertificate> {
        Ok(TbsCertificate {
            version: Version::V3,
            serial_number: random_serial()?,
            signature: self.signature_algorithm.identifier(),
            issuer: self.issuer.clone(),
            validity: Validity {
                not_before: x509_time(self.validity.not_before())?,
                not_after: x509_time(self.validity.not_after())?,
            },
            subject: self.subject.clone(),
            subject_public_key_info: self.public_key.clone(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(self.extensions()?),
        })
    }
}

/// Build a certificate from `template`, and sign it with `sign`.
///
/// `sign` receives the SHA-256 digest of the DER encoded `TBSCertificate`
/// and must return the signature in the encoding X.509 expects.
pub async fn build_and_encode<F, Fut>(
    template: &CertificateTemplate,
    sign: F,
) -> Result<IssuedCertificate>
where
    F: FnOnce(Vec<u8>) -> Fut,
    Fut: Future<Output = ::std::result::Result<Vec<u8>, RemoteError>>,
{
    let tbs_certificate = template.to_tbs()?;
    let tbs_der = tbs_certificate.to_der()?;
    let digest = Sha256::digest(&tbs_der).to_vec();

    tracing::trace!(
        algorithm = %template.signature_algorithm,
        "Requesting signature over certificate digest"
    );
    let signature = sign(digest).await?;

    let certificate = Certificate {
        tbs_certificate,
        signature_algorithm: template.signature_algorithm.identifier(),
        signature: BitString::from_bytes(&signature)?,
    };

    IssuedCertificate::try_from(certificate)
}

/// A newly issued certificate, encoded as ASN.1 DER.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    certificate: Certificate,
    der: Vec<u8>,
}

impl IssuedCertificate {
    /// Decode a DER certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let certificate = Certificate::from_der(der)?;
        Ok(IssuedCertificate {
            certificate,
            der: der.to_vec(),
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

    /// Encode this certificate as a PEM document.
    pub fn to_pem(&self) -> Result<String> {
        Ok(pem_rfc7468::encode_string(
            PEM_TAG_CERTIFICATE,
            base64ct::LineEnding::default(),
            &self.der,
        )?)
    }

    /// Subject of the certificate.
    pub fn subject(&self) -> &Name {
        &self.certificate.tbs_certificate.subject
    }

    /// Issuer of the certificate.
    pub fn issuer(&self) -> &Name {
        &self.certificate.tbs_certificate.issuer
    }

    /// Certified public key.
    pub fn public_key(&self) -> &SubjectPublicKeyInfoOwned {
        &self.certificate.tbs_certificate.subject_public_key_info
    }

    /// Start of the validity period.
    pub fn not_before(&self) -> DateTime<Utc> {
        chrono_time(&self.certificate.tbs_certificate.validity.not_before)
    }

    /// End of the validity period.
    pub fn not_after(&self) -> DateTime<Utc> {
        chrono_time(&self.certificate.tbs_certificate.validity.not_after)
    }

    /// The basic constraints extension, if present.
    pub fn basic_constraints(&self) -> Result<Option<BasicConstraints>> {
        basic_constraints(&self.certificate)
    }

    /// The key usage extension, if present.
    pub fn key_usage(&self) -> Result<Option<KeyUsage>> {
        key_usage(&self.certificate)
    }

    /// Whether this certificate may act as a certificate authority.
    pub fn is_authority(&self) -> Result<bool> {
        Ok(self.basic_constraints()?.is_some_and(|bc| bc.ca))
    }
}

impl TryFrom<Certificate> for IssuedCertificate {
    type Error = CaError;

    fn try_from(certificate: Certificate) -> Result<Self> {
        let der = certificate.to_der()?;
        Ok(IssuedCertificate { certificate, der })
    }
}

impl AsRef<[u8]> for IssuedCertificate {
    fn as_ref(&self) -> &[u8] {
        &self.der
    }
}

impl From<IssuedCertificate> for Vec<u8> {
    fn from(value: IssuedCertificate) -> Self {
        value.der
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use chrono::TimeDelta;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::pkcs8::EncodePublicKey;

    use super::*;
    use crate::csr::CertificateSigningRequest;

    fn spki_of(key: &p256::ecdsa::SigningKey) -> SubjectPublicKeyInfoOwned {
        let der = key.verifying_key().to_public_key_der().unwrap();
        SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap()
    }

    fn device_csr(key: &p256::ecdsa::SigningKey) -> Vec<u8> {
        CertificateSigningRequest::new("CN=device-42")
            .unwrap()
            .sign::<_, p256::ecdsa::DerSignature>(key)
            .unwrap()
            .as_ref()
            .to_vec()
    }

    #[test]
    fn parse_and_verify_der_request() {
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let csr = parse_request(&device_csr(&key)).unwrap();
        verify_request(&csr).unwrap();
        assert_eq!(csr.info.subject.to_string(), "CN=device-42");
    }

    #[test]
    fn parse_pem_request() {
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let pem = CertificateSigningRequest::new("CN=device-42")
            .unwrap()
            .sign::<_, p256::ecdsa::DerSignature>(&key)
            .unwrap()
            .to_pem()
            .unwrap();

        let csr = parse_request(pem.as_bytes()).unwrap();
        verify_request(&csr).unwrap();
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_request(b"definitely not a CSR"),
            Err(CaError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_request(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"),
            Err(CaError::MalformedRequest(_))
        ));
    }

    #[test]
    fn request_signed_by_other_key_is_rejected() {
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let other = p256::ecdsa::SigningKey::random(&mut OsRng);

        let mut csr = parse_request(&device_csr(&key)).unwrap();
        csr.info.public_key = spki_of(&other);

        assert!(matches!(
            verify_request(&csr),
            Err(CaError::InvalidSignature(_))
        ));
    }

    #[test]
    fn requested_authority_is_detected() {
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let der = CertificateSigningRequest::new("CN=sneaky")
            .unwrap()
            .request_authority(Some(4))
            .sign::<_, p256::ecdsa::DerSignature>(&key)
            .unwrap();
        let csr = parse_request(der.as_ref()).unwrap();
        assert!(requests_authority(&csr));

        let csr = parse_request(&device_csr(&key)).unwrap();
        assert!(!requests_authority(&csr));
    }

    #[tokio::test]
    async fn build_encode_and_parse_back() {
        let issuer_key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let subject_key = p256::ecdsa::SigningKey::random(&mut OsRng);

        let now = Utc::now();
        let template = CertificateTemplate {
            subject: Name::from_str("CN=device-42").unwrap(),
            issuer: Name::from_str("CN=Root").unwrap(),
            validity: ValidityWindow::days_from(now, 30).unwrap(),
            public_key: spki_of(&subject_key),
            role: CertificateRole::Leaf,
            issuer_key_identifier: Some(key_identifier(&spki_of(&issuer_key))),
            signature_algorithm: SigningAlgorithm::EcdsaP256Sha256,
        };

        let issued = build_and_encode(&template, |digest| async move {
            let signature: p256::ecdsa::Signature = issuer_key.sign_prehash(&digest).unwrap();
            Ok::<_, RemoteError>(signature.to_der().as_bytes().to_vec())
        })
        .await
        .unwrap();

        let parsed = IssuedCertificate::from_der(issued.as_der()).unwrap();
        assert_eq!(parsed.subject().to_string(), "CN=device-42");
        assert_eq!(parsed.issuer().to_string(), "CN=Root");
        assert_eq!(parsed.public_key(), &template.public_key);
        assert_eq!(parsed.not_before(), template.validity.not_before());
        assert_eq!(parsed.not_after(), template.validity.not_after());
        assert_eq!(
            parsed.not_after() - parsed.not_before(),
            TimeDelta::days(30)
        );
        assert!(!parsed.is_authority().unwrap());

        let usage = parsed.key_usage().unwrap().unwrap();
        assert!(usage.digital_signature());
        assert!(!usage.key_encipherment());
    }

    #[test]
    fn rsa_leaf_may_encipher_keys() {
        let key = rsa::RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let der = key.to_public_key().to_public_key_der().unwrap();
        let spki = SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap();
        let usage = leaf_key_usage(&spki);
        assert!(usage.digital_signature());
        assert!(usage.key_encipherment());

        let ec = spki_of(&p256::ecdsa::SigningKey::random(&mut OsRng));
        assert!(!leaf_key_usage(&ec).key_encipherment());
    }

    #[tokio::test]
    async fn signing_failure_is_propagated() {
        let subject_key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let template = CertificateTemplate {
            subject: Name::from_str("CN=device-42").unwrap(),
            issuer: Name::from_str("CN=Root").unwrap(),
            validity: ValidityWindow::days_from(Utc::now(), 1).unwrap(),
            public_key: spki_of(&subject_key),
            role: CertificateRole::Authority {
                path_length: Some(0),
            },
            issuer_key_identifier: None,
            signature_algorithm: SigningAlgorithm::EcdsaP256Sha256,
        };

        let err = build_and_encode(&template, |_| async {
            Err::<Vec<u8>, _>(RemoteError::new(
                crate::error::RemoteErrorKind::Unavailable,
                "try later",
            ))
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn far_future_uses_generalized_time() {
        let instant = DateTime::parse_from_rfc3339("2051-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(matches!(x509_time(instant).unwrap(), Time::GeneralTime(_)));
        assert_eq!(chrono_time(&x509_time(instant).unwrap()), instant);
    }
}
