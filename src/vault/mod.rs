//! # Azure Key Vault as a remote key store
//!
//! [`VaultClient`] implements [`RemoteKeyStore`] over the Key Vault REST API.
//! Authority keys are created as non-exportable RSA keys inside the vault,
//! and all signatures are made by the vault's `sign` operation.
//!
//! ```no_run
//! # use vaultca::vault::VaultClient;
//! # use vaultca::{CertificateAuthority, IssuerIdentity};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = VaultClient::builder("https://my-vault.vault.azure.net".parse()?)
//!     .access_token(std::env::var("VAULTCA_ACCESS_TOKEN")?)
//!     .timeout(std::time::Duration::from_secs(30))
//!     .build()?;
//!
//! let authority = CertificateAuthority::new(client);
//! let issuer = authority
//!     .issuer_certificate(&IssuerIdentity::new("root-ca")?)
//!     .await?;
//! println!("{}", issuer.subject());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use der::Decode;
use reqwest::{Method, Url};
use x509_cert::request::CertReq;
use x509_cert::Certificate;

use crate::codec::{self, CertificateTemplate};
use crate::error::{CaError, RemoteError, RemoteErrorKind};
use crate::remote::{
    self, AuthorityParameters, IssuerCertificate, KeyHandle, RemoteKeyStore, SigningAlgorithm,
};
use crate::request::{parse_name, CertificateRole, IssuerIdentity, DIGEST_BITS};

mod client;
mod schema;

pub use self::client::{VaultClient, VaultClientBuilder, API_VERSION};

/// Issuer name which tells the vault the certificate will be signed externally.
const EXTERNAL_ISSUER: &str = "Unknown";

/// Length of a raw `r || s` P-256 signature.
const P256_SIGNATURE_LEN: usize = 64;

#[async_trait]
impl RemoteKeyStore for VaultClient {
    #[tracing::instrument(skip_all, fields(issuer = %identity))]
    async fn version_count(&self, identity: &IssuerIdentity) -> Result<usize, RemoteError> {
        let mut next = Some(self.url(&["certificates", identity.as_str(), "versions"])?);
        let mut count = 0;

        while let Some(url) = next.take() {
            let Some(page) = self
                .send::<(), schema::VersionPage>(Method::GET, url, None)
                .await?
            else {
                return Ok(0);
            };

            count += page.value.len();
            next = page
                .next_link
                .map(|link| {
                    Url::parse(&link)
                        .map_err(|err| RemoteError::protocol("invalid nextLink", err))
                })
                .transpose()?;
        }

        tracing::debug!(count, "Counted certificate versions");
        Ok(count)
    }

    #[tracing::instrument(skip_all, fields(issuer = %identity, subject = %parameters.subject))]
    async fn create_authority(
        &self,
        identity: &IssuerIdentity,
        parameters: &AuthorityParameters,
    ) -> Result<(), RemoteError> {
        if parameters.hash_bits != DIGEST_BITS {
            return Err(RemoteError::new(
                RemoteErrorKind::Rejected,
                format!("unsupported digest size {}", parameters.hash_bits),
            ));
        }

        if self.version_count(identity).await? > 0 {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("certificate {identity} already exists"),
            ));
        }

        let subject = parse_name(&parameters.subject)
            .map_err(|err| RemoteError::new(RemoteErrorKind::Rejected, err.to_string()))?;

        let body = schema::CreateCertificate {
            policy: schema::CertificatePolicy {
                key_props: schema::KeyProperties {
                    exportable: false,
                    kty: "RSA",
                    key_size: parameters.key_size,
                    reuse_key: false,
                },
                x509_props: schema::X509Properties {
                    subject: parameters.subject.clone(),
                    key_usage: vec!["keyCertSign", "cRLSign", "digitalSignature"],
                    validity_months: months_between(parameters),
                },
                issuer: schema::IssuerParameters {
                    name: EXTERNAL_ISSUER,
                },
            },
        };

        tracing::debug!(key_size = parameters.key_size, "Creating authority key");
        let operation: schema::CertificateOperation = self
            .send_expecting(
                Method::POST,
                self.url(&["certificates", identity.as_str(), "create"])?,
                Some(&body),
            )
            .await?;

        // The vault hands back a CSR for the new key; only its public key is used.
        let csr = Base64::decode_vec(&operation.csr)
            .map_err(|err| RemoteError::protocol("decoding pending csr", err))?;
        let csr = CertReq::from_der(&csr)
            .map_err(|err| RemoteError::protocol("decoding pending csr", err))?;
        let public_key = csr.info.public_key;

        let key: schema::KeyBundle = self
            .send_expecting::<(), _>(
                Method::GET,
                self.url(&["keys", identity.as_str()])?,
                None,
            )
            .await?;
        let handle = KeyHandle::new(key.key.kid, SigningAlgorithm::RsaPkcs1Sha256);

        let template = CertificateTemplate {
            subject: subject.clone(),
            issuer: subject,
            validity: parameters.validity,
            issuer_key_identifier: Some(codec::key_identifier(&public_key)),
            public_key,
            role: CertificateRole::Authority {
                path_length: Some(parameters.path_length),
            },
            signature_algorithm: handle.algorithm(),
        };

        let certificate = codec::build_and_encode(&template, remote::bind_key(self, handle))
            .await
            .map_err(into_remote)?;

        let merge = schema::MergeCertificate {
            x5c: vec![Base64::encode_string(certificate.as_der())],
        };
        let _: serde_json::Value = self
            .send_expecting(
                Method::POST,
                self.url(&["certificates", identity.as_str(), "pending", "merge"])?,
                Some(&merge),
            )
            .await?;

        tracing::debug!("Merged self-signed authority certificate");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(issuer = %identity))]
    async fn fetch_certificate(
        &self,
        identity: &IssuerIdentity,
    ) -> Result<Option<IssuerCertificate>, RemoteError> {
        let Some(bundle) = self
            .send::<(), schema::CertificateBundle>(
                Method::GET,
                self.url(&["certificates", identity.as_str()])?,
                None,
            )
            .await?
        else {
            return Ok(None);
        };

        let der = Base64::decode_vec(&bundle.cer)
            .map_err(|err| RemoteError::protocol("decoding certificate", err))?;
        let certificate = Certificate::from_der(&der)
            .map_err(|err| RemoteError::protocol("decoding certificate", err))?;

        let spki = &certificate.tbs_certificate.subject_public_key_info;
        let algorithm = SigningAlgorithm::for_public_key(spki).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::Protocol,
                format!("unsupported key algorithm {}", spki.algorithm.oid),
            )
        })?;

        IssuerCertificate::from_der(der, KeyHandle::new(bundle.kid, algorithm))
            .map(Some)
            .map_err(|err| RemoteError::protocol("decoding certificate", err))
    }

    #[tracing::instrument(skip_all, fields(kid = key.id(), alg = %key.algorithm()))]
    async fn sign_digest(&self, key: &KeyHandle, digest: &[u8]) -> Result<Vec<u8>, RemoteError> {
        let mut url = Url::parse(key.id())
            .map_err(|err| RemoteError::protocol("invalid key identifier", err))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::new(RemoteErrorKind::Protocol, "invalid key identifier"))?
            .pop_if_empty()
            .push("sign");

        let body = schema::SignRequest {
            alg: key.algorithm().jose_name(),
            value: Base64UrlUnpadded::encode_string(digest),
        };
        let response: schema::SignResponse =
            self.send_expecting(Method::POST, url, Some(&body)).await?;
        let signature = Base64UrlUnpadded::decode_vec(&response.value)
            .map_err(|err| RemoteError::protocol("decoding signature", err))?;

        x509_signature(key.algorithm(), signature)
    }
}

/// Convert a signature from JOSE form to the encoding X.509 expects.
fn x509_signature(algorithm: SigningAlgorithm, signature: Vec<u8>) -> Result<Vec<u8>, RemoteError> {
    match algorithm {
        SigningAlgorithm::RsaPkcs1Sha256 => Ok(signature),
        SigningAlgorithm::EcdsaP256Sha256 => {
            if signature.len() != P256_SIGNATURE_LEN {
                return Err(RemoteError::new(
                    RemoteErrorKind::Protocol,
                    format!("expected a {P256_SIGNATURE_LEN} byte signature, got {}", signature.len()),
                ));
            }
            let signature = p256::ecdsa::Signature::from_slice(&signature)
                .map_err(|err| RemoteError::protocol("decoding ES256 signature", err))?;
            Ok(signature.to_der().as_bytes().to_vec())
        }
    }
}

fn months_between(parameters: &AuthorityParameters) -> u32 {
    let days = (parameters.validity.not_after() - parameters.validity.not_before()).num_days();
    u32::try_from(days / 30).unwrap_or(u32::MAX).max(1)
}

fn into_remote(error: CaError) -> RemoteError {
    match error {
        CaError::RemoteUnavailable(error)
        | CaError::RemotePermissionDenied(error)
        | CaError::Remote(error) => error,
        other => RemoteError::new(RemoteErrorKind::Rejected, other.to_string()),
    }
}
