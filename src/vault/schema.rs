//! JSON payloads exchanged with the key vault

use serde::{Deserialize, Serialize};

/// One page of `GET /certificates/{name}/versions`.
#[derive(Debug, Deserialize)]
pub(super) struct VersionPage {
    // Only the number of versions is used.
    #[serde(default)]
    pub(super) value: Vec<serde::de::IgnoredAny>,
    #[serde(rename = "nextLink", default)]
    pub(super) next_link: Option<String>,
}

/// A certificate bundle, as returned by `GET /certificates/{name}`.
#[derive(Debug, Deserialize)]
pub(super) struct CertificateBundle {
    pub(super) kid: String,
    pub(super) cer: String,
}

/// A key bundle, as returned by `GET /keys/{name}`.
#[derive(Debug, Deserialize)]
pub(super) struct KeyBundle {
    pub(super) key: JsonWebKey,
}

#[derive(Debug, Deserialize)]
pub(super) struct JsonWebKey {
    pub(super) kid: String,
}

#[derive(Debug, Serialize)]
pub(super) struct SignRequest<'a> {
    pub(super) alg: &'a str,
    pub(super) value: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct SignResponse {
    pub(super) value: String,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateCertificate {
    pub(super) policy: CertificatePolicy,
}

#[derive(Debug, Serialize)]
pub(super) struct CertificatePolicy {
    pub(super) key_props: KeyProperties,
    pub(super) x509_props: X509Properties,
    pub(super) issuer: IssuerParameters,
}

#[derive(Debug, Serialize)]
pub(super) struct KeyProperties {
    pub(super) exportable: bool,
    pub(super) kty: &'static str,
    pub(super) key_size: u32,
    pub(super) reuse_key: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct X509Properties {
    pub(super) subject: String,
    pub(super) key_usage: Vec<&'static str>,
    pub(super) validity_months: u32,
}

#[derive(Debug, Serialize)]
pub(super) struct IssuerParameters {
    pub(super) name: &'static str,
}

/// A pending certificate operation, which carries the CSR for the new key.
#[derive(Debug, Deserialize)]
pub(super) struct CertificateOperation {
    pub(super) csr: String,
}

#[derive(Debug, Serialize)]
pub(super) struct MergeCertificate {
    pub(super) x5c: Vec<String>,
}

/// The error document the vault returns with failed requests.
#[derive(Debug, Deserialize)]
pub(super) struct ErrorDocument {
    pub(super) error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorDetail {
    #[serde(default)]
    pub(super) code: Option<String>,
    #[serde(default)]
    pub(super) message: Option<String>,
}
