//! # Authority bootstrapping
//!
//! A [`CertificateAuthority`] drives a [`RemoteKeyStore`] to create an
//! authority key and certificate, and later to sign requests with it.
//! Bootstrapping is idempotent by skipping: if any version of the named key
//! already exists, nothing is created or rotated.

use chrono::Utc;

use crate::error::{CaError, Result};
use crate::remote::{AuthorityParameters, IssuerCertificate, RemoteKeyStore};
use crate::request::{AuthorityRequest, IssuerIdentity, ValidityWindow, DIGEST_BITS};

/// Outcome of [`CertificateAuthority::ensure_authority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// A new authority key and certificate were created.
    Created,

    /// The authority already existed, and was left untouched.
    AlreadyExists,
}

/// A certificate authority whose keys are held by a remote key store.
///
/// The authority holds no state of its own; every call reads from, or acts
/// through, the key store. It is safe to share between tasks, and to run many
/// [`sign`][CertificateAuthority::sign] calls concurrently.
#[derive(Debug, Clone)]
pub struct CertificateAuthority<S> {
    store: S,
}

impl<S> CertificateAuthority<S>
where
    S: RemoteKeyStore,
{
    /// Create an authority backed by `store`.
    pub fn new(store: S) -> Self {
        CertificateAuthority { store }
    }

    /// The underlying key store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Make sure an authority key and certificate exist under `identity`.
    ///
    /// Key store failures are returned as-is, and never retried here.
    #[tracing::instrument(skip_all, fields(issuer = %identity))]
    pub async fn ensure_authority(
        &self,
        identity: &IssuerIdentity,
        request: AuthorityRequest,
    ) -> Result<Bootstrap> {
        let versions = self.store.version_count(identity).await?;
        if versions > 0 {
            tracing::info!(
                versions,
                "A certificate with the issuer name {} already exists",
                identity
            );
            return Ok(Bootstrap::AlreadyExists);
        }

        tracing::info!("No existing certificate found, creating a new authority");
        let parameters = AuthorityParameters {
            subject: request.subject().to_owned(),
            validity: ValidityWindow::months_from(Utc::now(), request.validity_months())?,
            key_size: request.key_size(),
            hash_bits: DIGEST_BITS,
            path_length: request.path_length(),
        };
        self.store.create_authority(identity, &parameters).await?;

        tracing::info!(
            subject = request.subject(),
            path_length = request.path_length(),
            not_after = %parameters.validity.not_after(),
            "Created authority {}",
            identity
        );
        Ok(Bootstrap::Created)
    }

    /// Fetch the current certificate of the authority named `identity`.
    pub async fn issuer_certificate(&self, identity: &IssuerIdentity) -> Result<IssuerCertificate> {
        self.store
            .fetch_certificate(identity)
            .await?
            .ok_or_else(|| CaError::UnknownIssuer(identity.to_string()))
    }

    /// Fetch the current certificates of several authorities, in order.
    ///
    /// Names with no certificate in the store are skipped.
    pub async fn issuer_certificates(
        &self,
        identities: &[IssuerIdentity],
    ) -> Result<Vec<IssuerCertificate>> {
        let mut certificates = Vec::with_capacity(identities.len());
        for identity in identities {
            match self.store.fetch_certificate(identity).await? {
                Some(certificate) => certificates.push(certificate),
                None => tracing::debug!("No certificate found for {identity}"),
            }
        }
        Ok(certificates)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::error::RemoteErrorKind;
    use crate::memory::MemoryKeyStore;

    fn root_request() -> AuthorityRequest {
        AuthorityRequest::builder()
            .subject("CN=Root")
            .path_length(2)
            .validity_months(120)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = Arc::new(MemoryKeyStore::new());
        let authority = CertificateAuthority::new(store.clone());
        let identity = IssuerIdentity::new("root-ca").unwrap();

        let outcome = authority
            .ensure_authority(&identity, root_request())
            .await
            .unwrap();
        assert_eq!(outcome, Bootstrap::Created);

        let outcome = authority
            .ensure_authority(&identity, root_request())
            .await
            .unwrap();
        assert_eq!(outcome, Bootstrap::AlreadyExists);
        assert_eq!(store.create_calls(), 1);
    }

    #[tokio::test]
    async fn remote_failures_are_surfaced() {
        let store = MemoryKeyStore::new();
        store.fail_next(RemoteErrorKind::PermissionDenied);
        let authority = CertificateAuthority::new(store);
        let identity = IssuerIdentity::new("root-ca").unwrap();

        let err = authority
            .ensure_authority(&identity, root_request())
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::RemotePermissionDenied(_)));
        assert_eq!(authority.store().create_calls(), 0);
    }

    #[tokio::test]
    async fn missing_issuer_is_unknown() {
        let authority = CertificateAuthority::new(MemoryKeyStore::new());
        let identity = IssuerIdentity::new("nobody").unwrap();

        let err = authority.issuer_certificate(&identity).await.unwrap_err();
        assert!(matches!(err, CaError::UnknownIssuer(name) if name == "nobody"));
    }

    #[tokio::test]
    async fn issuer_certificates_skip_missing_names() {
        let authority = CertificateAuthority::new(MemoryKeyStore::new());
        let root = IssuerIdentity::new("root-ca").unwrap();
        let nobody = IssuerIdentity::new("nobody").unwrap();
        authority
            .ensure_authority(&root, root_request())
            .await
            .unwrap();

        let certificates = authority
            .issuer_certificates(&[nobody.clone(), root.clone(), nobody])
            .await
            .unwrap();
        assert_eq!(certificates.len(), 1);
        assert_eq!(
            certificates[0].certificate().tbs_certificate.subject.to_string(),
            "CN=Root"
        );
        assert_eq!(authority.store().fetch_calls(), 3);

        let none = authority.issuer_certificates(&[]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn issuer_certificates_surface_remote_failures() {
        let authority = CertificateAuthority::new(MemoryKeyStore::new());
        let root = IssuerIdentity::new("root-ca").unwrap();
        authority
            .ensure_authority(&root, root_request())
            .await
            .unwrap();

        authority.store().fail_next(RemoteErrorKind::Unavailable);
        let err = authority.issuer_certificates(&[root]).await.unwrap_err();
        assert!(matches!(err, CaError::RemoteUnavailable(_)));
    }
}
