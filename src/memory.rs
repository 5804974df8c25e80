//! # An in-process key store
//!
//! [`MemoryKeyStore`] implements [`RemoteKeyStore`] with P-256 keys held in
//! memory. Keys never leave the store: callers only ever receive certificates
//! and [`KeyHandle`]s, exactly as they would from a real key vault. It counts
//! the calls made to it, and can be told to fail the next call, which makes it
//! useful for exercising the issuance pipeline locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use der::Decode;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::pkcs8::EncodePublicKey;
use rand_core::OsRng;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::codec::{self, CertificateTemplate};
use crate::error::{RemoteError, RemoteErrorKind};
use crate::remote::{
    AuthorityParameters, IssuerCertificate, KeyHandle, RemoteKeyStore, SigningAlgorithm,
};
use crate::request::{parse_name, CertificateRole, IssuerIdentity};

#[derive(Debug, Clone)]
struct StoredCertificate {
    der: Vec<u8>,
    key: KeyHandle,
}

#[derive(Debug, Default)]
struct Vault {
    certificates: HashMap<String, Vec<StoredCertificate>>,
    keys: HashMap<String, p256::ecdsa::SigningKey>,
}

/// A [`RemoteKeyStore`] which keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    vault: Mutex<Vault>,
    failure: Mutex<Option<RemoteErrorKind>>,
    create_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    sign_calls: AtomicUsize,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to this store fail with `kind`.
    pub fn fail_next(&self, kind: RemoteErrorKind) {
        *self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(kind);
    }

    /// Number of `create_authority` calls which reached the store.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_certificate` calls which reached the store.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `sign_digest` calls which reached the store.
    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<(), RemoteError> {
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match failure {
            Some(kind) => Err(RemoteError::new(kind, "injected failure")),
            None => Ok(()),
        }
    }

    fn vault(&self) -> std::sync::MutexGuard<'_, Vault> {
        self.vault.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key_id(identity: &IssuerIdentity, version: usize) -> String {
    format!("memory:///keys/{identity}/{version}")
}

#[async_trait]
impl RemoteKeyStore for MemoryKeyStore {
    async fn version_count(&self, identity: &IssuerIdentity) -> Result<usize, RemoteError> {
        self.injected_failure()?;
        Ok(self
            .vault()
            .certificates
            .get(identity.as_str())
            .map_or(0, Vec::len))
    }

    async fn create_authority(
        &self,
        identity: &IssuerIdentity,
        parameters: &AuthorityParameters,
    ) -> Result<(), RemoteError> {
        self.injected_failure()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.vault().certificates.contains_key(identity.as_str()) {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("{identity} already exists"),
            ));
        }

        let subject = parse_name(&parameters.subject)
            .map_err(|err| RemoteError::new(RemoteErrorKind::Rejected, err.to_string()))?;
        tracing::debug!(
            requested_bits = parameters.key_size,
            "Memory key store only creates P-256 keys"
        );

        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let public_key = key
            .verifying_key()
            .to_public_key_der()
            .map_err(|err| RemoteError::protocol("encoding public key", err))?;
        let public_key = SubjectPublicKeyInfoOwned::from_der(public_key.as_bytes())
            .map_err(|err| RemoteError::protocol("decoding public key", err))?;

        let template = CertificateTemplate {
            subject: subject.clone(),
            issuer: subject,
            validity: parameters.validity,
            issuer_key_identifier: Some(codec::key_identifier(&public_key)),
            public_key,
            role: CertificateRole::Authority {
                path_length: Some(parameters.path_length),
            },
            signature_algorithm: SigningAlgorithm::EcdsaP256Sha256,
        };

        let signer = key.clone();
        let certificate = codec::build_and_encode(&template, |digest| async move {
            sign_prehash(&signer, &digest)
        })
        .await
        .map_err(|err| RemoteError::new(RemoteErrorKind::Rejected, err.to_string()))?;

        let mut vault = self.vault();
        if vault.certificates.contains_key(identity.as_str()) {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("{identity} was created concurrently"),
            ));
        }

        let handle = KeyHandle::new(key_id(identity, 1), SigningAlgorithm::EcdsaP256Sha256);
        vault.keys.insert(handle.id().to_owned(), key);
        vault.certificates.insert(
            identity.as_str().to_owned(),
            vec![StoredCertificate {
                der: certificate.into(),
                key: handle,
            }],
        );

        tracing::debug!(issuer = %identity, at = %Utc::now(), "Stored new authority");
        Ok(())
    }

    async fn fetch_certificate(
        &self,
        identity: &IssuerIdentity,
    ) -> Result<Option<IssuerCertificate>, RemoteError> {
        self.injected_failure()?;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let latest = self
            .vault()
            .certificates
            .get(identity.as_str())
            .and_then(|versions| versions.last().cloned());

        latest
            .map(|stored| {
                IssuerCertificate::from_der(stored.der, stored.key)
                    .map_err(|err| RemoteError::protocol("decoding stored certificate", err))
            })
            .transpose()
    }

    async fn sign_digest(&self, key: &KeyHandle, digest: &[u8]) -> Result<Vec<u8>, RemoteError> {
        self.injected_failure()?;
        self.sign_calls.fetch_add(1, Ordering::SeqCst);

        let signer = self.vault().keys.get(key.id()).cloned().ok_or_else(|| {
            RemoteError::new(RemoteErrorKind::NotFound, format!("no key {}", key.id()))
        })?;
        sign_prehash(&signer, digest)
    }
}

fn sign_prehash(key: &p256::ecdsa::SigningKey, digest: &[u8]) -> Result<Vec<u8>, RemoteError> {
    if digest.len() != 32 {
        return Err(RemoteError::new(
            RemoteErrorKind::Rejected,
            format!("expected a 32 byte digest, got {} bytes", digest.len()),
        ));
    }

    let signature: p256::ecdsa::Signature = key
        .sign_prehash(digest)
        .map_err(|err| RemoteError::new(RemoteErrorKind::Rejected, "signing failed").with_source(err))?;
    Ok(signature.to_der().as_bytes().to_vec())
}
