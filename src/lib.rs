//! # A certificate authority backed by a remote key vault
//!
//! `vaultca` issues X.509 certificates from a certificate authority whose
//! private key never leaves a remote key store. It does two things:
//!
//! 1. [`CertificateAuthority::ensure_authority`] creates a self-signed root
//!    authority key and certificate in the store, unless one already exists.
//! 2. [`CertificateAuthority::sign`] verifies a certificate signing request
//!    and issues a certificate for it, signed by the authority's remote key.
//!
//! The key store is anything which implements [`remote::RemoteKeyStore`].
//! Two are provided: [`vault::VaultClient`] talks to Azure Key Vault, and
//! [`memory::MemoryKeyStore`] keeps keys in process for local use and tests.
//!
//! ```
//! # use std::sync::Arc;
//! # use rand_core::OsRng;
//! use vaultca::csr::CertificateSigningRequest;
//! use vaultca::memory::MemoryKeyStore;
//! use vaultca::{AuthorityRequest, CertificateAuthority, IssuerIdentity, SigningRequest};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), vaultca::CaError> {
//! let authority = CertificateAuthority::new(MemoryKeyStore::new());
//! let issuer = IssuerIdentity::new("root-ca")?;
//!
//! let root = AuthorityRequest::builder()
//!     .subject("CN=Root")
//!     .path_length(1)
//!     .validity_months(12)
//!     .build()?;
//! authority.ensure_authority(&issuer, root).await?;
//!
//! let device_key = p256::ecdsa::SigningKey::random(&mut OsRng);
//! let csr = CertificateSigningRequest::new("CN=device-42")?
//!     .sign::<_, p256::ecdsa::DerSignature>(&device_key)?;
//!
//! let request = SigningRequest::builder(csr)
//!     .issuer(issuer)
//!     .validity_days(30)
//!     .leaf()
//!     .build()?;
//! let certificate = authority.sign(request).await?;
//! assert_eq!(certificate.issuer().to_string(), "CN=Root");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod authority;
pub mod codec;
pub mod config;
pub mod csr;
pub mod error;
pub mod remote;
pub mod request;
mod signer;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

#[cfg(feature = "vault")]
pub mod vault;

pub use crate::authority::{Bootstrap, CertificateAuthority};
pub use crate::codec::IssuedCertificate;
pub use crate::error::{CaError, Result};
pub use crate::request::{
    AuthorityRequest, CertificateRole, IssuerIdentity, SigningRequest, ValidityWindow,
};
