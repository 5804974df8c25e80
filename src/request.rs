//! Validated inputs to the two issuance operations
//!
//! Requests are always assembled through a builder, which rejects missing
//! or nonsensical fields when [`build`][SigningRequestBuilder::build] is called,
//! so the issuance pipeline never has to re-check for absent data.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, SubsecRound, TimeDelta, Utc};
use x509_cert::name::Name;

use crate::error::{CaError, Result};

/// Key size used for new authority keys unless one is requested.
pub const DEFAULT_AUTHORITY_KEY_SIZE: u32 = 4096;

/// Size in bits of the digest used for all signatures.
pub const DIGEST_BITS: u32 = 256;

/// How far before the moment of issuance a certificate becomes valid.
///
/// Verifiers with clocks running slightly behind ours will still
/// accept a freshly issued certificate.
pub fn clock_skew() -> TimeDelta {
    TimeDelta::days(1)
}

/// Logical name of an authority key and certificate in the key store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssuerIdentity(String);

impl IssuerIdentity {
    /// Create an identity from a non-empty name.
    pub fn new<S: Into<String>>(name: S) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CaError::MissingField("issuer"));
        }
        Ok(IssuerIdentity(name))
    }

    /// The name of this identity in the key store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssuerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IssuerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for IssuerIdentity {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        IssuerIdentity::new(s)
    }
}

pub(crate) fn parse_name(name: &str) -> Result<Name> {
    if name.trim().is_empty() {
        return Err(CaError::MissingField("subject"));
    }
    Name::from_str(name).map_err(|source| CaError::InvalidName {
        name: name.to_owned(),
        source,
    })
}

/// The period during which an issued certificate is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl ValidityWindow {
    /// A window starting one [`clock_skew`] before `now` and lasting `days`.
    pub fn days_from(now: DateTime<Utc>, days: i64) -> Result<Self> {
        if days <= 0 {
            return Err(CaError::InvalidValidityPeriod(days));
        }
        let not_before = Self::start(now);
        let not_after = TimeDelta::try_days(days)
            .and_then(|span| not_before.checked_add_signed(span))
            .ok_or(CaError::InvalidValidityPeriod(days))?;
        Ok(ValidityWindow {
            not_before,
            not_after,
        })
    }

    /// A window starting one [`clock_skew`] before `now` and lasting `months` calendar months.
    pub fn months_from(now: DateTime<Utc>, months: u32) -> Result<Self> {
        if months == 0 {
            return Err(CaError::InvalidValidityPeriod(0));
        }
        let not_before = Self::start(now);
        let not_after = not_before
            .checked_add_months(Months::new(months))
            .ok_or(CaError::InvalidValidityPeriod(months.into()))?;
        Ok(ValidityWindow {
            not_before,
            not_after,
        })
    }

    // X.509 times carry whole seconds only.
    fn start(now: DateTime<Utc>) -> DateTime<Utc> {
        now.trunc_subsecs(0) - clock_skew()
    }

    /// Start of the window.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the window.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Whether `instant` falls inside this window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.not_before <= instant && instant <= self.not_after
    }
}

/// Intent to create a certificate authority in the key store.
#[derive(Debug, Clone)]
pub struct AuthorityRequest {
    subject: String,
    path_length: u8,
    key_size: u32,
    validity_months: u32,
}

impl AuthorityRequest {
    /// Start building an authority request.
    pub fn builder() -> AuthorityRequestBuilder {
        AuthorityRequestBuilder::default()
    }

    /// Distinguished name of the authority, in RFC 4514 form.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Maximum number of subordinate authorities below this one.
    pub fn path_length(&self) -> u8 {
        self.path_length
    }

    /// Size of the authority key, in bits.
    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    /// How long the authority certificate is valid for.
    pub fn validity_months(&self) -> u32 {
        self.validity_months
    }
}

/// Builder for an [`AuthorityRequest`].
#[derive(Debug, Default)]
pub struct AuthorityRequestBuilder {
    subject: Option<String>,
    path_length: Option<u8>,
    key_size: Option<u32>,
    validity_months: Option<u32>,
}

impl AuthorityRequestBuilder {
    /// Set the authority's distinguished name, e.g. `CN=Root`.
    pub fn subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the path length constraint.
    pub fn path_length(mut self, path_length: u8) -> Self {
        self.path_length = Some(path_length);
        self
    }

    /// Override the default key size of [`DEFAULT_AUTHORITY_KEY_SIZE`] bits.
    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = Some(bits);
        self
    }

    /// Set the validity period, in months.
    pub fn validity_months(mut self, months: u32) -> Self {
        self.validity_months = Some(months);
        self
    }

    /// Validate and build the request.
    pub fn build(self) -> Result<AuthorityRequest> {
        let subject = self.subject.ok_or(CaError::MissingField("subject"))?;
        parse_name(&subject)?;

        let validity_months = self
            .validity_months
            .ok_or(CaError::MissingField("validity_months"))?;
        if validity_months == 0 {
            return Err(CaError::InvalidValidityPeriod(0));
        }

        Ok(AuthorityRequest {
            subject,
            path_length: self.path_length.unwrap_or_default(),
            key_size: self.key_size.unwrap_or(DEFAULT_AUTHORITY_KEY_SIZE),
            validity_months,
        })
    }
}

/// The role granted by the issuer to a newly signed certificate.
///
/// This is decided by the caller on the issuer's side, and never read from
/// the certificate signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificateRole {
    /// An end-entity certificate, which may not issue certificates.
    #[default]
    Leaf,

    /// A certificate authority, such as a subordinate intermediate.
    Authority {
        /// Maximum number of further subordinate authorities, if constrained.
        path_length: Option<u8>,
    },
}

impl CertificateRole {
    /// Whether this role carries the CA basic constraint.
    pub fn is_authority(&self) -> bool {
        matches!(self, CertificateRole::Authority { .. })
    }
}

/// Intent to sign a certificate signing request.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    csr: Vec<u8>,
    issuer: IssuerIdentity,
    validity_days: i64,
    role: CertificateRole,
}

impl SigningRequest {
    /// Start building a signing request from the raw CSR, as DER or PEM.
    pub fn builder<B: Into<Vec<u8>>>(csr: B) -> SigningRequestBuilder {
        SigningRequestBuilder {
            csr: csr.into(),
            issuer: None,
            validity_days: None,
            role: CertificateRole::Leaf,
        }
    }

    /// The CSR bytes, exactly as supplied.
    pub fn csr(&self) -> &[u8] {
        &self.csr
    }

    /// The authority to sign under.
    pub fn issuer(&self) -> &IssuerIdentity {
        &self.issuer
    }

    /// Requested validity period, in days.
    pub fn validity_days(&self) -> i64 {
        self.validity_days
    }

    /// Role granted to the issued certificate.
    pub fn role(&self) -> CertificateRole {
        self.role
    }
}

/// Builder for a [`SigningRequest`].
#[derive(Debug)]
pub struct SigningRequestBuilder {
    csr: Vec<u8>,
    issuer: Option<IssuerIdentity>,
    validity_days: Option<i64>,
    role: CertificateRole,
}

impl SigningRequestBuilder {
    /// Set the authority to sign under.
    pub fn issuer(mut self, issuer: IssuerIdentity) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Set the validity period, in days.
    pub fn validity_days(mut self, days: i64) -> Self {
        self.validity_days = Some(days);
        self
    }

    /// Issue an end-entity certificate (the default).
    pub fn leaf(mut self) -> Self {
        self.role = CertificateRole::Leaf;
        self
    }

    /// Issue a subordinate certificate authority.
    pub fn intermediate(mut self, path_length: Option<u8>) -> Self {
        self.role = CertificateRole::Authority { path_length };
        self
    }

    /// Set the role explicitly.
    pub fn role(mut self, role: CertificateRole) -> Self {
        self.role = role;
        self
    }

    /// Validate and build the request.
    pub fn build(self) -> Result<SigningRequest> {
        if self.csr.is_empty() {
            return Err(CaError::MissingField("csr"));
        }
        let issuer = self.issuer.ok_or(CaError::MissingField("issuer"))?;
        let validity_days = self
            .validity_days
            .ok_or(CaError::MissingField("validity_days"))?;
        if validity_days <= 0 {
            return Err(CaError::InvalidValidityPeriod(validity_days));
        }

        Ok(SigningRequest {
            csr: self.csr,
            issuer,
            validity_days,
            role: self.role,
        })
    }
}
