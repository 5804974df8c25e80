//! # Settings for the `vaultca` program
//!
//! Settings are read from an `appsettings.json` style document with a
//! `KeyVault` and a `Csr` section, and may then be overridden field by field
//! from the command line or the environment. [`Settings::operation`] turns
//! the merged settings into exactly one validated [`Operation`].
//!
//! ```json
//! {
//!   "KeyVault": {
//!     "KeyVaultUrl": "https://my-vault.vault.azure.net",
//!     "IssuingCA": "root-ca",
//!     "CertValidityInDays": 365,
//!     "CertPathLength": 1
//!   },
//!   "Csr": {
//!     "IsRootCA": true,
//!     "Subject": "CN=Root"
//!   }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CaError, Result};
use crate::request::{
    AuthorityRequest, CertificateRole, IssuerIdentity, DEFAULT_AUTHORITY_KEY_SIZE,
};

/// Default upper bound on the validity of a signed certificate, in days.
pub const DEFAULT_MAX_VALIDITY_DAYS: i64 = 730;

/// Settings for the key vault and the authority it holds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KeyVaultSettings {
    /// Base URL of the key vault.
    pub key_vault_url: Option<String>,

    /// Name of the issuing authority's key and certificate.
    #[serde(rename = "IssuingCA")]
    pub issuing_ca: Option<String>,

    /// Validity of new certificates, in days.
    pub cert_validity_in_days: i64,

    /// Upper bound on [`cert_validity_in_days`][Self::cert_validity_in_days]
    /// when signing requests.
    pub max_cert_validity: i64,

    /// Path length of a new root authority.
    pub cert_path_length: u8,

    /// Key size of a new root authority, in bits.
    pub key_size: u32,
}

impl Default for KeyVaultSettings {
    fn default() -> Self {
        KeyVaultSettings {
            key_vault_url: None,
            issuing_ca: None,
            cert_validity_in_days: 0,
            max_cert_validity: DEFAULT_MAX_VALIDITY_DAYS,
            cert_path_length: 0,
            key_size: DEFAULT_AUTHORITY_KEY_SIZE,
        }
    }
}

/// Settings describing what should be issued.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CsrSettings {
    /// Bootstrap a root authority instead of signing a request.
    #[serde(rename = "IsRootCA")]
    pub is_root_ca: bool,

    /// Sign the request as a subordinate authority.
    #[serde(rename = "IsIntermediateCA")]
    pub is_intermediate_ca: bool,

    /// Path length of a signed subordinate authority.
    pub intermediate_path_length: Option<u8>,

    /// Subject of a new root authority.
    pub subject: Option<String>,

    /// Location of the certificate signing request to sign.
    pub path_to_csr: Option<PathBuf>,

    /// Where the signed certificate is written.
    pub output_file_name: Option<PathBuf>,
}

/// All settings for one run of the program.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    /// The `KeyVault` section.
    pub key_vault: KeyVaultSettings,

    /// The `Csr` section.
    pub csr: CsrSettings,
}

/// A single validated unit of work.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Make sure the named root authority exists.
    Bootstrap {
        identity: IssuerIdentity,
        request: AuthorityRequest,
    },

    /// Sign the request at `csr` and write the certificate to `output`.
    Sign {
        csr: PathBuf,
        output: PathBuf,
        issuer: IssuerIdentity,
        validity_days: i64,
        role: CertificateRole,
    },
}

impl Settings {
    /// Parse settings from a JSON document.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Read settings from a JSON file.
    ///
    /// A missing file is not an error, and yields the default settings.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(data) => Self::from_json(&data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                Ok(Settings::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Validate these settings and decide what to do.
    pub fn operation(&self) -> Result<Operation> {
        let issuer = IssuerIdentity::new(self.key_vault.issuing_ca.clone().unwrap_or_default())?;
        let days = self.key_vault.cert_validity_in_days;

        if self.csr.is_root_ca {
            let subject = self
                .csr
                .subject
                .as_deref()
                .filter(|subject| !subject.trim().is_empty())
                .ok_or(CaError::MissingField("subject"))?;

            if days <= 0 {
                return Err(CaError::InvalidValidityPeriod(days));
            }
            let months = u32::try_from(days / 30).unwrap_or(u32::MAX).max(1);

            let request = AuthorityRequest::builder()
                .subject(subject)
                .path_length(self.key_vault.cert_path_length)
                .key_size(self.key_vault.key_size)
                .validity_months(months)
                .build()?;

            return Ok(Operation::Bootstrap {
                identity: issuer,
                request,
            });
        }

        let (csr, output) = match (&self.csr.path_to_csr, &self.csr.output_file_name) {
            (Some(csr), Some(output))
                if !csr.as_os_str().is_empty() && !output.as_os_str().is_empty() =>
            {
                (csr.clone(), output.clone())
            }
            _ => return Err(CaError::MissingField("csr path or output file name")),
        };

        let max = self.key_vault.max_cert_validity;
        if days <= 0 || days > max {
            return Err(CaError::ValidityOutOfRange { days, max });
        }

        let role = if self.csr.is_intermediate_ca {
            CertificateRole::Authority {
                path_length: self.csr.intermediate_path_length,
            }
        } else {
            CertificateRole::Leaf
        };

        Ok(Operation::Sign {
            csr,
            output,
            issuer,
            validity_days: days,
            role,
        })
    }
}
