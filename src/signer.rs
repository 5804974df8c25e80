//! # Signing certificate requests
//!
//! Every claim in a CSR is untrusted until its self-signature has been
//! verified, and the only claims ever carried into the issued certificate are
//! the subject and the public key. Whether the new certificate may act as an
//! authority is decided by the [`CertificateRole`] of the [`SigningRequest`].

use chrono::Utc;

use crate::authority::CertificateAuthority;
use crate::codec::{self, CertificateTemplate, IssuedCertificate};
use crate::error::{CaError, Result};
use crate::remote::{self, IssuerCertificate, RemoteKeyStore};
use crate::request::{CertificateRole, SigningRequest, ValidityWindow};

impl<S> CertificateAuthority<S>
where
    S: RemoteKeyStore,
{
    /// Sign a certificate signing request with the requested issuer's key.
    ///
    /// The CSR is parsed and its signature verified, and the validity period
    /// checked, before the key store is contacted at all. After that, at most
    /// two calls are made: one to fetch the issuer certificate, and one to sign
    /// the new certificate's digest.
    #[tracing::instrument(
        skip_all,
        fields(issuer = %request.issuer(), days = request.validity_days())
    )]
    pub async fn sign(&self, request: SigningRequest) -> Result<IssuedCertificate> {
        tracing::info!(
            authority = request.role().is_authority(),
            "Preparing certificate request"
        );

        let csr = codec::parse_request(request.csr()).inspect_err(|err| {
            tracing::error!("Rejecting certificate signing request: {err}");
        })?;
        codec::verify_request(&csr).inspect_err(|err| {
            tracing::error!("Rejecting certificate signing request: {err}");
        })?;
        tracing::debug!(subject = %csr.info.subject, "CSR signature verified");

        let validity = ValidityWindow::days_from(Utc::now(), request.validity_days())?;

        if codec::requests_authority(&csr) && !request.role().is_authority() {
            tracing::warn!(
                subject = %csr.info.subject,
                "CSR asks for certificate authority rights, which were not granted"
            );
        }

        let issuer = self.issuer_certificate(request.issuer()).await?;
        check_depth(&issuer, request.role())?;

        let issuer_key_identifier = match codec::subject_key_identifier(issuer.certificate())? {
            Some(identifier) => identifier,
            None => codec::key_identifier(
                &issuer
                    .certificate()
                    .tbs_certificate
                    .subject_public_key_info,
            ),
        };

        let template = CertificateTemplate {
            subject: csr.info.subject,
            issuer: issuer.subject().clone(),
            validity,
            public_key: csr.info.public_key,
            role: request.role(),
            issuer_key_identifier: Some(issuer_key_identifier),
            signature_algorithm: issuer.key().algorithm(),
        };

        let sign = remote::bind_key(self.store(), issuer.key().clone());
        let certificate = codec::build_and_encode(&template, sign).await?;

        tracing::info!(
            subject = %certificate.subject(),
            not_after = %certificate.not_after(),
            "Certificate was issued"
        );
        Ok(certificate)
    }
}

/// Single-issuer depth check: the issuer must be an authority, and an
/// intermediate must fit below the issuer's path length constraint.
fn check_depth(issuer: &IssuerCertificate, role: CertificateRole) -> Result<()> {
    let constraints = codec::basic_constraints(issuer.certificate())?;
    let Some(constraints) = constraints.filter(|bc| bc.ca) else {
        return Err(CaError::IssuerNotAuthority(issuer.subject().to_string()));
    };

    if let CertificateRole::Authority { path_length } = role {
        if let Some(limit) = constraints.path_len_constraint {
            let fits = path_length.is_some_and(|requested| requested < limit);
            if !fits {
                return Err(CaError::PathLengthExceeded {
                    issuer: limit,
                    requested: path_length,
                });
            }
        }
    }

    Ok(())
}
