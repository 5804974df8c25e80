use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use rand_core::OsRng;

use vaultca::codec;
use vaultca::csr::CertificateSigningRequest;
use vaultca::error::RemoteErrorKind;
use vaultca::memory::MemoryKeyStore;
use vaultca::{
    AuthorityRequest, CaError, CertificateAuthority, IssuedCertificate, IssuerIdentity,
    SigningRequest,
};

type Authority = CertificateAuthority<Arc<MemoryKeyStore>>;

async fn root_authority() -> (Authority, IssuerIdentity) {
    let _ = tracing_subscriber::fmt::try_init();

    let authority = CertificateAuthority::new(Arc::new(MemoryKeyStore::new()));
    let identity = IssuerIdentity::new("root-ca").unwrap();
    authority
        .ensure_authority(
            &identity,
            AuthorityRequest::builder()
                .subject("CN=Root")
                .path_length(2)
                .validity_months(120)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    (authority, identity)
}

fn device_csr(subject: &str) -> (p256::ecdsa::SigningKey, Vec<u8>) {
    let key = p256::ecdsa::SigningKey::random(&mut OsRng);
    let csr = CertificateSigningRequest::new(subject)
        .unwrap()
        .sign::<_, p256::ecdsa::DerSignature>(&key)
        .unwrap();
    (key, csr.into())
}

fn rsa_device_csr(subject: &str) -> Vec<u8> {
    let key = rsa::RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    let key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key);
    CertificateSigningRequest::new(subject)
        .unwrap()
        .sign::<_, rsa::pkcs1v15::Signature>(&key)
        .unwrap()
        .into()
}

fn leaf_request(csr: Vec<u8>, issuer: &IssuerIdentity, days: i64) -> SigningRequest {
    SigningRequest::builder(csr)
        .issuer(issuer.clone())
        .validity_days(days)
        .leaf()
        .build()
        .unwrap()
}

#[tokio::test]
async fn device_certificate() {
    let (authority, issuer) = root_authority().await;
    let (_, csr) = device_csr("CN=device-42");
    let parsed = codec::parse_request(&csr).unwrap();

    let before = Utc::now();
    let certificate = authority
        .sign(leaf_request(csr, &issuer, 30))
        .await
        .unwrap();

    assert_eq!(certificate.subject().to_string(), "CN=device-42");
    assert_eq!(certificate.issuer().to_string(), "CN=Root");
    assert_eq!(certificate.public_key(), &parsed.info.public_key);
    assert!(!certificate.is_authority().unwrap());

    let usage = certificate.key_usage().unwrap().unwrap();
    assert!(usage.digital_signature());
    assert!(!usage.key_encipherment());

    assert!(certificate.not_before() <= before);
    assert!(Utc::now() <= certificate.not_after());
    assert_eq!(
        certificate.not_after() - certificate.not_before(),
        TimeDelta::days(30)
    );

    let root = authority.issuer_certificate(&issuer).await.unwrap();
    codec::verify_issued(certificate.certificate(), root.certificate()).unwrap();
    assert_eq!(authority.store().sign_calls(), 1);
}

#[tokio::test]
async fn issued_certificate_decodes() {
    let (authority, issuer) = root_authority().await;
    let (_, csr) = device_csr("CN=device-7");

    let certificate = authority
        .sign(leaf_request(csr, &issuer, 90))
        .await
        .unwrap();

    let decoded = IssuedCertificate::from_der(certificate.as_der()).unwrap();
    assert_eq!(decoded.subject(), certificate.subject());
    assert_eq!(decoded.issuer(), certificate.issuer());
    assert_eq!(decoded.not_before(), certificate.not_before());
    assert_eq!(decoded.not_after(), certificate.not_after());
    assert_eq!(decoded.public_key(), certificate.public_key());

    let pem = certificate.to_pem().unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
}

#[tokio::test]
async fn pem_request_is_accepted() {
    let (authority, issuer) = root_authority().await;
    let key = p256::ecdsa::SigningKey::random(&mut OsRng);
    let pem = CertificateSigningRequest::new("CN=device-pem")
        .unwrap()
        .sign::<_, p256::ecdsa::DerSignature>(&key)
        .unwrap()
        .to_pem()
        .unwrap();

    let certificate = authority
        .sign(leaf_request(pem.into_bytes(), &issuer, 30))
        .await
        .unwrap();
    assert_eq!(certificate.subject().to_string(), "CN=device-pem");
}

#[tokio::test]
async fn csr_cannot_make_itself_an_authority() {
    let (authority, issuer) = root_authority().await;
    let key = p256::ecdsa::SigningKey::random(&mut OsRng);
    let csr = CertificateSigningRequest::new("CN=sneaky")
        .unwrap()
        .request_authority(Some(5))
        .sign::<_, p256::ecdsa::DerSignature>(&key)
        .unwrap();
    assert!(codec::requests_authority(
        &codec::parse_request(csr.as_ref()).unwrap()
    ));

    let certificate = authority
        .sign(leaf_request(csr.into(), &issuer, 30))
        .await
        .unwrap();
    let constraints = certificate.basic_constraints().unwrap().unwrap();
    assert!(!constraints.ca);
    assert_eq!(constraints.path_len_constraint, None);
}

#[tokio::test]
async fn intermediate_certificate() {
    let (authority, issuer) = root_authority().await;
    let (_, csr) = device_csr("CN=Intermediate");

    let certificate = authority
        .sign(
            SigningRequest::builder(csr)
                .issuer(issuer)
                .validity_days(365)
                .intermediate(Some(1))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let constraints = certificate.basic_constraints().unwrap().unwrap();
    assert!(constraints.ca);
    assert_eq!(constraints.path_len_constraint, Some(1));
}

#[tokio::test]
async fn corrupted_signature_is_rejected() {
    let (authority, issuer) = root_authority().await;
    let (_, mut csr) = device_csr("CN=device-42");
    if let Some(last) = csr.last_mut() {
        *last ^= 0x01;
    }

    let err = authority
        .sign(leaf_request(csr, &issuer, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::InvalidSignature(_)), "{err:?}");
    assert!(!err.is_retryable());
    assert_eq!(authority.store().sign_calls(), 0);
    assert_eq!(authority.store().fetch_calls(), 0);
}

#[tokio::test]
async fn rsa_device_certificate() {
    let (authority, issuer) = root_authority().await;
    let csr = rsa_device_csr("CN=rsa-device");
    let parsed = codec::parse_request(&csr).unwrap();

    let certificate = authority
        .sign(leaf_request(csr, &issuer, 30))
        .await
        .unwrap();
    assert_eq!(certificate.subject().to_string(), "CN=rsa-device");
    assert_eq!(certificate.public_key(), &parsed.info.public_key);

    let usage = certificate.key_usage().unwrap().unwrap();
    assert!(usage.digital_signature());
    assert!(usage.key_encipherment());

    let root = authority.issuer_certificate(&issuer).await.unwrap();
    codec::verify_issued(certificate.certificate(), root.certificate()).unwrap();
}

#[tokio::test]
async fn corrupted_rsa_signature_is_rejected() {
    let (authority, issuer) = root_authority().await;
    let mut csr = rsa_device_csr("CN=rsa-device");
    if let Some(last) = csr.last_mut() {
        *last ^= 0x01;
    }

    let err = authority
        .sign(leaf_request(csr, &issuer, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::InvalidSignature(_)), "{err:?}");
    assert_eq!(authority.store().sign_calls(), 0);
    assert_eq!(authority.store().fetch_calls(), 0);
}

#[tokio::test]
async fn garbage_is_malformed() {
    let (authority, issuer) = root_authority().await;

    let err = authority
        .sign(leaf_request(b"not a csr".to_vec(), &issuer, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::MalformedRequest(_)));
    assert_eq!(authority.store().fetch_calls(), 0);
}

#[tokio::test]
async fn unknown_issuer() {
    let (authority, _) = root_authority().await;
    let (_, csr) = device_csr("CN=device-42");
    let nobody = IssuerIdentity::new("nobody").unwrap();

    let err = authority
        .sign(leaf_request(csr, &nobody, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::UnknownIssuer(name) if name == "nobody"));
    assert_eq!(authority.store().sign_calls(), 0);
}

#[test]
fn zero_validity_is_rejected_before_building() {
    let (_, csr) = device_csr("CN=device-42");
    let err = SigningRequest::builder(csr)
        .issuer(IssuerIdentity::new("root-ca").unwrap())
        .validity_days(0)
        .build()
        .unwrap_err();
    assert!(matches!(err, CaError::InvalidValidityPeriod(0)));
}

#[tokio::test]
async fn remote_sign_failure_is_surfaced() {
    let (authority, issuer) = root_authority().await;
    let (_, csr) = device_csr("CN=device-42");

    authority.store().fail_next(RemoteErrorKind::Unavailable);
    let err = authority
        .sign(leaf_request(csr, &issuer, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::RemoteUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn concurrent_signing() {
    let (authority, issuer) = root_authority().await;
    let authority = Arc::new(authority);

    let tasks = (0..8)
        .map(|n| {
            let authority = authority.clone();
            let issuer = issuer.clone();
            tokio::spawn(async move {
                let (_, csr) = device_csr(&format!("CN=device-{n}"));
                authority.sign(leaf_request(csr, &issuer, 30)).await
            })
        })
        .collect::<Vec<_>>();

    let mut serials = Vec::new();
    for task in tasks {
        let certificate = task.await.unwrap().unwrap();
        serials.push(certificate.certificate().tbs_certificate.serial_number.clone());
    }

    assert_eq!(authority.store().sign_calls(), 8);
    serials.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
    serials.dedup();
    assert_eq!(serials.len(), 8);
}
