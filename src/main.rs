use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vaultca::config::{Operation, Settings};
use vaultca::vault::VaultClient;
use vaultca::{Bootstrap, CertificateAuthority, SigningRequest};

#[derive(Debug, Parser)]
#[command(version, about = "Issue certificates from an authority held in Azure Key Vault")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file in appsettings.json form.
    #[arg(long, env = "VAULTCA_CONFIG", default_value = "appsettings.json")]
    config: PathBuf,

    /// Base URL of the key vault.
    #[arg(long, env = "VAULTCA_VAULT_URL")]
    vault_url: Option<String>,

    /// Name of the issuing authority in the key vault.
    #[arg(long, env = "VAULTCA_ISSUER")]
    issuer: Option<String>,

    /// Bearer token for the key vault.
    #[arg(long, env = "VAULTCA_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Validity of the certificate, in days.
    #[arg(long, env = "VAULTCA_VALIDITY_DAYS")]
    days: Option<i64>,

    /// Longest validity which may be requested, in days.
    #[arg(long, env = "VAULTCA_MAX_VALIDITY_DAYS")]
    max_validity: Option<i64>,

    /// Size of a new root authority key, in bits.
    #[arg(long, env = "VAULTCA_KEY_SIZE")]
    key_size: Option<u32>,

    /// Request timeout, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the root authority, unless it already exists.
    Bootstrap(BootstrapArgs),

    /// Sign a certificate signing request.
    Sign(SignArgs),
}

#[derive(Debug, Args)]
struct BootstrapArgs {
    /// Subject of the root authority, e.g. `CN=Root`.
    #[arg(long, env = "VAULTCA_SUBJECT")]
    subject: Option<String>,

    /// Maximum number of intermediate authorities below the root.
    #[arg(long, env = "VAULTCA_PATH_LENGTH")]
    path_length: Option<u8>,
}

#[derive(Debug, Args)]
struct SignArgs {
    /// Certificate signing request, as DER or PEM.
    #[arg(long, env = "VAULTCA_CSR")]
    csr: Option<PathBuf>,

    /// Where to write the issued certificate.
    #[arg(long, env = "VAULTCA_OUTPUT")]
    out: Option<PathBuf>,

    /// Issue an intermediate authority certificate.
    #[arg(long, env = "VAULTCA_INTERMEDIATE")]
    intermediate: bool,

    /// Path length of the intermediate authority.
    #[arg(long, env = "VAULTCA_INTERMEDIATE_PATH_LENGTH", requires = "intermediate")]
    path_length: Option<u8>,

    /// Write the certificate as PEM instead of DER.
    #[arg(long)]
    pem: bool,
}

impl Cli {
    fn settings(&self) -> vaultca::Result<Settings> {
        let settings = Settings::from_json_file(&self.config)?;
        Ok(self.apply(settings))
    }

    /// Override file settings with flags and environment variables.
    fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(url) = &self.vault_url {
            settings.key_vault.key_vault_url = Some(url.clone());
        }
        if let Some(issuer) = &self.issuer {
            settings.key_vault.issuing_ca = Some(issuer.clone());
        }
        if let Some(days) = self.days {
            settings.key_vault.cert_validity_in_days = days;
        }
        if let Some(max) = self.max_validity {
            settings.key_vault.max_cert_validity = max;
        }
        if let Some(bits) = self.key_size {
            settings.key_vault.key_size = bits;
        }

        match &self.command {
            Command::Bootstrap(args) => {
                settings.csr.is_root_ca = true;
                if let Some(subject) = &args.subject {
                    settings.csr.subject = Some(subject.clone());
                }
                if let Some(path_length) = args.path_length {
                    settings.key_vault.cert_path_length = path_length;
                }
            }
            Command::Sign(args) => {
                settings.csr.is_root_ca = false;
                if let Some(csr) = &args.csr {
                    settings.csr.path_to_csr = Some(csr.clone());
                }
                if let Some(out) = &args.out {
                    settings.csr.output_file_name = Some(out.clone());
                }
                if args.intermediate {
                    settings.csr.is_intermediate_ca = true;
                }
                if args.path_length.is_some() {
                    settings.csr.intermediate_path_length = args.path_length;
                }
            }
        }

        settings
    }

    fn pem(&self) -> bool {
        matches!(&self.command, Command::Sign(args) if args.pem)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vaultca=info")),
        )
        .init();

    tracing::info!("KeyVaultCA app started.");
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = cli.settings()?;
    let operation = settings.operation()?;

    let vault_url = settings
        .key_vault
        .key_vault_url
        .as_deref()
        .ok_or(vaultca::CaError::MissingField("key vault url"))?;

    let mut builder = VaultClient::builder(vault_url.parse()?)
        .timeout(Duration::from_secs(cli.timeout))
        .connect_timeout(Duration::from_secs(10));
    if let Some(token) = &cli.access_token {
        builder = builder.access_token(token.clone());
    }
    let authority = CertificateAuthority::new(builder.build()?);

    match operation {
        Operation::Bootstrap { identity, request } => {
            let outcome = authority.ensure_authority(&identity, request).await?;
            if outcome == Bootstrap::AlreadyExists {
                tracing::debug!("Left existing authority {identity} untouched");
            }
            tracing::info!(
                "CA certificate was either created successfully or it already existed in the Key Vault {vault_url}."
            );
        }
        Operation::Sign {
            csr,
            output,
            issuer,
            validity_days,
            role,
        } => {
            let data = tokio::fs::read(&csr).await?;
            let request = SigningRequest::builder(data)
                .issuer(issuer)
                .validity_days(validity_days)
                .role(role)
                .build()?;

            let certificate = authority.sign(request).await?;
            if cli.pem() {
                tokio::fs::write(&output, certificate.to_pem()?).await?;
            } else {
                tokio::fs::write(&output, certificate.as_der()).await?;
            }
            tracing::info!(output = %output.display(), "Device certificate was created successfully.");
        }
    }

    Ok(())
}
