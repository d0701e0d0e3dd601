use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nfse_core::access_key::AccessKey;
use nfse_core::api::{Accepted, NfseClient};
use nfse_core::codec;
use nfse_core::config::Config;
use nfse_core::credentials::CertificateBundle;
use nfse_core::danfse::{HeaderConfig, render_danfse_from_base64, render_danfse_from_xml};
use nfse_core::dps::Dps;
use nfse_core::dps::validation::validate_xml_file;
use nfse_core::event::{CancelReason, CancelRequest};
use nfse_core::sign::{SignatureEngine, TrustStore, verify_document};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nfse")]
#[command(about = "Client for Brazil's NFSe Nacional platform")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a DPS JSON file into its unsigned XML.
    Build {
        #[arg(long)]
        dps: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Render and sign a DPS.
    Sign {
        #[arg(long)]
        dps: PathBuf,
        #[command(flatten)]
        credentials: CredentialArgs,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check the enveloped signature of an XML document.
    Verify {
        #[arg(long)]
        xml: PathBuf,
        /// PEM file of issuers whose certificates are accepted.
        #[arg(long)]
        trust_anchors: Option<PathBuf>,
    },
    /// Validate an XML document against the DPS schema.
    Validate {
        #[arg(long)]
        xml: PathBuf,
        #[arg(long, env = "NFSE_XSD_PATH")]
        xsd: Option<PathBuf>,
    },
    /// gzip + base64 a file for transport.
    Encode {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Reverse of `encode`.
    Decode {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Submit a DPS and print the issued NFSe.
    Issue {
        #[arg(long)]
        dps: PathBuf,
        #[command(flatten)]
        credentials: CredentialArgs,
        /// Where to write the returned NFSe XML.
        #[arg(long)]
        nfse_output: Option<PathBuf>,
    },
    /// Fetch an issued NFSe by access key.
    Query {
        #[arg(long)]
        access_key: String,
        #[command(flatten)]
        credentials: CredentialArgs,
        #[arg(long)]
        nfse_output: Option<PathBuf>,
    },
    /// Register a cancellation event.
    Cancel {
        #[arg(long)]
        access_key: String,
        /// CNPJ or CPF of the requester.
        #[arg(long)]
        author: String,
        #[arg(long)]
        reason: String,
        #[arg(long, value_enum, default_value_t = ReasonCode::Other)]
        code: ReasonCode,
        #[command(flatten)]
        credentials: CredentialArgs,
    },
    /// Render a DANFSe PDF locally from an NFSe XML, or its gzip+base64 form.
    RenderDanfse {
        #[arg(long)]
        nfse: PathBuf,
        #[command(flatten)]
        header: HeaderArgs,
        #[arg(long)]
        output: PathBuf,
    },
    /// Download the DANFSe PDF.
    Danfse {
        #[arg(long)]
        access_key: String,
        #[command(flatten)]
        credentials: CredentialArgs,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct CredentialArgs {
    /// PKCS#12 bundle holding the certificate and private key.
    #[arg(long, env = "NFSE_PKCS12", conflicts_with_all = ["certificate_pem", "key_pem"])]
    pkcs12: Option<PathBuf>,
    #[arg(long, env = "NFSE_PKCS12_PASSPHRASE", hide_env_values = true, default_value = "")]
    passphrase: String,
    /// PEM certificate, used with --key-pem instead of --pkcs12.
    #[arg(long, requires = "key_pem")]
    certificate_pem: Option<PathBuf>,
    /// Unencrypted PKCS#8 PEM key.
    #[arg(long, requires = "certificate_pem")]
    key_pem: Option<PathBuf>,
    /// PEM file of issuers trusted to sign authority documents. Without it
    /// any signer is accepted.
    #[arg(long, env = "NFSE_TRUST_ANCHORS")]
    trust_anchors: Option<PathBuf>,
}

impl CredentialArgs {
    fn load(&self) -> Result<CertificateBundle> {
        let bundle = match (&self.pkcs12, &self.certificate_pem, &self.key_pem) {
            (Some(pkcs12), _, _) => CertificateBundle::from_pkcs12_file(pkcs12, &self.passphrase)?,
            (None, Some(certificate), Some(key)) => {
                CertificateBundle::from_pem_files(certificate, key)?
            }
            _ => bail!("credentials required: pass --pkcs12 or --certificate-pem with --key-pem"),
        };
        Ok(bundle)
    }

    fn client(&self, config: Config) -> Result<NfseClient> {
        let bundle = self.load()?;
        let client = NfseClient::new(
            config,
            bundle.signing_credential()?,
            &bundle.tls_identity()?,
            trust_store(self.trust_anchors.as_deref())?,
        )?;
        Ok(client)
    }
}

#[derive(Args)]
struct HeaderArgs {
    /// Letterhead title; replaces the default heading.
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    subtitle: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    email: Option<String>,
    /// Logo image (PNG, JPEG, ...).
    #[arg(long)]
    logo: Option<PathBuf>,
}

impl HeaderArgs {
    fn config(self) -> HeaderConfig {
        let mut header = HeaderConfig::default();
        if let Some(logo) = self.logo {
            header = header.with_image(logo);
        }
        if let Some(title) = self.title {
            header = header.with_title(title);
        }
        if let Some(subtitle) = self.subtitle {
            header = header.with_subtitle(subtitle);
        }
        if let Some(phone) = self.phone {
            header = header.with_phone(phone);
        }
        if let Some(email) = self.email {
            header = header.with_email(email);
        }
        header
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ReasonCode {
    IssuingError,
    ServiceNotRendered,
    Other,
}

impl From<ReasonCode> for CancelReason {
    fn from(code: ReasonCode) -> Self {
        match code {
            ReasonCode::IssuingError => CancelReason::IssuingError,
            ReasonCode::ServiceNotRendered => CancelReason::ServiceNotRendered,
            ReasonCode::Other => CancelReason::Other,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build { dps, output } => {
            let document = read_dps(&dps)?.to_canonical_document()?;
            emit(output.as_deref(), document.xml().as_bytes())?;
        }
        Commands::Sign {
            dps,
            credentials,
            output,
        } => {
            let document = read_dps(&dps)?.to_canonical_document()?;
            let credential = credentials.load()?.signing_credential()?;
            let signed = SignatureEngine::new(&credential).sign(&document)?;
            emit(output.as_deref(), signed.xml().as_bytes())?;
        }
        Commands::Verify { xml, trust_anchors } => {
            let contents = read_text(&xml)?;
            let trust = trust_store(trust_anchors.as_deref())?;
            let verified = verify_document(&contents, &trust)?;
            println!("signature OK: {} signed by {}", verified.reference(), verified.signer());
        }
        Commands::Validate { xml, xsd } => {
            let mut config = Config::from_env()?;
            if let Some(xsd) = xsd {
                config = config.with_xsd_path(xsd);
            }
            validate_xml_file(&xml, &config)?;
            println!("{}: valid", xml.display());
        }
        Commands::Encode { input, output } => {
            let encoded = codec::encode_bytes(&read_bytes(&input)?)?;
            emit(output.as_deref(), encoded.as_bytes())?;
        }
        Commands::Decode { input, output } => {
            let decoded = codec::decode_bytes(read_text(&input)?.trim())?;
            emit(output.as_deref(), &decoded)?;
        }
        Commands::Issue {
            dps,
            credentials,
            nfse_output,
        } => {
            let dps = read_dps(&dps)?;
            let client = credentials.client(Config::from_env()?)?;
            let accepted = client.issue(&dps).await?.into_result()?;
            report(accepted, nfse_output.as_deref())?;
        }
        Commands::Query {
            access_key,
            credentials,
            nfse_output,
        } => {
            let key = AccessKey::new(access_key)?;
            let client = credentials.client(Config::from_env()?)?;
            let accepted = client.query(&key).await?.into_result()?;
            report(accepted, nfse_output.as_deref())?;
        }
        Commands::Cancel {
            access_key,
            author,
            reason,
            code,
            credentials,
        } => {
            let request = CancelRequest::new(AccessKey::new(access_key)?, &author, reason)?
                .with_reason_code(code.into());
            let client = credentials.client(Config::from_env()?)?;
            let accepted = client.cancel(&request).await?.into_result()?;
            report(accepted, None)?;
        }
        Commands::RenderDanfse {
            nfse,
            header,
            output,
        } => {
            let contents = read_text(&nfse)?;
            let header = header.config();
            let pdf = if contents.trim_start().starts_with('<') {
                render_danfse_from_xml(&contents, &header)?
            } else {
                render_danfse_from_base64(&contents, &header)?
            };
            emit(Some(output.as_path()), &pdf)?;
        }
        Commands::Danfse {
            access_key,
            credentials,
            output,
        } => {
            let key = AccessKey::new(access_key)?;
            let client = credentials.client(Config::from_env()?)?;
            let pdf = client.download_danfse(&key).await?;
            emit(Some(output.as_path()), &pdf)?;
        }
    }

    Ok(())
}

fn trust_store(anchors: Option<&Path>) -> Result<TrustStore> {
    let trust = match anchors {
        Some(path) => TrustStore::from_pem_anchors(&read_bytes(path)?)?,
        None => TrustStore::any(),
    };
    Ok(trust)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_dps(path: &Path) -> Result<Dps> {
    serde_json::from_str(&read_text(path)?)
        .with_context(|| format!("{} is not a valid DPS", path.display()))
}

fn emit(output: Option<&Path>, contents: &[u8]) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(contents)?;
            if !contents.ends_with(b"\n") {
                stdout.write_all(b"\n")?;
            }
            Ok(())
        }
    }
}

fn report(accepted: Accepted, nfse_output: Option<&Path>) -> Result<()> {
    let summary = match accepted {
        Accepted::Issued(nfse) => {
            if let Some(path) = nfse_output {
                emit(Some(path), nfse.xml().as_bytes())?;
            }
            serde_json::json!({
                "chaveAcesso": nfse.access_key(),
                "nNFSe": nfse.number(),
                "situacao": nfse.status(),
                "signer": nfse.signer(),
            })
        }
        Accepted::EventRegistered(receipt) => serde_json::json!({
            "chaveAcesso": receipt.access_key(),
            "protocolo": receipt.protocol(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
