//! IoT domain CLI
//!
//! Thin wrapper around iotdomain-core for managing publisher identities and
//! inspecting bus messages.
//!
//! ## Usage
//!
//! ```bash
//! # Create the domain security service identity
//! iotdomain --domain home dss init
//!
//! # Create a self-signed publisher identity
//! iotdomain --domain home identity create pub1
//!
//! # Replace it with a DSS-issued one
//! iotdomain --domain home dss issue pub1
//!
//! # Sign (and optionally encrypt) a message
//! iotdomain --domain home sign pub2 home/pub1/node1/switch/0/\$set '{"value":"on"}' --encrypt-for pub1
//!
//! # Decode a message as pub1
//! iotdomain --domain home decode pub1 <wire>
//!
//! # Run DSS and two publishers on an in-process bus
//! iotdomain demo
//!
//! # Merge the JSONL logs of every publisher
//! iotdomain logs ./logs --level warn
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iotdomain_core::identity::store;
use iotdomain_core::keys::fingerprint;
use iotdomain_core::logging::{read_entries, LoggingBuilder};
use iotdomain_core::{
    decode_message, encode_message, issue_identity, publisher_address, verify_identity,
    FullIdentity, IdentityRequest, InputDiscovery, Issuer, MemoryBus, Publisher,
    PublisherConfig, PublisherIdentity, PublicKey, DSS_PUBLISHER_ID,
};

const IDENTITY_FILE_SUFFIX: &str = ".identity.json";

/// IoT domain - publisher identities and signed messages
#[derive(Parser)]
#[command(name = "iotdomain")]
#[command(version = "0.1.0")]
#[command(about = "IoT domain - publisher identities and signed messages")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.iotdomain/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Domain the publishers belong to
    #[arg(long, global = true, default_value = "local")]
    domain: String,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publisher identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Domain security service
    Dss {
        #[command(subcommand)]
        action: DssAction,
    },

    /// Sign a JSON payload as a publisher
    Sign {
        /// Signing publisher ID
        publisher: String,
        /// Address the message is meant for
        address: String,
        /// JSON payload
        payload: String,
        /// Encrypt for this publisher's key
        #[arg(long)]
        encrypt_for: Option<String>,
    },

    /// Decrypt and verify a message as a publisher
    Decode {
        /// Receiving publisher ID (its key decrypts)
        publisher: String,
        /// Wire message
        wire: String,
    },

    /// Print JSONL log entries of every publisher, oldest first
    Logs {
        /// Directory holding the `.jsonl` files
        dir: PathBuf,
        /// Only entries written by this publisher (`domain/publisherId`)
        #[arg(long)]
        publisher: Option<String>,
        /// Only entries at this level (trace, debug, info, warn, error)
        #[arg(long)]
        level: Option<String>,
    },

    /// Run a DSS and two publishers on an in-process bus
    Demo {
        /// Loop tick in milliseconds
        #[arg(long, default_value_t = 20)]
        tick_ms: u64,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Create a self-signed identity
    Create {
        publisher: String,
        #[arg(long, default_value = "")]
        organization: String,
        #[arg(long, default_value = "")]
        location: String,
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
    /// Show a stored identity
    Show { publisher: String },
    /// Verify an identity document against this domain's trust roots
    Verify { file: PathBuf },
}

#[derive(Subcommand)]
enum DssAction {
    /// Create the DSS identity
    Init {
        #[arg(long, default_value = "")]
        organization: String,
    },
    /// Issue a new DSS-signed identity for a publisher
    Issue {
        publisher: String,
        #[arg(long, default_value = "")]
        organization: String,
        #[arg(long, default_value = "")]
        location: String,
    },
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let mut builder = LoggingBuilder::new(filter);
    if let Some(dir) = log_dir {
        builder = builder.with_jsonl(dir, "cli");
    }
    builder.init().context("Failed to set up logging")
}

/// Get the default data directory (~/.iotdomain/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".iotdomain")
        .join("data")
}

/// Identity files of one domain
struct Keystore {
    dir: PathBuf,
    domain: String,
}

impl Keystore {
    fn new(data_dir: &Path, domain: &str) -> Self {
        Self {
            dir: data_dir.join(domain),
            domain: domain.to_string(),
        }
    }

    fn path(&self, publisher_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", publisher_id, IDENTITY_FILE_SUFFIX))
    }

    fn exists(&self, publisher_id: &str) -> bool {
        self.path(publisher_id).exists()
    }

    fn dss_key(&self) -> Result<Option<PublicKey>> {
        if !self.exists(DSS_PUBLISHER_ID) {
            return Ok(None);
        }
        let dss = self.load_with(DSS_PUBLISHER_ID, None)?;
        Ok(Some(dss.identity.key()?))
    }

    fn load(&self, publisher_id: &str) -> Result<FullIdentity> {
        let dss_key = self.dss_key()?;
        self.load_with(publisher_id, dss_key.as_ref())
    }

    fn load_with(&self, publisher_id: &str, dss_key: Option<&PublicKey>) -> Result<FullIdentity> {
        let path = self.path(publisher_id);
        if !path.exists() {
            anyhow::bail!("No identity for {}/{}", self.domain, publisher_id);
        }
        store::load(&path, &self.domain, publisher_id, dss_key)
            .with_context(|| format!("Identity {} rejected", path.display()))
    }

    fn save(&self, full: &FullIdentity) -> Result<()> {
        store::save(self.path(&full.identity.publisher_id), full)?;
        Ok(())
    }

    /// Keys of every stored identity that verifies, by publisher address
    fn trusted_keys(&self) -> Result<HashMap<String, PublicKey>> {
        let dss_key = self.dss_key()?;
        let mut keys = HashMap::new();
        if !self.dir.exists() {
            return Ok(keys);
        }
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some(publisher_id) = name.strip_suffix(IDENTITY_FILE_SUFFIX) else {
                continue;
            };
            match self.load_with(publisher_id, dss_key.as_ref()) {
                Ok(full) => {
                    keys.insert(full.identity.publisher_address(), full.identity.key()?);
                }
                Err(e) => tracing::warn!(publisher = publisher_id, error = %e, "Skipping identity"),
            }
        }
        Ok(keys)
    }
}

fn print_identity(identity: &PublisherIdentity) -> Result<()> {
    println!("Identity:");
    println!("  Address: {}", identity.address);
    println!("  Issuer: {}", identity.issuer_id);
    if !identity.organization.is_empty() {
        println!("  Organization: {}", identity.organization);
    }
    if !identity.location.is_empty() {
        println!("  Location: {}", identity.location);
    }
    println!("  Fingerprint: {}", fingerprint(&identity.key()?));
    println!("  Valid until: {}", identity.valid_until.to_rfc3339());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_dir.as_deref())?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let keystore = Keystore::new(&data_dir, &cli.domain);

    match cli.command {
        Commands::Identity { action } => match action {
            IdentityAction::Create {
                publisher,
                organization,
                location,
                force,
            } => {
                if keystore.exists(&publisher) && !force {
                    anyhow::bail!(
                        "Identity for {}/{} already exists (use --force to replace)",
                        cli.domain,
                        publisher
                    );
                }
                let request = IdentityRequest::new(&cli.domain, &publisher)
                    .with_organization(organization)
                    .with_location(location);
                let full = issue_identity(&request, Issuer::SelfSigned)?;
                keystore.save(&full)?;

                println!("Created self-signed identity");
                print_identity(&full.identity)?;
            }

            IdentityAction::Show { publisher } => {
                let full = keystore.load(&publisher)?;
                print_identity(&full.identity)?;
                println!();
                println!("{}", serde_json::to_string_pretty(&full.identity)?);
            }

            IdentityAction::Verify { file } => {
                let json = fs::read_to_string(&file)
                    .with_context(|| format!("Cannot read {}", file.display()))?;
                let identity: PublisherIdentity = serde_json::from_str(&json)?;
                let dss_key = keystore.dss_key()?;
                verify_identity(
                    &identity,
                    &cli.domain,
                    &identity.publisher_id,
                    dss_key.as_ref(),
                )
                .context("Identity rejected")?;

                println!("Identity valid: {} (issuer {})", identity.address, identity.issuer_id);
            }
        },

        Commands::Dss { action } => match action {
            DssAction::Init { organization } => {
                if keystore.exists(DSS_PUBLISHER_ID) {
                    anyhow::bail!("DSS identity for {} already exists", cli.domain);
                }
                let request = IdentityRequest::new(&cli.domain, DSS_PUBLISHER_ID)
                    .with_organization(organization);
                let full = issue_identity(&request, Issuer::SelfSigned)?;
                keystore.save(&full)?;

                println!("Created DSS identity");
                print_identity(&full.identity)?;
            }

            DssAction::Issue {
                publisher,
                organization,
                location,
            } => {
                if publisher == DSS_PUBLISHER_ID {
                    anyhow::bail!("The DSS identity is always self-signed");
                }
                let dss = keystore.load_with(DSS_PUBLISHER_ID, None)?;
                let (dss_secret, _) = dss.key_pair()?;

                let request = IdentityRequest::new(&cli.domain, &publisher)
                    .with_organization(organization)
                    .with_location(location);
                let full = issue_identity(&request, Issuer::Dss(&dss_secret))?;
                keystore.save(&full)?;

                println!("Issued identity");
                print_identity(&full.identity)?;
            }
        },

        Commands::Sign {
            publisher,
            address,
            payload,
            encrypt_for,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let full = keystore.load(&publisher)?;
            let (secret, _) = full.key_pair()?;

            let recipient = match &encrypt_for {
                Some(recipient_id) => Some(keystore.load(recipient_id)?.identity.key()?),
                None => None,
            };
            tracing::info!(%address, encrypted = recipient.is_some(), "Signing message");

            let wire = encode_message(
                &payload,
                Some(&secret),
                &full.identity.publisher_address(),
                recipient.as_ref(),
            )?;
            println!("{}", wire);
        }

        Commands::Decode { publisher, wire } => {
            let own = keystore.load(&publisher)?;
            let (secret, _) = own.key_pair()?;
            let trusted = keystore.trusted_keys()?;

            let decoded = decode_message(&wire, Some(&secret), |address| {
                publisher_address(address).and_then(|p| trusted.get(&p).copied())
            })
            .context("Message rejected")?;
            let payload: serde_json::Value = decoded.parse()?;

            println!("Signed: {}", if decoded.is_signed { "yes" } else { "no" });
            println!("Encrypted: {}", if decoded.is_encrypted { "yes" } else { "no" });
            if let Some(issuer) = &decoded.issuer {
                println!("Issuer: {}", issuer);
            }
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }

        Commands::Logs {
            dir,
            publisher,
            level,
        } => {
            let entries = read_entries(&dir)
                .with_context(|| format!("Cannot read logs in {}", dir.display()))?;
            for entry in entries
                .iter()
                .filter(|e| publisher.as_deref().map_or(true, |p| e.publisher == p))
                .filter(|e| level.as_deref().map_or(true, |l| e.level.eq_ignore_ascii_case(l)))
            {
                print!("{} {:5} {} {}", entry.ts, entry.level, entry.publisher, entry.msg);
                match &entry.fields {
                    Some(fields) => println!(" {}", fields),
                    None => println!(),
                }
            }
        }

        Commands::Demo { tick_ms } => run_demo(tick_ms).await?,
    }

    Ok(())
}

/// DSS rotation and an encrypted command between two publishers
async fn run_demo(tick_ms: u64) -> Result<()> {
    let bus = MemoryBus::new();
    let settle = Duration::from_millis(tick_ms * 5);
    let config = |publisher_id: &str| PublisherConfig {
        tick_ms,
        ..PublisherConfig::new("demo", publisher_id)
    };

    let dss = Publisher::new(config(DSS_PUBLISHER_ID), bus.clone())?;
    let switch = Publisher::new(config("switch"), bus.clone())?;
    let remote = Publisher::new(config("remote"), bus.clone())?;

    switch.update_input(InputDiscovery::new("demo", "switch", "relay1", "switch", "0"));
    switch.set_input_handler(|_, input, message| {
        println!("  {} set to {:?} by {}", input.address, message.value, message.sender);
    });

    for publisher in [&dss, &switch, &remote] {
        publisher.start().await?;
    }
    tokio::time::sleep(settle).await;
    println!("Publishers started:");
    for publisher in [&dss, &switch, &remote] {
        println!(
            "  {} ({:?})",
            publisher.publisher_address(),
            publisher.identity().state()
        );
    }

    println!("DSS issues a new identity for demo/switch");
    let dss_secret = dss
        .identity()
        .signing_key()
        .context("DSS has no signing key")?;
    let issued = issue_identity(
        &IdentityRequest::new("demo", "switch"),
        Issuer::Dss(&dss_secret),
    )?;
    let recipient = switch
        .identity()
        .public_identity()
        .context("switch has no identity")?
        .key()?;
    dss.signer().publish_encrypted(
        &switch.identity().identity_address(),
        false,
        &issued,
        &recipient,
    )?;
    tokio::time::sleep(settle).await;
    println!("  demo/switch is now {:?}", switch.identity().state());

    println!("demo/remote sends an encrypted command");
    remote.set_remote_input("demo/switch/relay1/switch/0", "on", true)?;
    tokio::time::sleep(settle).await;

    let known: Vec<String> = remote
        .domain_inputs()
        .get_all()
        .into_iter()
        .map(|input| input.address)
        .collect();
    println!("Inputs discovered by demo/remote: {}", known.join(", "));

    for publisher in [&dss, &switch, &remote] {
        publisher.stop().await;
    }
    Ok(())
}
