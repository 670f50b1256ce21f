//! iotcore-north - command line host for the north client
//!
//! Reads JSON-lines readings and forwards them to the device bridge in
//! batches until the input ends or Ctrl-C is pressed.

use chrono::Utc;
use clap::{Parser, Subcommand};
use iotcore_north::auth::{CredentialManager, JwtSigner};
use iotcore_north::config::CertPaths;
use iotcore_north::observability::init_default_logging;
use iotcore_north::{NorthClient, NorthConfig, Reading};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "iotcore-north")]
#[command(about = "Forward readings to a cloud IoT device registry over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTCORE_NORTH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send JSON-lines readings from a file or stdin
    Run {
        /// Input file; stdin when omitted
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Readings per published message
        #[arg(short, long, default_value_t = 100)]
        batch_size: usize,
    },
    /// Check the configuration
    Config {
        /// Print the resolved identity and certificate paths
        #[arg(long)]
        show: bool,
    },
    /// Print a freshly signed device token
    Token,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { input, batch_size } => run(config, input, batch_size).await,
        Commands::Config { show } => check_config(&config, show),
        Commands::Token => print_token(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<NorthConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(NorthConfig::load_from_file(path)?);
    }

    for candidate in ["north.toml", "config/north.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(NorthConfig::load_from_file(path)?);
        }
    }

    Err("no configuration file found; pass --config or create north.toml".into())
}

async fn run(
    config: NorthConfig,
    input: Option<PathBuf>,
    batch_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let (client, problems) = NorthClient::from_config(&config);
    if !problems.is_empty() {
        warn!(count = problems.len(), "Starting with configuration problems");
    }

    let connecting = client.spawn_connect();

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    if !connecting.await? {
        warn!("Initial connect failed, will retry on first send");
    }

    let mut lines = reader.lines();
    let mut batch = Vec::with_capacity(batch_size.max(1));
    let mut total = 0usize;
    let interrupted = signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("Interrupted, flushing pending readings");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Reading>(&line) {
                    Ok(reading) => batch.push(reading),
                    Err(e) => warn!(error = %e, "Skipping malformed reading"),
                }
                if batch.len() >= batch_size.max(1) {
                    total += client.send(&batch).await;
                    batch.clear();
                }
            }
        }
    }

    if !batch.is_empty() {
        total += client.send(&batch).await;
    }

    client.shutdown().await;
    info!(total, "Done");
    Ok(())
}

fn check_config(config: &NorthConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let problems = config.validate();
    for problem in &problems {
        println!("problem: {problem}");
    }

    if show {
        let (identity, _) = config.device.resolve();
        let paths = CertPaths::resolve(config.broker.cert_dir.as_deref(), &identity.key_name);
        println!("client id:     {}", identity.client_id());
        println!("events topic:  {}", identity.events_topic());
        println!("errors topic:  {}", identity.errors_topic());
        println!("algorithm:     {}", identity.algorithm);
        println!("broker:        {}", config.broker.url);
        println!("private key:   {}", paths.private_key.display());
        println!("trust anchors: {}", paths.trust_store.display());
    }

    if problems.is_empty() {
        println!("configuration OK");
        Ok(())
    } else {
        Err(format!("{} configuration problem(s)", problems.len()).into())
    }
}

async fn print_token(config: &NorthConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (identity, _) = config.device.resolve();
    let paths = CertPaths::resolve(config.broker.cert_dir.as_deref(), &identity.key_name);
    let mut credentials = CredentialManager::new(
        identity.project_id,
        identity.algorithm,
        paths.private_key,
        Arc::new(JwtSigner),
    );

    let now = Utc::now();
    let token = credentials.ensure_fresh_at(now).await?;
    if let Some(credential) = credentials.current() {
        info!(expires_at = %credential.expires_at(), "Token issued");
    }
    println!("{token}");
    Ok(())
}
