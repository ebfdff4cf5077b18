//! Nea Smart bridge command line
//!
//! Logs in with email MFA, persists the token set between runs, and drives
//! zones through the broker.

use neasmart_bridge::auth::{AuthSession, Credentials, TokenSet};
use neasmart_bridge::config::BridgeConfig;
use neasmart_bridge::installation::{Installation, InstallationDirectory};
use neasmart_bridge::observability::init_default_logging;
use neasmart_bridge::protocol::{Command, OperatingMode};
use neasmart_bridge::transport::{BridgeEvent, MqttBridge};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// REHAU Nea Smart session and protocol bridge
#[derive(Parser)]
#[command(name = "neasmart")]
#[command(about = "Control REHAU Nea Smart heating zones")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with password and emailed code, then store the tokens
    Login,
    /// List the zones of the configured installation
    Zones,
    /// Set a zone's target temperature in Celsius
    SetTemperature {
        #[arg(long)]
        zone: u32,
        #[arg(long)]
        celsius: f64,
    },
    /// Set a zone's operating mode (presence, absence, off, auto)
    SetMode {
        #[arg(long)]
        zone: u32,
        #[arg(long)]
        mode: OperatingMode,
    },
    /// Switch a zone thermostat's ring light
    SetRingLight {
        #[arg(long)]
        zone: u32,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Print zone telemetry until interrupted
    Monitor,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Login => login(&config).await,
        Commands::Zones => list_zones(&config).await,
        Commands::SetTemperature { zone, celsius } => {
            send_command(&config, Command::SetTemperature { zone, celsius }).await
        }
        Commands::SetMode { zone, mode } => {
            send_command(&config, Command::SetOperatingMode { zone, mode }).await
        }
        Commands::SetRingLight { zone, enabled } => {
            send_command(&config, Command::SetRingLight { zone, enabled }).await
        }
        Commands::Monitor => monitor(&config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<BridgeConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BridgeConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["neasmart.toml", "config/neasmart.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BridgeConfig::load_from_file(&path)?);
                }
            }
            Err("no configuration file found; pass --config or create neasmart.toml".into())
        }
    }
}

async fn login(config: &BridgeConfig) -> CliResult<()> {
    let session = AuthSession::new(&config.auth)?;
    let mut credentials = Credentials::new(&config.account.email, config.account_password()?);
    if let Some(id) = &config.account.installation_id {
        credentials = credentials.with_installation(id);
    }

    let challenge = session.begin_login(&credentials).await?;
    println!(
        "Enter the {}-digit code sent to {} (valid until {}):",
        challenge.code_length,
        challenge.destination,
        challenge.deadline.format("%H:%M:%S UTC")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let code = lines
        .next_line()
        .await?
        .ok_or("no code entered")?
        .trim()
        .to_string();

    let tokens = session.submit_mfa_code(&challenge.challenge_id, &code).await?;
    save_tokens(&config.storage.token_file, &tokens)?;
    println!("Logged in; session valid until {}", tokens.expires_at);
    Ok(())
}

/// Session resumed from the token file
async fn resume_session(config: &BridgeConfig) -> CliResult<Arc<AuthSession>> {
    let session = AuthSession::new(&config.auth)?;
    let tokens = load_tokens(&config.storage.token_file)?;
    session.restore(tokens).await;
    Ok(Arc::new(session))
}

/// Write back tokens the session may have refreshed
async fn persist_session(config: &BridgeConfig, session: &AuthSession) {
    if let Some(tokens) = session.token_set().await {
        if let Err(e) = save_tokens(&config.storage.token_file, &tokens) {
            warn!(error = %e, "Could not persist refreshed tokens");
        }
    }
}

async fn fetch_installation(
    config: &BridgeConfig,
    session: &AuthSession,
) -> CliResult<Installation> {
    let token = session.get_valid_token().await?;
    let directory = InstallationDirectory::new(&config.api, &config.account.email)?;
    Ok(directory
        .fetch_installation(&token, config.account.installation_id.as_deref())
        .await?)
}

async fn list_zones(config: &BridgeConfig) -> CliResult<()> {
    let session = resume_session(config).await?;
    let installation = fetch_installation(config, &session).await;
    persist_session(config, &session).await;
    let installation = installation?;

    println!("{} ({})", installation.name, installation.device_id);
    for zone in &installation.zones {
        println!(
            "  zone {:>3}  {:<20} current {:>5}  target {:>5}  range {:.1}-{:.1}  demand {}%",
            zone.number,
            zone.name,
            format_temperature(zone.current_temperature),
            format_temperature(zone.target_temperature),
            zone.min_temperature,
            zone.max_temperature,
            zone.demand
        );
    }
    Ok(())
}

fn format_temperature(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |t| format!("{t:.1}"))
}

async fn open_bridge(
    config: &BridgeConfig,
    session: Arc<AuthSession>,
) -> CliResult<(MqttBridge, Installation)> {
    let installation = fetch_installation(config, &session).await?;
    let bridge = MqttBridge::new(
        &config.account.email,
        &installation.device_id,
        config.mqtt.clone(),
        session,
    )?;
    Ok((bridge, installation))
}

async fn send_command(config: &BridgeConfig, command: Command) -> CliResult<()> {
    let session = resume_session(config).await?;
    let outcome = async {
        let (mut bridge, installation) = open_bridge(config, session.clone()).await?;
        if installation.zone(command.zone()).is_none() {
            warn!(zone = command.zone(), "Zone not listed for this installation");
        }
        bridge.connect().await?;
        let published = bridge.publish_command(&command).await;
        bridge.close().await?;
        published?;
        println!("Sent {command:?}");
        Ok::<(), Box<dyn std::error::Error>>(())
    }
    .await;
    persist_session(config, &session).await;
    outcome
}

async fn monitor(config: &BridgeConfig) -> CliResult<()> {
    let session = resume_session(config).await?;
    let (mut bridge, installation) = open_bridge(config, session.clone()).await?;

    let zones = Arc::new(std::sync::Mutex::new(installation));
    let view = zones.clone();
    bridge
        .subscribe_telemetry(move |frame| {
            let Some(update) = frame.zone_update() else {
                return;
            };
            let Ok(mut installation) = view.lock() else {
                return;
            };
            if installation.apply(&update) {
                if let Some(zone) = installation.zone(update.zone) {
                    println!(
                        "zone {} {}: current {} target {} demand {}%",
                        zone.number,
                        zone.name,
                        format_temperature(zone.current_temperature),
                        format_temperature(zone.target_temperature),
                        zone.demand
                    );
                }
            }
        })
        .await;

    let mut events = bridge.subscribe_events();
    let mut tokens = session.watch_tokens();
    bridge.connect().await?;
    println!("Monitoring; press Ctrl-C to stop");

    let result = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break Ok(());
            }
            Ok(()) = tokens.changed() => {
                let rotated = tokens.borrow_and_update().clone();
                if let Some(rotated) = rotated {
                    match save_tokens(&config.storage.token_file, &rotated) {
                        Ok(()) => debug!(expires_at = %rotated.expires_at, "Persisted refreshed tokens"),
                        Err(e) => warn!(error = %e, "Could not persist refreshed tokens"),
                    }
                }
            }
            event = events.recv() => match event {
                Ok(BridgeEvent::SessionExpired { reason }) => {
                    break Err(format!("session expired, run `neasmart login`: {reason}").into());
                }
                Ok(BridgeEvent::Disconnected { reason }) => {
                    break Err(format!("broker connection lost: {reason}").into());
                }
                Ok(event) => info!(?event, "Bridge event"),
                Err(e) => warn!(error = %e, "Missed bridge events"),
            },
        }
    };

    bridge.close().await?;
    persist_session(config, &session).await;
    result
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> CliResult<()> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

fn load_tokens(path: &Path) -> CliResult<TokenSet> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        format!(
            "cannot read {} ({e}); run `neasmart login` first",
            path.display()
        )
    })?;
    Ok(serde_json::from_str(&content)?)
}

fn save_tokens(path: &Path, tokens: &TokenSet) -> CliResult<()> {
    std::fs::write(path, serde_json::to_string_pretty(tokens)?)?;
    Ok(())
}
