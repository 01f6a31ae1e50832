use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use voicebot_core::config::{Config, LoggingConfig};
use voicebot_gateway::GatewayState;
use voicebot_gateway::calls::{CallInitiator, ExotelCaller};

#[derive(Parser)]
#[command(
    name = "voicebot",
    about = "Telephony media-stream gateway that greets every caller",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 3000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Place an outbound call that streams into this gateway
    Call {
        /// Number to dial, in E.164 form
        to: String,

        /// Caller id shown to the callee
        #[arg(long)]
        from: Option<String>,

        /// Tracking id handed back by the connect webhook
        #[arg(long)]
        custom_field: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration with secrets masked
    Show,
    /// Check the configuration for problems
    Validate,
}

const SECRET_KEYS: [&str; 3] = ["token", "api_key", "api_token"];

/// Mask secret-bearing fields before printing.
fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) && v.is_string() {
                    *v = Value::String("********".into());
                } else {
                    redact(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

fn log_filter(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = log_filter(logging, verbose);
    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
    );
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("Config: {warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("Config: {error}");
                }
                anyhow::bail!("invalid configuration in {}", config_path.display());
            }

            let port = port.unwrap_or_else(|| config.gateway_port());
            tracing::info!("Starting voicebot gateway on port {port}");
            let state = Arc::new(GatewayState::from_config(Arc::new(config))?);
            voicebot_gateway::start_gateway(state, port).await?;
        }
        Commands::Call {
            to,
            from,
            custom_field,
        } => {
            let telephony = config
                .telephony
                .as_ref()
                .context("no `telephony` section in config")?;
            let caller = ExotelCaller::from_config(telephony)?;
            let placed = caller
                .place_call(&to, from.as_deref(), custom_field.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&placed)?);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let mut value = serde_json::to_value(&config)?;
                redact(&mut value);
                println!("# {}", config_path.display());
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}
