//! peercall - WebRTC call signaling from the terminal
//!
//! Places and answers one-to-one audio/video calls over a Socket.IO
//! signaling server.

mod calling;
mod config;
mod socket;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calling::runner::{self, IncomingPolicy};
use calling::CallType;
use config::Config;

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Terminal WebRTC calling client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Call another user
    Call {
        /// User id of the person to call
        participant: String,

        /// Audio only (no camera)
        #[arg(long)]
        audio: bool,

        /// Hang up this many seconds after the call connects
        #[arg(short, long)]
        duration: Option<u64>,

        /// Signaling server URL (overrides the config file)
        #[arg(long)]
        signaling_url: Option<String>,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept every incoming call
        #[arg(long, conflicts_with = "reject")]
        auto_accept: bool,

        /// Reject every incoming call
        #[arg(long)]
        reject: bool,

        /// Signaling server URL (overrides the config file)
        #[arg(long)]
        signaling_url: Option<String>,
    },

    /// Show or change the stored configuration
    Config {
        /// Base URL of the signaling server
        #[arg(long)]
        signaling_url: Option<String>,

        /// Your user id on the signaling server
        #[arg(long)]
        user_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Call {
            participant,
            audio,
            duration,
            signaling_url,
        } => {
            let config = load_config(signaling_url)?;
            let call_type = if audio { CallType::Audio } else { CallType::Video };
            runner::run_call(&config, &participant, call_type, duration).await?;
        }
        Commands::Listen {
            auto_accept,
            reject,
            signaling_url,
        } => {
            let config = load_config(signaling_url)?;
            let policy = match (auto_accept, reject) {
                (true, _) => IncomingPolicy::Accept,
                (_, true) => IncomingPolicy::Reject,
                _ => IncomingPolicy::Ask,
            };
            runner::run_listen(&config, policy).await?;
        }
        Commands::Config {
            signaling_url,
            user_id,
        } => {
            let mut config = Config::load()?;
            let changed = signaling_url.is_some() || user_id.is_some();
            if let Some(url) = signaling_url {
                // Refuse URLs the client could never connect to.
                socket::endpoint_url(&url, "")?;
                config.signaling_url = url;
            }
            if let Some(id) = user_id {
                config.user_id = Some(id);
            }
            if changed {
                config.save()?;
                tracing::info!("Saved {}", Config::config_path()?.display());
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(signaling_url: Option<String>) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(url) = signaling_url {
        config.signaling_url = url;
    }
    Ok(config)
}
