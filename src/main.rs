//! WalletLink CLI - pair with a wallet and watch its requests.
//!
//! This is the main binary entry point. See the `walletlink` library for
//! the relay client itself.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use walletlink::{
    Aes256GcmCodec, ClientMetadata, Codec, Config, ConnectionMultiplexer, InMemorySessionRepository,
    LinkNotice, PairingRequest, RelayUrl, SessionSecret,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "walletlink")]
#[command(version)]
#[command(about = "DApp-side WalletLink relay client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new session, show its QR code and wait for the wallet
    Pair {
        /// Relay to use instead of the configured one
        #[arg(long)]
        url: Option<String>,
    },
    /// Link an existing session and print what the wallet sends
    Link {
        /// Session id
        #[arg(long)]
        id: String,
        /// Shared secret
        #[arg(long)]
        secret: String,
        /// Relay to use instead of the configured one
        #[arg(long)]
        url: Option<String>,
    },
    /// Print the key presented to the relay for a session
    SessionKey {
        /// Session id
        #[arg(long)]
        id: String,
        /// Shared secret
        #[arg(long)]
        secret: String,
    },
    /// Show the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Pair { url } => {
            let url = RelayUrl::from(url.unwrap_or_else(|| config.relay_url.clone()));
            let pairing = PairingRequest::generate(url, config.origin.clone());
            let lines = pairing
                .qr_lines()
                .map_err(|e| anyhow::anyhow!("Deep link does not fit in a QR code: {e}"))?;
            for line in lines {
                println!("{line}");
            }
            println!();
            println!("{}", pairing.deep_link());
            println!();
            run_session(&config, &pairing.session_id, pairing.secret.clone(), &pairing.url)
        }
        Commands::Link { id, secret, url } => {
            let url = RelayUrl::from(url.unwrap_or_else(|| config.relay_url.clone()));
            run_session(&config, &id, SessionSecret::new(secret), &url)
        }
        Commands::SessionKey { id, secret } => {
            println!("{}", Aes256GcmCodec::new().session_key(&id, &SessionSecret::new(secret)));
            Ok(())
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.join("config.json").display());
            }
            Ok(())
        }
    }
}

/// Link one session and print requests and notices until Ctrl-C or the
/// transport closes.
fn run_session(config: &Config, session_id: &str, secret: SessionSecret, url: &RelayUrl) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async {
        let multiplexer = ConnectionMultiplexer::new(
            Arc::new(config.connector()),
            Arc::new(InMemorySessionRepository::new()),
            config.multiplexer_options(),
        );
        let mut requests = multiplexer.subscribe_requests();
        let mut notices = multiplexer.subscribe_notices();

        println!("Linking session {session_id} on {url}...");
        multiplexer
            .link(session_id, secret, None, url, &config.user_id, ClientMetadata::new())
            .await
            .with_context(|| format!("Failed to link session {session_id}"))?;
        println!("Linked. Waiting for the wallet (Ctrl-C to quit).");

        loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    println!(
                        "Request {} ({}): {}",
                        request.id.event_id, request.method, request.decrypted_payload
                    );
                    multiplexer.mark_as_seen(&[request.id]).await;
                }
                Some(notice) = notices.recv() => {
                    println!("{notice:?}");
                    if matches!(notice, LinkNotice::TransportClosed { .. } | LinkNotice::SessionDestroyed { .. }) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        multiplexer.disconnect();
        Ok::<(), anyhow::Error>(())
    })
}
