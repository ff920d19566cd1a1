//! Spyglass network process
//!
//! Fetches Gemini, Gopher and Finger resources on behalf of a browser UI.
//! The UI talks to this process over a framed message channel on
//! stdin/stdout; every fetch is an independent request identified by an id.

mod config;
mod network;
mod protocol;
mod scheme;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use config::{Config, ResolverKind};
use network::{Dispatcher, RequestContext, Shutdown};
use protocol::{pump_inbound, pump_outbound, ClientIdentity, Message};
use scheme::Target;

/// Id used by the one-shot fetch command
const FETCH_ID: protocol::RequestId = 1;

/// Spyglass network process
#[derive(Parser)]
#[command(name = "spyglass-net")]
#[command(author = "Spyglass Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Gemini, Gopher and Finger fetcher for the Spyglass browser", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the [network] config section
#[derive(Args, Debug, Default)]
struct NetworkArgs {
    /// TLS handshake timeout in milliseconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Per-address connect timeout in milliseconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Resolve host names with a blocking lookup
    #[arg(long)]
    blocking_resolver: bool,
}

impl NetworkArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(ms) = self.handshake_timeout {
            config.network.handshake_timeout_ms = ms;
        }
        if let Some(ms) = self.connect_timeout {
            config.network.connect_timeout_ms = Some(ms);
        }
        if self.blocking_resolver {
            config.network.resolver = ResolverKind::Blocking;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the message channel on stdin/stdout
    Serve {
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// Fetch one URL and write the body to stdout
    Fetch {
        /// gemini://, gopher:// or finger:// URL
        url: String,

        /// Accept the server certificate
        #[arg(long)]
        trust: bool,

        /// Print the reply header to stderr
        #[arg(long)]
        show_header: bool,

        /// PEM client certificate (Gemini only)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM PKCS#8 private key for --cert
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        #[command(flatten)]
        network: NetworkArgs,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // stdout carries the message channel, so logs go to stderr
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { network } => {
            network.apply(&mut config);
            run_serve(config).await?;
        }
        Commands::Fetch {
            url,
            trust,
            show_header,
            cert,
            key,
            network,
        } => {
            network.apply(&mut config);
            let identity = match (cert, key) {
                (Some(cert), Some(key)) => Some(load_identity(&cert, &key)?),
                _ => None,
            };
            run_fetch(config, &url, trust, show_header, identity).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Can't listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Run as the network process behind a UI
async fn run_serve(config: Config) -> anyhow::Result<()> {
    let capacity = config.network.channel_capacity();
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let reader = tokio::spawn(pump_inbound(tokio::io::stdin(), inbound_tx));
    let writer = tokio::spawn(pump_outbound(tokio::io::stdout(), outbound_rx));

    tracing::info!(
        "Serving on stdin/stdout (resolver: {:?}, handshake timeout: {:?})",
        config.network.resolver,
        config.network.handshake_timeout()
    );

    let mut dispatcher = Dispatcher::new(RequestContext::from_config(&config.network));
    let outcome = dispatcher.run(inbound_rx, outbound_tx, interrupted()).await;

    // Every sender is gone now, so the writer drains what is queued and exits
    if let Err(e) = writer.await? {
        tracing::error!("Outbound channel failed: {}", e);
    }

    let reason = outcome?;
    if reason == Shutdown::ChannelClosed {
        reader.await?.context("inbound channel failed")?;
    } else {
        // A blocking read on stdin can't be cancelled; don't wait for it
        tracing::info!("Network process stopped ({:?})", reason);
        std::process::exit(0);
    }

    tracing::info!("Network process stopped");
    Ok(())
}

/// Fetch a single URL through the dispatcher, acting as the UI
async fn run_fetch(
    config: Config,
    url: &str,
    trust: bool,
    show_header: bool,
    identity: Option<ClientIdentity>,
) -> anyhow::Result<()> {
    let url = Url::parse(url).with_context(|| format!("invalid URL: {}", url))?;
    let target = Target::from_url(&url)?;

    let capacity = config.network.channel_capacity();
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(capacity);

    let mut dispatcher = Dispatcher::new(RequestContext::from_config(&config.network));
    let dispatch =
        tokio::spawn(async move { dispatcher.run(inbound_rx, outbound_tx, interrupted()).await });

    inbound_tx
        .send(Message::Fetch {
            id: FETCH_ID,
            scheme: target.scheme,
            host: target.host,
            port: target.port,
            request: target.request,
            identity,
        })
        .await?;

    let mut stdout = tokio::io::stdout();
    let mut outcome = Ok(());

    while let Some(message) = outbound_rx.recv().await {
        match message {
            Message::TrustCheck { fingerprint, .. } => {
                eprintln!("Server certificate: {}", fingerprint);
                if !trust {
                    outcome = Err(anyhow::anyhow!(
                        "certificate not trusted (rerun with --trust to accept it)"
                    ));
                }
                inbound_tx
                    .send(Message::TrustVerdict { id: FETCH_ID, accept: trust })
                    .await?;
            }
            Message::ReplyHeader { status, meta, .. } => {
                if show_header {
                    eprintln!("{} {}", status, meta);
                }
                if status / 10 == 2 {
                    inbound_tx.send(Message::Proceed { id: FETCH_ID }).await?;
                } else {
                    outcome = Err(anyhow::anyhow!("server replied {} {}", status, meta));
                }
            }
            Message::BodyChunk { data, .. } => {
                stdout.write_all(&data).await?;
            }
            Message::EndOfStream { .. } => break,
            Message::Error { message, .. } => {
                outcome = Err(anyhow::anyhow!(message));
                break;
            }
            other => tracing::debug!("Unexpected message {:?}", other),
        }
    }
    stdout.flush().await?;

    // The dispatcher may already be gone after Ctrl-C
    let _ = inbound_tx.send(Message::Quit).await;
    drop(outbound_rx);
    match dispatch.await? {
        Ok(Shutdown::Interrupted) => anyhow::bail!("interrupted"),
        Ok(_) | Err(_) => {}
    }

    outcome
}

fn load_identity(cert: &Path, key: &Path) -> anyhow::Result<ClientIdentity> {
    Ok(ClientIdentity {
        cert_pem: std::fs::read(cert)
            .with_context(|| format!("can't read certificate {}", cert.display()))?,
        key_pem: std::fs::read(key)
            .with_context(|| format!("can't read key {}", key.display()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["spyglass-net", "serve"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_fetch_arguments() {
        let cli = Cli::try_parse_from([
            "spyglass-net",
            "--verbose",
            "fetch",
            "gemini://example.org/",
            "--trust",
            "--handshake-timeout",
            "750",
        ])
        .unwrap();
        assert!(cli.verbose);

        match cli.command {
            Commands::Fetch {
                url,
                trust,
                show_header,
                network,
                ..
            } => {
                assert_eq!(url, "gemini://example.org/");
                assert!(trust);
                assert!(!show_header);

                let mut config = Config::default();
                network.apply(&mut config);
                assert_eq!(config.network.handshake_timeout_ms, 750);
                assert_eq!(config.network.resolver, ResolverKind::Async);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_cert_requires_key() {
        let cli = Cli::try_parse_from([
            "spyglass-net",
            "fetch",
            "gemini://example.org/",
            "--cert",
            "me.pem",
        ]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from(["spyglass-net", "serve", "--blocking-resolver"]).unwrap();
        let Commands::Serve { network } = cli.command else {
            panic!("expected serve");
        };
        let mut config = Config::default();
        network.apply(&mut config);
        assert_eq!(config.network.resolver, ResolverKind::Blocking);
    }
}
