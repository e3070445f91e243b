use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tlspeek::{ProxyConfig, ProxyServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// TLS-intercepting forward proxy.
///
/// Terminates TLS for CONNECT tunnels with certificates minted on demand by
/// the configured CA, then relays the decrypted traffic upstream.
#[derive(Parser, Debug)]
#[command(name = "tlspeek")]
#[command(version, about)]
struct Args {
    /// Path to the proxy configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Path to the CA certificate (PEM). Required unless set in the config
    /// file.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to the CA private key (PEM). Required unless set in the config
    /// file.
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Mirror relayed JSON response bodies to stdout.
    #[arg(long)]
    tee_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = if let Some(ref config_path) = args.config {
        ProxyConfig::load(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        let ca_cert = args
            .ca_cert
            .clone()
            .context("--ca-cert is required without a config file")?;
        let ca_key = args
            .ca_key
            .clone()
            .context("--ca-key is required without a config file")?;
        ProxyConfig::new(ca_cert, ca_key)
    };

    // Command line flags win over the config file.
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(ca_cert) = args.ca_cert {
        config.ca_cert = ca_cert;
    }
    if let Some(ca_key) = args.ca_key {
        config.ca_key = ca_key;
    }
    if args.tee_json {
        config.tee_json = true;
    }

    let server = ProxyServer::bind(&config)
        .await
        .context("failed to start proxy server")?;
    server.run().await.context("proxy server failed")?;

    Ok(())
}
