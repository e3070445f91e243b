//! TLS-intercepting forward proxy.
//!
//! This crate provides a forward HTTP proxy that terminates TLS for CONNECT
//! tunnels using certificates minted on demand by a configured CA, then
//! relays the decrypted traffic upstream.
//!
//! # Architecture
//!
//! One listener serves both traffic shapes:
//! 1. A CONNECT request is acknowledged on the raw socket, then the stream
//!    is handed off to the TLS termination endpoint over a bounded channel
//! 2. The endpoint negotiates TLS, presenting a certificate issued for the
//!    client's SNI and signed by the configured CA
//! 3. Decrypted requests (and ordinary absolute-URI requests on the plain
//!    path) are relayed upstream with `Accept-Encoding` stripped
//! 4. Relayed JSON response bodies can be mirrored to a diagnostic sink
//!
//! Clients must trust the CA certificate for interception to work.
//!
//! # Example
//!
//! ```no_run
//! use tlspeek::{ProxyConfig, ProxyServer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProxyConfig::new("ca.crt".into(), "ca.key".into());
//! let server = ProxyServer::bind(&config).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod ca;
mod config;
pub mod proxy;

pub use ca::{CaError, CaMaterial, CertIssuer, IssueError};
pub use config::{ConfigError, ProxyConfig};
pub use proxy::{DiagnosticSink, ProxyServer, ProxyState, StartupError};
