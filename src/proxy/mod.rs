//! TLS-intercepting forward proxy.
//!
//! This module provides the plain proxy listener, the CONNECT tunnel bridge,
//! the channel-fed TLS termination endpoint, and the upstream relay.

mod bridge;
mod relay;
mod server;
mod tls;

pub use bridge::{BridgeError, TunnelBridge};
pub use relay::{DiagnosticSink, GatewayError, Relay, RelayBody, StdoutSink};
pub use server::{ProxyServer, ProxyState, StartupError};
pub use tls::{ConnectionError, TerminationEndpoint};
