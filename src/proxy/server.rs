//! Plain proxy listener: CONNECT tunnels and direct forwarding.

use std::net::SocketAddr;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::bridge::{BridgeError, TunnelBridge};
use super::relay::{bad_gateway, text_response, DiagnosticSink, Relay, RelayBody, StdoutSink};
use super::tls::TerminationEndpoint;
use crate::ca::{CaMaterial, CertIssuer};
use crate::config::ProxyConfig;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("CA material unusable: {0}")]
    Ca(#[from] crate::ca::CaError),
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tunnel bridge failed: {0}")]
    Bridge(#[from] BridgeError),
    #[error("HTTP error: {0}")]
    Http(#[source] hyper::Error),
}

/// Shared state for the proxy.
pub struct ProxyState {
    issuer: Arc<CertIssuer>,
    relay: Arc<Relay>,
    bridge: TunnelBridge,
}

impl ProxyState {
    /// Returns the certificate issuer.
    pub fn issuer(&self) -> &Arc<CertIssuer> {
        &self.issuer
    }
}

/// The plain proxy listener.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Loads CA material, spawns the termination endpoint, and binds the
    /// plain listener. Unusable CA material is fatal.
    pub async fn bind(config: &ProxyConfig) -> Result<Self, StartupError> {
        let sink = config
            .tee_json
            .then(|| Arc::new(StdoutSink) as Arc<dyn DiagnosticSink>);
        Self::bind_with_sink(config, sink).await
    }

    /// Like [`bind`](Self::bind), with an explicit diagnostic sink for
    /// relayed JSON bodies.
    pub async fn bind_with_sink(
        config: &ProxyConfig,
        sink: Option<Arc<dyn DiagnosticSink>>,
    ) -> Result<Self, StartupError> {
        let ca = CaMaterial::load(&config.ca_cert, &config.ca_key)?;

        // Upstream chains may anchor at the interception CA itself (private
        // origins), so trust it alongside the bundled roots.
        let mut roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        roots.add(ca.ca_cert_der().clone())?;

        let issuer = Arc::new(CertIssuer::new(ca));
        let relay = Arc::new(Relay::with_root_store(sink, roots));

        // The handoff capacity bounds how many acknowledged tunnels may
        // queue awaiting TLS negotiation before CONNECT handling blocks.
        let (handoff_tx, handoff_rx) = mpsc::channel(config.tunnel_backlog.max(1));
        let endpoint =
            TerminationEndpoint::new(Arc::clone(&issuer), Arc::clone(&relay), handoff_rx)?;
        tokio::spawn(endpoint.run());

        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| StartupError::Bind {
                addr: config.listen,
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| StartupError::Bind {
            addr: config.listen,
            source,
        })?;
        info!("proxy listening on {}", addr);

        Ok(Self {
            listener,
            state: Arc::new(ProxyState {
                issuer,
                relay,
                bridge: TunnelBridge::new(handoff_tx),
            }),
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Returns the shared proxy state.
    pub fn state(&self) -> Arc<ProxyState> {
        Arc::clone(&self.state)
    }

    /// Accepts connections forever, one task per connection. Per-connection
    /// failures never reach the listener.
    pub async fn run(self) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("accepted connection from {}", peer_addr);

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state).await {
                    error!("connection error from {}: {}", peer_addr, err);
                }
            });
        }
    }
}

/// Routes one accepted connection: CONNECT enters the tunnel bridge,
/// anything else is served as ordinary HTTP.
async fn handle_connection(stream: TcpStream, state: Arc<ProxyState>) -> Result<(), ProxyError> {
    // Peek without consuming; the bytes stay queued for whichever path
    // takes the stream.
    let mut head = [0u8; 8];
    let n = stream.peek(&mut head).await?;
    if n == 0 {
        return Ok(());
    }

    let head = &head[..n];
    if head.starts_with(b"CONNECT ") || b"CONNECT ".starts_with(head) {
        state.bridge.establish(stream).await?;
        return Ok(());
    }

    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, std::convert::Infallible>(relay_plain(req, state).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(ProxyError::Http)
}

/// Forwards an ordinary (non-CONNECT) proxy request.
///
/// The destination comes from the request's own absolute URI; origin-form
/// requests have no declared destination and are rejected.
async fn relay_plain(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<RelayBody> {
    if req.uri().scheme().is_none() || req.uri().authority().is_none() {
        return text_response(StatusCode::BAD_REQUEST, "absolute URI required");
    }

    let target = req.uri().clone();
    debug!("{} {}", req.method(), target);

    match state.relay.forward(req, target).await {
        Ok(resp) => resp,
        Err(err) => bad_gateway(&err),
    }
}
