//! TLS termination endpoint fed by the tunnel handoff channel.

use std::sync::Arc;

use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::crypto::ring;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use super::relay::{bad_gateway, text_response, Relay, RelayBody};
use crate::ca::CertIssuer;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("client sent no server name")]
    NoServerName,
    #[error("HTTP error on decrypted stream: {0}")]
    Http(#[source] hyper::Error),
}

/// HTTPS server whose listener is the tunnel handoff channel.
///
/// Receiving a stream from the channel is the accept operation; that is the
/// moment tunnel ownership transfers from the bridge. Each handshake selects
/// its certificate through the issuer, keyed by the client's SNI.
pub struct TerminationEndpoint {
    acceptor: TlsAcceptor,
    relay: Arc<Relay>,
    handoff: mpsc::Receiver<TcpStream>,
}

impl TerminationEndpoint {
    pub fn new(
        issuer: Arc<CertIssuer>,
        relay: Arc<Relay>,
        handoff: mpsc::Receiver<TcpStream>,
    ) -> Result<Self, rustls::Error> {
        let config = server_config(issuer)?;
        Ok(Self {
            acceptor: TlsAcceptor::from(config),
            relay,
            handoff,
        })
    }

    /// Accept loop. Takes the next handed-off connection, then negotiates
    /// and serves it on its own task so the next handoff can proceed while
    /// the handshake completes.
    pub async fn run(mut self) {
        while let Some(stream) = self.handoff.recv().await {
            let acceptor = self.acceptor.clone();
            let relay = Arc::clone(&self.relay);
            tokio::spawn(async move {
                if let Err(err) = terminate(stream, acceptor, relay).await {
                    warn!("tunnel ended: {}", err);
                }
            });
        }
        debug!("handoff channel closed, termination endpoint exiting");
    }
}

fn server_config(issuer: Arc<CertIssuer>) -> Result<Arc<ServerConfig>, rustls::Error> {
    // Modern curve first, classical curves as fallback.
    let provider = rustls::crypto::CryptoProvider {
        kx_groups: vec![
            ring::kx_group::X25519,
            ring::kx_group::SECP256R1,
            ring::kx_group::SECP384R1,
        ],
        ..ring::default_provider()
    };

    // TLS 1.2 is the oldest protocol rustls will negotiate.
    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IssuerCertResolver { issuer }));

    Ok(Arc::new(config))
}

/// Resolves handshake certificates through the issuer, keyed by SNI.
struct IssuerCertResolver {
    issuer: Arc<CertIssuer>,
}

impl std::fmt::Debug for IssuerCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for IssuerCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(sni) = client_hello.server_name() else {
            // Never substitute a default certificate.
            warn!("client hello carried no SNI, refusing handshake");
            return None;
        };
        match self.issuer.certificate_for(sni) {
            Ok(key) => Some(key),
            Err(err) => {
                error!("certificate issuance failed for {}: {}", sni, err);
                None
            }
        }
    }
}

async fn terminate(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    relay: Arc<Relay>,
) -> Result<(), ConnectionError> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(ConnectionError::Handshake)?;

    let server_name = tls_stream
        .get_ref()
        .1
        .server_name()
        .map(str::to_string)
        .ok_or(ConnectionError::NoServerName)?;
    debug!("handshake complete for {}", server_name);

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| {
        let relay = Arc::clone(&relay);
        async move { Ok::<_, std::convert::Infallible>(relay_decrypted(req, relay).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(ConnectionError::Http)
}

async fn relay_decrypted(req: Request<Incoming>, relay: Arc<Relay>) -> Response<RelayBody> {
    let Some(target) = upstream_target(&req) else {
        return text_response(StatusCode::BAD_REQUEST, "missing Host header");
    };

    match relay.forward(req, target).await {
        Ok(resp) => resp,
        Err(err) => bad_gateway(&err),
    }
}

/// Builds the upstream target for a decrypted request.
///
/// The destination is whatever host the client addressed inside the tunnel.
/// The client's TLS session ends at this endpoint; the upstream hop is
/// re-dialed as a fresh HTTPS round trip, never a continuation of the
/// client's session.
fn upstream_target<B>(req: &Request<B>) -> Option<Uri> {
    let host = req.headers().get(http::header::HOST)?.to_str().ok()?;
    let authority: Authority = host.parse().ok()?;
    let path_and_query = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .ok()
}
