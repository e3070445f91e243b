//! Upstream HTTP relay: header normalization, streaming bodies, and the
//! optional JSON diagnostic tee.

use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_TYPE};
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

/// Body type produced by the relay and its error responses.
pub type RelayBody = BoxBody<Bytes, hyper::Error>;

/// Upstream transport failure (DNS, connect, timeout, TLS trust).
///
/// Rendered to the client as a bare 502; the cause is logged server-side
/// only.
#[derive(Debug, thiserror::Error)]
#[error("upstream round trip failed: {0}")]
pub struct GatewayError(#[source] hyper_util::client::legacy::Error);

/// Receives a copy of relayed JSON response bodies.
///
/// The sink sees exactly the bytes the client receives, in write order. Sink
/// failures must never affect the client stream.
pub trait DiagnosticSink: Send + Sync {
    fn write(&self, chunk: &[u8]);
}

/// Diagnostic sink that mirrors chunks to stdout.
pub struct StdoutSink;

impl DiagnosticSink for StdoutSink {
    fn write(&self, chunk: &[u8]) {
        let _ = std::io::stdout().write_all(chunk);
    }
}

/// Forwards requests upstream and streams responses back.
pub struct Relay {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl Relay {
    /// Creates a relay trusting the bundled webpki roots for upstream TLS.
    /// `sink` receives a copy of JSON response bodies.
    pub fn new(sink: Option<Arc<dyn DiagnosticSink>>) -> Self {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Self::with_root_store(sink, roots)
    }

    /// Creates a relay with an explicit trust store for upstream TLS, for
    /// origins whose chains anchor at a private CA.
    pub fn with_root_store(
        sink: Option<Arc<dyn DiagnosticSink>>,
        roots: rustls::RootCertStore,
    ) -> Self {
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            sink,
        }
    }

    /// Forwards the request to `target` and streams the response back.
    ///
    /// Strips the client's `Accept-Encoding` so upstream never negotiates a
    /// compression this proxy would have to re-transmit opaquely. Response
    /// headers come back verbatim; the body is streamed, never buffered
    /// whole. No retries: a failed round trip is reported once as a
    /// [`GatewayError`].
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        target: Uri,
    ) -> Result<Response<RelayBody>, GatewayError> {
        req.headers_mut().remove(ACCEPT_ENCODING);
        *req.uri_mut() = target;

        debug!("forwarding {} {}", req.method(), req.uri());
        let resp = self.client.request(req).await.map_err(GatewayError)?;
        debug!("upstream responded {}", resp.status());

        let (parts, body) = resp.into_parts();
        let body = match &self.sink {
            Some(sink) if is_json_media_type(parts.headers.get(CONTENT_TYPE)) => {
                TeeBody::new(body, Arc::clone(sink)).boxed()
            }
            _ => body.boxed(),
        };
        Ok(Response::from_parts(parts, body))
    }
}

/// Renders a gateway failure as a 502 with a generic body.
pub fn bad_gateway(err: &GatewayError) -> Response<RelayBody> {
    error!("{}", err);
    text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
}

/// Builds a short plain-text response with the given status.
pub fn text_response(status: StatusCode, message: &'static str) -> Response<RelayBody> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

fn is_json_media_type(value: Option<&HeaderValue>) -> bool {
    let Some(Ok(content_type)) = value.map(|v| v.to_str()) else {
        return false;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Body wrapper that duplicates data frames into a diagnostic sink.
struct TeeBody<B> {
    inner: B,
    sink: Arc<dyn DiagnosticSink>,
}

impl<B> TeeBody<B> {
    fn new(inner: B, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { inner, sink }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();
        let frame = std::task::ready!(Pin::new(&mut this.inner).poll_frame(cx));
        if let Some(Ok(frame)) = &frame {
            if let Some(data) = frame.data_ref() {
                this.sink.write(data);
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CaptureSink(Mutex<Vec<u8>>);

    impl DiagnosticSink for CaptureSink {
        fn write(&self, chunk: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(chunk);
        }
    }

    #[test]
    fn json_media_types_detected() {
        let header = |s: &str| HeaderValue::from_str(s).unwrap();
        assert!(is_json_media_type(Some(&header("application/json"))));
        assert!(is_json_media_type(Some(&header(
            "application/json; charset=utf-8"
        ))));
        assert!(is_json_media_type(Some(&header("application/problem+json"))));
        assert!(!is_json_media_type(Some(&header("text/html"))));
        assert!(!is_json_media_type(Some(&header("application/jsonp"))));
        assert!(!is_json_media_type(None));
    }

    /// The tee delivers identical bytes to the client and the sink.
    #[tokio::test]
    async fn tee_body_mirrors_client_bytes() {
        let sink = Arc::new(CaptureSink::default());
        let payload = Bytes::from_static(b"{\"ok\":true}");
        let body = TeeBody::new(Full::new(payload.clone()), Arc::clone(&sink) as _);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, payload);
        assert_eq!(sink.0.lock().unwrap().as_slice(), payload.as_ref());
    }

    #[tokio::test]
    async fn text_response_carries_status_and_body() {
        let resp = text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"Bad Gateway");
    }
}
