//! CONNECT tunnel establishment and handoff to the TLS termination endpoint.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Literal acknowledgment written to the raw stream once a tunnel is
/// accepted, before any TLS bytes are exchanged.
const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Cap on the CONNECT request line plus headers.
const MAX_CONNECT_HEAD: u64 = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed CONNECT request")]
    MalformedConnect,
    #[error("I/O error on client connection: {0}")]
    Io(#[from] std::io::Error),
    #[error("termination endpoint is gone")]
    EndpointClosed,
}

/// Hands hijacked CONNECT streams to the TLS termination endpoint.
///
/// The handoff channel is bounded; once full, establishment blocks until the
/// endpoint takes the next connection. Tunnels queue in FIFO order and are
/// never dropped.
pub struct TunnelBridge {
    handoff: mpsc::Sender<TcpStream>,
}

impl TunnelBridge {
    pub fn new(handoff: mpsc::Sender<TcpStream>) -> Self {
        Self { handoff }
    }

    /// Establishes a tunnel: reads the CONNECT head directly off the raw
    /// stream, writes the literal acknowledgment, and submits the stream to
    /// the termination endpoint.
    ///
    /// After the head is consumed no HTTP machinery owns the socket; the
    /// acknowledgment is flushed before the handoff so the client may start
    /// its TLS handshake the moment the endpoint picks the stream up. A
    /// failure here ends this one request only.
    pub async fn establish(&self, stream: TcpStream) -> Result<(), BridgeError> {
        let mut reader = BufReader::new(stream);

        let target = match read_connect_head(&mut reader).await {
            Ok(target) => target,
            Err(err) => {
                let mut stream = reader.into_inner();
                let _ = stream.write_all(BAD_REQUEST).await;
                return Err(err);
            }
        };

        // The target is informational only: interception happens by routing
        // the tunnel into the local termination endpoint, never by dialing
        // the destination.
        debug!("tunnel requested for {}", target);

        // A conforming client waits for the acknowledgment before sending
        // TLS bytes. Anything buffered past the head arrived early and is
        // discarded with the reader, not replayed into the tunnel.
        let buffered = reader.buffer().len();
        if buffered > 0 {
            warn!(
                "discarding {} bytes sent before the tunnel acknowledgment",
                buffered
            );
        }

        let mut stream = reader.into_inner();
        stream.write_all(TUNNEL_ESTABLISHED).await?;
        stream.flush().await?;

        self.handoff
            .send(stream)
            .await
            .map_err(|_| BridgeError::EndpointClosed)
    }
}

/// Reads the CONNECT request line and headers, returning the target.
///
/// Reads are capped at [`MAX_CONNECT_HEAD`] bytes total; a head that exceeds
/// the cap, or ends before its blank line, is malformed. A line cut short by
/// the cap shows up as missing its trailing newline.
async fn read_connect_head(reader: &mut BufReader<TcpStream>) -> Result<String, BridgeError> {
    let mut limited = reader.take(MAX_CONNECT_HEAD);

    let mut line = String::new();
    if limited.read_line(&mut line).await? == 0 || !line.ends_with('\n') {
        return Err(BridgeError::MalformedConnect);
    }

    let mut parts = line.split_whitespace();
    if parts.next() != Some("CONNECT") {
        return Err(BridgeError::MalformedConnect);
    }
    let target = parts
        .next()
        .ok_or(BridgeError::MalformedConnect)?
        .to_string();

    // Drain the remaining headers up to the blank line.
    loop {
        let mut header = String::new();
        if limited.read_line(&mut header).await? == 0 || !header.ends_with('\n') {
            return Err(BridgeError::MalformedConnect);
        }
        if header == "\r\n" || header == "\n" {
            break;
        }
    }

    Ok(target)
}
