//! TCP transport for consensus message delivery.
//!
//! Every frame on the wire is length-prefixed:
//!
//! ```text
//! [4 bytes: body length (u32-le)] [1: channel] [1: tag] [N: bincode payload]
//! ```
//!
//! The listener reads the header, bounds-checks the length, reads the
//! body, decodes it (dropping wrong-channel messages), and hands the
//! result to the router through an mpsc channel. One Tokio task per
//! accepted connection.

use {
    crate::{
        config::ConsensusNetConfig,
        error::Result,
        message::{
            decode_frame, encode_consensus, encode_sync, read_frame_len, Channel,
            ConsensusWireMessage, SyncMessage, WireMessage,
        },
    },
    log::{debug, error, info, warn},
    std::net::SocketAddr,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
    },
};

/// A decoded message together with its origin.
#[derive(Debug)]
pub struct InboundFrame {
    /// The channel it arrived on.
    pub channel: Channel,
    /// The decoded message.
    pub message: WireMessage,
    /// The remote socket address that sent it.
    pub from: SocketAddr,
}

/// Handle returned by [`TransportListener::start`].
pub struct TransportHandle {
    /// Every decoded inbound frame.
    pub inbound_rx: mpsc::Receiver<InboundFrame>,
    /// The bound local address (useful when the port was 0).
    pub local_addr: SocketAddr,
}

/// Accepts inbound TCP connections and decodes frames.
pub struct TransportListener {
    config: ConsensusNetConfig,
}

impl TransportListener {
    /// Listener over the given config.
    pub fn new(config: ConsensusNetConfig) -> Self {
        Self { config }
    }

    /// Bind and start accepting connections.
    pub async fn start(self) -> Result<TransportHandle> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("consensus transport listening on {local_addr}");

        let (tx, rx) = mpsc::channel::<InboundFrame>(self.config.inbound_queue_size);
        let max_msg = self.config.max_message_size;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted consensus connection from {addr}");
                        let tx = tx.clone();
                        tokio::spawn(Self::handle_connection(stream, addr, tx, max_msg));
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                    }
                }
            }
        });

        Ok(TransportHandle {
            inbound_rx: rx,
            local_addr,
        })
    }

    /// Read frames from `stream` until EOF or error.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx: mpsc::Sender<InboundFrame>,
        max_message_size: usize,
    ) {
        let mut header = [0u8; 4];
        loop {
            if let Err(e) = stream.read_exact(&mut header).await {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!("header read error from {addr}: {e}");
                }
                break;
            }
            let len = read_frame_len(&header);
            if len > max_message_size {
                warn!(
                    "peer {addr} sent oversized frame ({len} > {max_message_size}), dropping connection"
                );
                break;
            }

            let mut body = vec![0u8; len];
            if let Err(e) = stream.read_exact(&mut body).await {
                warn!("body read error from {addr}: {e}");
                break;
            }

            match decode_frame(&body) {
                Ok((channel, message)) => {
                    if tx
                        .send(InboundFrame {
                            channel,
                            message,
                            from: addr,
                        })
                        .await
                        .is_err()
                    {
                        info!("inbound channel closed, stopping reader for {addr}");
                        break;
                    }
                }
                Err(e) => {
                    // Wrong-channel and unknown-tag frames are dropped;
                    // the connection stays up.
                    warn!("dropping frame from {addr}: {e}");
                }
            }
        }
        debug!("connection to {addr} closed");
    }
}

// ── Outbound sending ────────────────────────────────────────────────────────

/// Send one consensus message over a new TCP connection.
///
/// Production callers keep persistent connections; this helper serves
/// one-shot sends and tests.
pub async fn send_consensus(
    addr: SocketAddr,
    msg: &ConsensusWireMessage,
    max_message_size: usize,
) -> Result<()> {
    let frame = encode_consensus(msg, max_message_size)?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Send one fast-sync message over a new TCP connection.
pub async fn send_sync(
    addr: SocketAddr,
    msg: &SyncMessage,
    max_message_size: usize,
) -> Result<()> {
    let frame = encode_sync(msg, max_message_size)?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Send a consensus message over an existing stream.
pub async fn send_on_stream(
    stream: &mut TcpStream,
    msg: &ConsensusWireMessage,
    max_message_size: usize,
) -> Result<()> {
    let frame = encode_consensus(msg, max_message_size)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Broadcast a consensus message to several addresses concurrently.
/// Returns the addresses where sending failed.
pub async fn broadcast_consensus(
    addrs: &[SocketAddr],
    msg: &ConsensusWireMessage,
    max_message_size: usize,
) -> Vec<SocketAddr> {
    let frame = match encode_consensus(msg, max_message_size) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("broadcast encode failed: {e}");
            return addrs.to_vec();
        }
    };

    let mut handles = Vec::with_capacity(addrs.len());
    for &addr in addrs {
        let frame = frame.clone();
        handles.push(tokio::spawn(async move {
            let result = async {
                let mut stream = TcpStream::connect(addr).await?;
                stream.write_all(&frame).await?;
                stream.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await;
            (addr, result)
        }));
    }

    let mut failures = Vec::new();
    for handle in handles {
        if let Ok((addr, Err(_))) = handle.await {
            failures.push(addr);
        }
    }
    failures
}
