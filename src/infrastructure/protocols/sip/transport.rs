//! SIP transport layer - datagram send/receive for the user agent

use super::message::{SipError, SipMessage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Transport layer trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Hand over the stream of parsed inbound messages. Only the first call
    /// gets the receiver; it closes when the transport fails or is closed.
    fn take_receiver(&self) -> Option<mpsc::Receiver<IncomingMessage>>;

    /// Address the far end should reach us on
    fn local_addr(&self) -> SocketAddr;

    /// Stop receiving and release the socket
    async fn close(&self) -> Result<(), SipError>;
}

/// Datagrams that only carry CRLF keepalives
fn is_keepalive(data: &[u8]) -> bool {
    data.iter().all(|b| matches!(b, b'\r' | b'\n' | b' ' | b'\t'))
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind `bind_addr` and connect to `server` so the local interface address is known
    pub async fn bind(bind_addr: SocketAddr, server: SocketAddr) -> Result<Self, SipError> {
        info!("Starting UDP transport on {}", bind_addr);

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        socket
            .connect(server)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to connect UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;

        info!("UDP transport listening on {} (server {})", local_addr, server);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1000);
        let receive_task = tokio::spawn(Self::receive_loop(socket.clone(), tx));

        Ok(Self {
            socket,
            local_addr,
            rx: Mutex::new(Some(rx)),
            receive_task: Mutex::new(Some(receive_task)),
        })
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    if is_keepalive(&buf[..size]) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if tx.send(IncomingMessage { message, source }).await.is_err() {
                                debug!("Receiver dropped, stopping UDP receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.lock().take()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> Result<(), SipError> {
        info!("Stopping UDP transport");
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

/// In-memory transport. The agent holds the `ChannelTransport`; the
/// `ChannelPeer` plays the server side.
pub struct ChannelTransport {
    local_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<OutgoingMessage>,
    rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
}

/// Server side of a `ChannelTransport`
pub struct ChannelPeer {
    addr: SocketAddr,
    outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
    incoming: Option<mpsc::Sender<IncomingMessage>>,
}

impl ChannelTransport {
    pub fn pair(local_addr: SocketAddr, peer_addr: SocketAddr) -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(1000);
        (
            Self {
                local_addr,
                outgoing: out_tx,
                rx: Mutex::new(Some(in_rx)),
            },
            ChannelPeer {
                addr: peer_addr,
                outgoing: out_rx,
                incoming: Some(in_tx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        self.outgoing
            .send(message)
            .map_err(|_| SipError::TransportError("channel peer is gone".to_string()))
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.lock().take()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> Result<(), SipError> {
        Ok(())
    }
}

impl ChannelPeer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next raw datagram the agent sent
    pub async fn recv_raw(&mut self) -> Option<OutgoingMessage> {
        self.outgoing.recv().await
    }

    /// Next SIP message the agent sent, skipping CRLF keepalives
    pub async fn recv(&mut self) -> Option<SipMessage> {
        loop {
            let outgoing = self.outgoing.recv().await?;
            if is_keepalive(&outgoing.data) {
                continue;
            }
            match SipMessage::parse(&outgoing.data) {
                Ok(message) => return Some(message),
                Err(e) => warn!("Agent sent an unparseable datagram: {}", e),
            }
        }
    }

    /// Whether the agent has sent something not yet read
    pub fn try_recv(&mut self) -> Option<OutgoingMessage> {
        self.outgoing.try_recv().ok()
    }

    /// Deliver `text` to the agent as if it arrived from the server
    pub async fn send(&self, text: &str) -> Result<(), SipError> {
        let message = SipMessage::parse(text.as_bytes())?;
        let incoming = self
            .incoming
            .as_ref()
            .ok_or_else(|| SipError::TransportError("peer closed".to_string()))?;
        incoming
            .send(IncomingMessage {
                message,
                source: self.addr,
            })
            .await
            .map_err(|_| SipError::TransportError("agent receiver is gone".to_string()))
    }

    /// Close the receive side, as if the socket failed
    pub fn close_incoming(&mut self) {
        self.incoming = None;
    }
}
