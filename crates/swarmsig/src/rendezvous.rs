//! Tracker rendezvous session
//!
//! [`WsRelayTransport`] is the WebSocket implementation of [`RelayTransport`].
//! [`RendezvousSession`] wraps any relay transport for the lifetime of one
//! swarm session: it encodes announces, exposes inbound frames as a lazy
//! stream, and makes sure the connection is released however the session ends.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{encode_request, AnnounceRequest};
use crate::transport::{EventTx, InboundEvent, RelayTransport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tracker connection over a WebSocket
///
/// Reader and writer halves are locked separately so the pump task can wait
/// for frames while announces are being sent.
pub struct WsRelayTransport {
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    connected: AtomicBool,
}

impl WsRelayTransport {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }
}

impl Default for WsRelayTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayTransport for WsRelayTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        info!("Connecting to tracker: {}", url);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", url, e)))?;
        let (write, read) = ws_stream.split();
        *self.writer.lock().await = Some(write);
        *self.reader.lock().await = Some(read);
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to tracker: {}", url);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut write) = self.writer.lock().await.take() {
            if let Err(e) = write.send(Message::Close(None)).await {
                debug!("Close frame not sent: {}", e);
            }
            let _ = write.close().await;
        }
        // The pump may be parked in recv(); it sees the close frame or a dropped stream.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let write = guard.as_mut().ok_or(TransportError::NotConnected)?;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Result<String, TransportError>> {
        let mut guard = self.reader.lock().await;
        loop {
            let frame = guard.as_mut()?.next().await;
            match frame {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame from tracker"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("Tracker sent close: {:?}", frame);
                    guard.take();
                    self.connected.store(false, Ordering::SeqCst);
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    guard.take();
                    self.connected.store(false, Ordering::SeqCst);
                    return Some(Err(TransportError::ReceiveFailed(e.to_string())));
                }
                None => {
                    guard.take();
                    self.connected.store(false, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// One open connection to the tracker
///
/// Not restartable: once the inbound stream ends, open a new session.
/// Dropping an open session still disconnects the relay (on the current
/// tokio runtime), so a cancelled run never leaks the socket.
pub struct RendezvousSession<R: RelayTransport + 'static> {
    relay: Arc<R>,
    url: String,
    open: AtomicBool,
}

impl<R: RelayTransport + 'static> RendezvousSession<R> {
    pub async fn open(relay: Arc<R>, url: &str) -> Result<Self, TransportError> {
        relay.connect(url).await?;
        Ok(Self {
            relay,
            url: url.to_string(),
            open: AtomicBool::new(true),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.relay.is_connected()
    }

    /// Encode and send one announce. Sends are serialized by the transport.
    pub async fn send(&self, request: &AnnounceRequest) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let text = encode_request(request).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.relay.send(text).await?;
        debug!(
            "Sent {} announce with {} offer(s) to {}",
            request.event,
            request.offers.len(),
            self.url
        );
        Ok(())
    }

    /// Lazy stream of inbound frames. Ends when the connection closes;
    /// a read error is yielded once as the final item.
    pub fn incoming(&self) -> impl Stream<Item = Result<String, TransportError>> + Send + 'static {
        futures::stream::unfold(Some(self.relay.clone()), |relay| async move {
            let relay = relay?;
            match relay.recv().await {
                Some(Ok(text)) => Some((Ok(text), Some(relay))),
                Some(Err(e)) => Some((Err(e), None)),
                None => None,
            }
        })
    }

    /// Forward [`Self::incoming`] into the dispatcher's event channel
    pub fn spawn_pump(&self, events: EventTx) -> JoinHandle<()> {
        let incoming = self.incoming();
        tokio::spawn(async move {
            futures::pin_mut!(incoming);
            while let Some(frame) = incoming.next().await {
                match frame {
                    Ok(text) => {
                        if events.send(InboundEvent::Relay(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(InboundEvent::RelayError(e)).await;
                        return;
                    }
                }
            }
            let _ = events.send(InboundEvent::RelayClosed).await;
        })
    }

    pub async fn close(self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.relay.disconnect().await;
            info!("Closed tracker connection: {}", self.url);
        }
    }
}

impl<R: RelayTransport + 'static> Drop for RendezvousSession<R> {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let relay = self.relay.clone();
                handle.spawn(async move { relay.disconnect().await });
            }
        }
    }
}
