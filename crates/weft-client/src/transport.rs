//! Transport abstraction and the shipped WebSocket transport.
//!
//! A transport carries [`WireMessage`]s over one full-duplex connection
//! and reports its lifecycle through [`TransportEvent`]s delivered in
//! order to the engine. Transports never retry at the protocol level;
//! protocol-level reconnection is the engine's job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use weft_protocol::WireMessage;

use crate::error::ClientError;

/// Event delivered by a transport to the engine, in receive order.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport is open and ready to carry messages.
    Opened,
    /// A decoded inbound message.
    Message(WireMessage),
    /// The transport closed. Carries the socket error that killed it;
    /// `None` for a clean close.
    Closed(Option<Box<tokio_tungstenite::tungstenite::Error>>),
}

/// A frame-oriented transport carrying wire messages.
///
/// `start` is fire-and-forget: the connection attempt runs in the
/// background and the outcome arrives as an [`TransportEvent::Opened`]
/// or [`TransportEvent::Closed`] event. `send` enqueues without
/// blocking; queued messages are flushed once the connection is up.
pub trait Transport: Send + Sync {
    /// The URL this transport was created for.
    fn url(&self) -> &str;

    /// Begin connecting; events arrive asynchronously.
    fn start(&self);

    /// Tear the transport down. Late events from a stopped transport
    /// may still be in flight; the engine discards them.
    fn stop(&self);

    /// Enqueue a message for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if the transport can no
    /// longer accept messages.
    fn send(&self, message: WireMessage) -> Result<(), ClientError>;
}

/// Creates transports bound to the engine's event queue.
pub trait TransportFactory: Send + Sync {
    /// Create a transport for `url` delivering events to `events`.
    fn create(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Transport>;
}

// ── WebSocket transport ──────────────────────────────────────

/// WebSocket transport over tokio-tungstenite.
///
/// Messages are JSON-encoded text frames. Ping/pong is left to
/// tungstenite; binary frames are ignored.
pub struct WebSocketTransport {
    url: String,
    outbound_tx: mpsc::UnboundedSender<WireMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<WireMessage>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Create a transport for `url`. Nothing happens until
    /// [`Transport::start`].
    #[must_use]
    pub fn new(url: String, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            url,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events,
            task: Mutex::new(None),
        }
    }

    /// Connection task: connect, then pump both directions until the
    /// socket dies or the transport is dropped.
    async fn run(
        url: String,
        events: mpsc::UnboundedSender<TransportEvent>,
        mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let (ws, _response) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(url = %url, error = %e, "WebSocket connect failed");
                let _ = events.send(TransportEvent::Closed(Some(Box::new(e))));
                return;
            }
        };

        debug!(url = %url, "WebSocket open");
        if events.send(TransportEvent::Opened).is_err() {
            return;
        }

        let (mut writer, mut reader) = ws.split();

        let failure = loop {
            tokio::select! {
                outgoing = outbound.recv() => {
                    // The sender half lives in the transport; `None`
                    // means the transport itself was dropped.
                    let Some(message) = outgoing else { break None };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = writer.send(Message::Text(json)).await {
                        debug!(error = %e, "WebSocket send failed");
                        break Some(e);
                    }
                }

                incoming = reader.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<WireMessage>(&text) {
                                Ok(message) => {
                                    trace!(
                                        kind = %message.kind,
                                        channel = message.channel,
                                        "inbound message"
                                    );
                                    if events.send(TransportEvent::Message(message)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "failed to parse inbound message");
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "WebSocket closed by server");
                            break None;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read error");
                            break Some(e);
                        }
                        None => {
                            debug!("WebSocket stream ended");
                            break None;
                        }
                    }
                }
            }
        };

        let _ = events.send(TransportEvent::Closed(failure.map(Box::new)));
    }
}

impl Transport for WebSocketTransport {
    fn url(&self) -> &str {
        &self.url
    }

    fn start(&self) {
        let receiver = self
            .outbound_rx
            .lock()
            .expect("transport lock poisoned")
            .take();
        let Some(outbound) = receiver else {
            warn!(url = %self.url, "transport already started");
            return;
        };

        let handle = tokio::spawn(Self::run(
            self.url.clone(),
            self.events.clone(),
            outbound,
        ));
        *self.task.lock().expect("transport lock poisoned") = Some(handle);
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().expect("transport lock poisoned").take() {
            task.abort();
        }
    }

    fn send(&self, message: WireMessage) -> Result<(), ClientError> {
        self.outbound_tx
            .send(message)
            .map_err(|_| ClientError::NotConnected)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Factory producing [`WebSocketTransport`]s; the default for
/// [`crate::WeftClient::new`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl TransportFactory for WebSocketFactory {
    fn create(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(url.to_owned(), events))
    }
}

// ── Loopback transport ───────────────────────────────────────

/// Handle to drive and observe a [`LoopbackTransport`] from tests.
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<WireMessage>>>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LoopbackHandle {
    /// URL the transport was created for.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver the open event to the engine.
    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Opened);
    }

    /// Deliver an inbound message to the engine.
    pub fn deliver(&self, message: WireMessage) {
        let _ = self.events.send(TransportEvent::Message(message));
    }

    /// Deliver a clean close to the engine.
    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed(None));
    }

    /// Deliver a failing close to the engine.
    pub fn fail(&self, error: tokio_tungstenite::tungstenite::Error) {
        let _ = self
            .events
            .send(TransportEvent::Closed(Some(Box::new(error))));
    }

    /// Everything the engine has sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().expect("loopback lock poisoned").clone()
    }

    /// Drain and return the sent messages.
    pub fn take_sent(&self) -> Vec<WireMessage> {
        std::mem::take(&mut *self.sent.lock().expect("loopback lock poisoned"))
    }

    /// Whether `start` was called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether `stop` was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// In-memory transport useful for unit tests and examples.
///
/// Nothing crosses a network: sent messages are recorded on the
/// [`LoopbackHandle`] and inbound traffic is injected through it.
#[derive(Debug)]
pub struct LoopbackTransport {
    handle: LoopbackHandle,
}

impl Transport for LoopbackTransport {
    fn url(&self) -> &str {
        &self.handle.url
    }

    fn start(&self) {
        self.handle.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.handle.stopped.store(true, Ordering::SeqCst);
    }

    fn send(&self, message: WireMessage) -> Result<(), ClientError> {
        if self.handle.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        self.handle
            .sent
            .lock()
            .expect("loopback lock poisoned")
            .push(message);
        Ok(())
    }
}

/// Factory producing [`LoopbackTransport`]s and retaining a
/// [`LoopbackHandle`] for each, newest last.
#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory {
    created: Arc<Mutex<Vec<LoopbackHandle>>>,
}

impl LoopbackFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles for every transport created so far.
    #[must_use]
    pub fn handles(&self) -> Vec<LoopbackHandle> {
        self.created.lock().expect("loopback lock poisoned").clone()
    }

    /// Handle for the most recently created transport.
    #[must_use]
    pub fn last(&self) -> Option<LoopbackHandle> {
        self.created
            .lock()
            .expect("loopback lock poisoned")
            .last()
            .cloned()
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Transport> {
        let handle = LoopbackHandle {
            url: url.to_owned(),
            events,
            sent: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        self.created
            .lock()
            .expect("loopback lock poisoned")
            .push(handle.clone());
        Box::new(LoopbackTransport { handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::build_keepalive;

    #[tokio::test]
    async fn loopback_records_sends_and_injects_events() {
        let factory = LoopbackFactory::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = factory.create("wss://loop.test", events_tx);
        let handle = factory.last().unwrap();

        transport.start();
        assert!(handle.is_started());

        transport.send(build_keepalive()).unwrap();
        assert_eq!(handle.sent().len(), 1);

        handle.open();
        handle.close();
        handle.fail(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(matches!(events_rx.recv().await, Some(TransportEvent::Opened)));
        assert!(matches!(
            events_rx.recv().await,
            Some(TransportEvent::Closed(None))
        ));
        assert!(matches!(
            events_rx.recv().await,
            Some(TransportEvent::Closed(Some(_)))
        ));
    }

    #[tokio::test]
    async fn loopback_rejects_sends_after_stop() {
        let factory = LoopbackFactory::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = factory.create("wss://loop.test", events_tx);

        transport.stop();
        let result = transport.send(build_keepalive());
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn websocket_connect_failure_emits_closed() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport =
            WebSocketTransport::new("ws://127.0.0.1:1/unreachable".to_owned(), events_tx);

        transport.start();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
            .await
            .expect("connect failure should surface quickly");
        assert!(
            matches!(event, Some(TransportEvent::Closed(Some(_)))),
            "connect failure carries the socket error"
        );
    }

    #[test]
    fn websocket_send_queues_before_start() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new("ws://127.0.0.1:1/x".to_owned(), events_tx);
        assert!(transport.send(build_keepalive()).is_ok());
        assert_eq!(transport.url(), "ws://127.0.0.1:1/x");
    }
}
