//! Channel entity: one numbered logical substream over the transport.
//!
//! A channel is created by the engine and identified by an odd positive
//! integer. It delivers channel-scoped messages to listeners, enforces
//! that payload sends only happen while open, and exposes its status
//! transitions. Channels hold only an injected send function; the
//! engine drives their lifecycle.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use weft_protocol::{WireMessage, build_channel_cancel, build_error};

use crate::error::ClientError;
use crate::listeners::{ListenerId, ListenerSet};

/// Lifecycle status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Open requested, not yet confirmed by the server.
    Requested,
    /// Confirmed open; payload messages may flow.
    Opened,
    /// Closed. Final: a closed channel is never reopened.
    Closed,
}

pub(crate) type SendFn = Arc<dyn Fn(WireMessage) -> Result<(), ClientError> + Send + Sync>;
type MessageListener = dyn Fn(&WireMessage) + Send + Sync;
type StatusListener = dyn Fn(ChannelStatus, ChannelStatus) + Send + Sync;
type ErrorListener = dyn Fn(&ClientError) + Send + Sync;

/// Handle to one logical channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u64,
    service: String,
    parameters: Map<String, Value>,
    status: Mutex<ChannelStatus>,
    message_listeners: ListenerSet<MessageListener>,
    status_listeners: ListenerSet<StatusListener>,
    error_listeners: ListenerSet<ErrorListener>,
    outbound: SendFn,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("service", &self.inner.service)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(
        id: u64,
        service: String,
        parameters: Map<String, Value>,
        outbound: SendFn,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                service,
                parameters,
                status: Mutex::new(ChannelStatus::Requested),
                message_listeners: ListenerSet::new(),
                status_listeners: ListenerSet::new(),
                error_listeners: ListenerSet::new(),
                outbound,
            }),
        }
    }

    /// Channel id; odd, unique within the engine's lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Service this channel was opened for.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Parameters the channel was opened with.
    #[must_use]
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.inner.parameters
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.lock().expect("channel status poisoned")
    }

    /// Send a payload message on this channel.
    ///
    /// The message's channel number is overwritten with this channel's
    /// id before it goes out.
    ///
    /// # Errors
    ///
    /// [`ClientError::ChannelNotReady`] unless the status is
    /// [`ChannelStatus::Opened`]; transport errors pass through.
    pub fn send(&self, mut message: WireMessage) -> Result<(), ClientError> {
        if self.status() != ChannelStatus::Opened {
            return Err(ClientError::ChannelNotReady { id: self.inner.id });
        }
        message.channel = self.inner.id;
        (self.inner.outbound)(message)
    }

    /// Report a channel-scoped error to the server.
    ///
    /// # Errors
    ///
    /// [`ClientError::ChannelNotReady`] if the channel is closed;
    /// transport errors pass through.
    pub fn error(&self, kind: &str, message: &str) -> Result<(), ClientError> {
        if self.status() == ChannelStatus::Closed {
            return Err(ClientError::ChannelNotReady { id: self.inner.id });
        }
        (self.inner.outbound)(build_error(self.inner.id, kind, message))
    }

    /// Close the channel: sends `CHANNEL_CANCEL`, clears the listener
    /// sets and makes the status terminal. Repeated calls are no-ops.
    pub fn close(&self) {
        {
            let mut status = self.inner.status.lock().expect("channel status poisoned");
            if *status == ChannelStatus::Closed {
                return;
            }
            *status = ChannelStatus::Closed;
        }
        debug!(id = self.inner.id, "closing channel");
        if let Err(e) = (self.inner.outbound)(build_channel_cancel(self.inner.id)) {
            debug!(id = self.inner.id, error = %e, "CHANNEL_CANCEL not sent");
        }
        self.clear_listeners();
    }

    // ── Engine-facing ────────────────────────────────────────

    pub(crate) fn process_status_opened(&self) {
        self.transition(ChannelStatus::Opened);
    }

    pub(crate) fn process_status_requested(&self) {
        self.transition(ChannelStatus::Requested);
    }

    pub(crate) fn process_status_closed(&self) {
        self.transition(ChannelStatus::Closed);
        self.clear_listeners();
    }

    pub(crate) fn process_payload_message(&self, message: &WireMessage) {
        self.inner.message_listeners.notify(|l| l(message));
    }

    pub(crate) fn process_error(&self, error: &ClientError) {
        if self.inner.error_listeners.is_empty() {
            warn!(id = self.inner.id, error = %error, "channel error with no listeners");
        } else {
            self.inner.error_listeners.notify(|l| l(error));
        }
    }

    /// Apply a status transition. Same-status transitions are
    /// suppressed and `Closed` is terminal.
    fn transition(&self, next: ChannelStatus) {
        let previous = {
            let mut status = self.inner.status.lock().expect("channel status poisoned");
            let previous = *status;
            if previous == next || previous == ChannelStatus::Closed {
                return;
            }
            *status = next;
            previous
        };
        self.inner.status_listeners.notify(|l| l(next, previous));
    }

    fn clear_listeners(&self) {
        self.inner.message_listeners.clear();
        self.inner.status_listeners.clear();
        self.inner.error_listeners.clear();
    }

    // ── Listener registration ────────────────────────────────

    /// Register a payload-message listener.
    pub fn add_message_listener(
        &self,
        listener: impl Fn(&WireMessage) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.message_listeners.add(Arc::new(listener))
    }

    /// Remove a payload-message listener.
    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.inner.message_listeners.remove(id)
    }

    /// Register a status listener receiving `(new, previous)`.
    pub fn add_status_listener(
        &self,
        listener: impl Fn(ChannelStatus, ChannelStatus) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.status_listeners.add(Arc::new(listener))
    }

    /// Remove a status listener.
    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.inner.status_listeners.remove(id)
    }

    /// Register an error listener.
    pub fn add_error_listener(
        &self,
        listener: impl Fn(&ClientError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.error_listeners.add(Arc::new(listener))
    }

    /// Remove an error listener.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.error_listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::msg;

    fn recording_channel(id: u64) -> (Channel, Arc<Mutex<Vec<WireMessage>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let outbound: SendFn = Arc::new(move |message| {
            log.lock().unwrap().push(message);
            Ok(())
        });
        let channel = Channel::new(id, "FEED".to_owned(), Map::new(), outbound);
        (channel, sent)
    }

    #[test]
    fn send_requires_opened_status() {
        let (channel, sent) = recording_channel(1);
        assert_eq!(channel.status(), ChannelStatus::Requested);

        let result = channel.send(WireMessage::new("FEED_SUBSCRIPTION", 0));
        assert!(matches!(result, Err(ClientError::ChannelNotReady { id: 1 })));
        assert!(sent.lock().unwrap().is_empty());

        channel.process_status_opened();
        channel
            .send(WireMessage::new("FEED_SUBSCRIPTION", 0))
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "FEED_SUBSCRIPTION");
        assert_eq!(sent[0].channel, 1, "channel id is stamped onto the message");
    }

    #[test]
    fn close_sends_cancel_once_and_is_idempotent() {
        let (channel, sent) = recording_channel(3);
        channel.process_status_opened();

        channel.close();
        channel.close();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, msg::CHANNEL_CANCEL);
        assert_eq!(sent[0].channel, 3);
        assert_eq!(channel.status(), ChannelStatus::Closed);
    }

    #[test]
    fn send_after_close_fails() {
        let (channel, _sent) = recording_channel(1);
        channel.process_status_opened();
        channel.close();

        let result = channel.send(WireMessage::new("FEED_SUBSCRIPTION", 0));
        assert!(matches!(result, Err(ClientError::ChannelNotReady { .. })));
    }

    #[test]
    fn error_sends_channel_scoped_error() {
        let (channel, sent) = recording_channel(5);
        channel.error("BAD_DATA", "unparseable").unwrap();

        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent[0].kind, msg::ERROR);
            assert_eq!(sent[0].channel, 5);
            assert_eq!(sent[0].field("error"), Some(&Value::from("BAD_DATA")));
        }

        channel.close();
        assert!(channel.error("BAD_DATA", "again").is_err());
    }

    #[test]
    fn status_listeners_get_new_and_previous() {
        let (channel, _sent) = recording_channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        channel.add_status_listener(move |next, previous| {
            log.lock().unwrap().push((next, previous));
        });

        channel.process_status_opened();
        // Same-status transition is suppressed.
        channel.process_status_opened();
        channel.process_status_requested();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (ChannelStatus::Opened, ChannelStatus::Requested),
                (ChannelStatus::Requested, ChannelStatus::Opened),
            ]
        );
    }

    #[test]
    fn closed_is_terminal() {
        let (channel, _sent) = recording_channel(1);
        channel.process_status_closed();
        channel.process_status_opened();
        assert_eq!(channel.status(), ChannelStatus::Closed);
    }

    #[test]
    fn remote_close_notifies_then_clears_listeners() {
        let (channel, _sent) = recording_channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        channel.add_status_listener(move |next, _| {
            log.lock().unwrap().push(next);
        });

        let payloads = Arc::new(Mutex::new(Vec::new()));
        let payload_log = Arc::clone(&payloads);
        channel.add_message_listener(move |message| {
            payload_log.lock().unwrap().push(message.kind.clone());
        });

        channel.process_status_closed();
        assert_eq!(*seen.lock().unwrap(), vec![ChannelStatus::Closed]);

        // Listener sets are cleared: a late payload message fans out to
        // nothing.
        channel.process_payload_message(&WireMessage::new("FEED_DATA", 1));
        assert!(payloads.lock().unwrap().is_empty());
    }

    #[test]
    fn local_close_does_not_notify_own_listeners() {
        let (channel, _sent) = recording_channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        channel.add_status_listener(move |next, _| {
            log.lock().unwrap().push(next);
        });

        channel.close();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn payload_fanout_isolates_panicking_listener() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (channel, _sent) = recording_channel(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&counter);

        channel.add_message_listener(|_| panic!("bad listener"));
        channel.add_message_listener(move |message| {
            assert_eq!(message.kind, "FEED_DATA");
            count.fetch_add(1, Ordering::SeqCst);
        });

        channel.process_payload_message(&WireMessage::new("FEED_DATA", 1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_fanout_reaches_listeners() {
        let (channel, _sent) = recording_channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        channel.add_error_listener(move |error| {
            log.lock().unwrap().push(error.to_string());
        });

        channel.process_error(&ClientError::Server {
            kind: "UNKNOWN_SERVICE".into(),
            message: "no such service".into(),
        });
        assert_eq!(seen.lock().unwrap().len(), 1);

        // With no listeners it only logs; must not panic.
        let (bare, _sent) = recording_channel(3);
        bare.process_error(&ClientError::NotConnected);
    }
}
