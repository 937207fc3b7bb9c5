//! Transport boundary.
//!
//! The manager never touches sockets directly. It asks a [`Connector`] to
//! open a [`Transport`] for a URL and receives that transport's lifecycle
//! through an [`EventSink`]:
//!
//! ```text
//!   ConnectionManager ──open(url, sink)──► Connector
//!          ▲                                   │
//!          │ TransportEvent                    ▼
//!          └──────────── EventSink ◄──── Transport (socket task)
//! ```
//!
//! Two connectors ship with the crate:
//!
//! - [`websocket::WsConnector`] - real WebSockets over `tokio-tungstenite`
//! - [`memory::MemoryConnector`] - in-process transport driven by hand,
//!   for tests and embedders that bridge their own socket layer

pub mod memory;
pub mod websocket;

use std::fmt;
use std::sync::{Arc, Weak};

/// Observable state of a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting,
    /// Frames can be sent.
    Open,
    /// Close requested, not yet finished.
    Closing,
    /// Closed, or never existed.
    #[default]
    Closed,
}

impl ReadyState {
    /// Numeric code, matching the browser `WebSocket.readyState` values.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    /// Inverse of [`Self::as_u8`]; unknown codes map to `Closed`.
    #[must_use]
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Lifecycle notification from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed.
    Open,
    /// Inbound text frame.
    Message(String),
    /// Transport-level error. Does not by itself end the connection.
    Error(String),
    /// Transport closed; no further events follow.
    Close {
        /// Intentional closure (local close or normal close frame).
        clean: bool,
    },
}

/// A live connection handle owned by one connection record.
pub trait Transport: Send {
    /// Write one serialized frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying socket is gone.
    fn send(&self, frame: String) -> anyhow::Result<()>;

    /// Begin closing. Must not emit events synchronously.
    fn close(&mut self);

    /// Current state.
    fn state(&self) -> ReadyState;
}

/// Opens transports.
///
/// Implementations must not emit events through `events` from inside
/// `open` itself; the first event has to arrive later.
pub trait Connector: Send + Sync {
    /// Start opening `url`; lifecycle is reported through `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be started at all (for
    /// example, no async runtime to drive it). No events follow an error.
    fn open(&self, url: &str, events: EventSink) -> anyhow::Result<Box<dyn Transport>>;
}

/// Receiver of transport events, implemented by the connection manager.
pub trait EventHandler: Send + Sync {
    /// Handle `event` from transport `transport_id` of `endpoint`.
    fn handle_transport_event(&self, endpoint: &str, transport_id: u64, event: TransportEvent);
}

/// Routes one transport's events back to whoever opened it.
///
/// Holds the handler weakly: events arriving after the manager is gone
/// are dropped.
#[derive(Clone)]
pub struct EventSink {
    handler: Weak<dyn EventHandler>,
    endpoint: Arc<str>,
    transport_id: u64,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("endpoint", &self.endpoint)
            .field("transport_id", &self.transport_id)
            .finish_non_exhaustive()
    }
}

impl EventSink {
    /// Create a sink tagged with the endpoint and transport id it reports for.
    #[must_use]
    pub fn new(handler: Weak<dyn EventHandler>, endpoint: &str, transport_id: u64) -> Self {
        Self {
            handler,
            endpoint: Arc::from(endpoint),
            transport_id,
        }
    }

    /// Deliver `event` to the handler, if it still exists.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(handler) = self.handler.upgrade() {
            handler.handle_transport_event(&self.endpoint, self.transport_id, event);
        } else {
            log::trace!("[Mux] Dropping event for {}: manager gone", self.endpoint);
        }
    }

    /// Endpoint this sink reports for.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Transport id this sink reports for.
    #[must_use]
    pub fn transport_id(&self) -> u64 {
        self.transport_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, u64, TransportEvent)>>,
    }

    impl EventHandler for Recorder {
        fn handle_transport_event(&self, endpoint: &str, transport_id: u64, event: TransportEvent) {
            self.events
                .lock()
                .unwrap()
                .push((endpoint.to_string(), transport_id, event));
        }
    }

    #[test]
    fn test_ready_state_codes_round_trip() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Open,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            assert_eq!(ReadyState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ReadyState::from_u8(200), ReadyState::Closed);
        assert_eq!(ReadyState::default(), ReadyState::Closed);
    }

    #[test]
    fn test_sink_tags_events() {
        let recorder = Arc::new(Recorder::default());
        let recorder_clone: Arc<Recorder> = Arc::clone(&recorder);
        let handler: Arc<dyn EventHandler> = recorder_clone;
        let sink = EventSink::new(Arc::downgrade(&handler), "/ws/jobs", 9);

        sink.emit(TransportEvent::Open);

        let events = recorder.events.lock().unwrap();
        assert_eq!(*events, vec![("/ws/jobs".to_string(), 9, TransportEvent::Open)]);
    }

    #[test]
    fn test_sink_drops_events_after_handler_is_gone() {
        let handler: Arc<dyn EventHandler> = Arc::new(Recorder::default());
        let sink = EventSink::new(Arc::downgrade(&handler), "/ws/jobs", 1);
        drop(handler);

        sink.emit(TransportEvent::Close { clean: false });
        assert_eq!(sink.endpoint(), "/ws/jobs");
        assert_eq!(sink.transport_id(), 1);
    }
}
