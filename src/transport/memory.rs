//! In-process transport.
//!
//! [`MemoryConnector`] records every `open` and hands back a
//! [`MemoryRemote`] per transport, which plays the server side: it drives
//! the lifecycle (`open`, `deliver`, `close_unclean`, ...) and captures the
//! frames the manager wrote.
//!
//! Events are emitted only when the remote is driven, never from inside
//! [`Connector::open`] or [`Transport::close`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use super::{Connector, EventSink, ReadyState, Transport, TransportEvent};

/// Connector producing [`MemoryTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    opened: Arc<Mutex<Vec<MemoryRemote>>>,
}

impl MemoryConnector {
    /// Create a connector with no transports yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    /// Remote side of the `index`-th opened transport.
    #[must_use]
    pub fn remote(&self, index: usize) -> Option<MemoryRemote> {
        self.lock().get(index).cloned()
    }

    /// Remote side of the most recently opened transport.
    #[must_use]
    pub fn last(&self) -> Option<MemoryRemote> {
        self.lock().last().cloned()
    }

    /// Remotes of every transport opened for `url`, oldest first.
    #[must_use]
    pub fn remotes_for(&self, url: &str) -> Vec<MemoryRemote> {
        self.lock()
            .iter()
            .filter(|remote| remote.url() == url)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MemoryRemote>> {
        self.opened
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Connector for MemoryConnector {
    fn open(&self, url: &str, events: EventSink) -> anyhow::Result<Box<dyn Transport>> {
        let shared = Arc::new(Shared {
            url: url.to_string(),
            state: AtomicU8::new(ReadyState::Connecting.as_u8()),
            sent: Mutex::new(Vec::new()),
            closed_locally: AtomicBool::new(false),
            events,
        });
        self.lock().push(MemoryRemote {
            shared: Arc::clone(&shared),
        });
        Ok(Box::new(MemoryTransport { shared }))
    }
}

#[derive(Debug)]
struct Shared {
    url: String,
    state: AtomicU8,
    sent: Mutex<Vec<String>>,
    closed_locally: AtomicBool,
    events: EventSink,
}

impl Shared {
    fn state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ReadyState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Client half handed to the manager.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Transport for MemoryTransport {
    fn send(&self, frame: String) -> anyhow::Result<()> {
        if self.shared.state() != ReadyState::Open {
            anyhow::bail!("memory transport is {}", self.shared.state());
        }
        self.shared
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(frame);
        Ok(())
    }

    fn close(&mut self) {
        self.shared.closed_locally.store(true, Ordering::SeqCst);
        self.shared.set_state(ReadyState::Closed);
    }

    fn state(&self) -> ReadyState {
        self.shared.state()
    }
}

/// Server half of one [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl MemoryRemote {
    /// URL the transport was opened for.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Current transport state.
    #[must_use]
    pub fn state(&self) -> ReadyState {
        self.shared.state()
    }

    /// Whether the manager closed this transport.
    #[must_use]
    pub fn closed_by_client(&self) -> bool {
        self.shared.closed_locally.load(Ordering::SeqCst)
    }

    /// Frames the manager wrote, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.shared
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Complete the handshake.
    pub fn open(&self) {
        self.shared.set_state(ReadyState::Open);
        self.shared.events.emit(TransportEvent::Open);
    }

    /// Push an inbound frame.
    pub fn deliver(&self, frame: &str) {
        self.shared
            .events
            .emit(TransportEvent::Message(frame.to_string()));
    }

    /// Push an inbound JSON value as a frame.
    pub fn deliver_json(&self, value: &serde_json::Value) {
        self.deliver(&value.to_string());
    }

    /// Report a transport error without closing.
    pub fn fail(&self, error: &str) {
        self.shared
            .events
            .emit(TransportEvent::Error(error.to_string()));
    }

    /// Close intentionally from the server side.
    pub fn close_clean(&self) {
        self.close_with(true);
    }

    /// Drop the connection unexpectedly.
    pub fn close_unclean(&self) {
        self.close_with(false);
    }

    fn close_with(&self, clean: bool) {
        self.shared.set_state(ReadyState::Closed);
        self.shared.events.emit(TransportEvent::Close { clean });
    }
}
