//! Connection registry: one shared transport per endpoint.
//!
//! [`ConnectionManager`] multiplexes any number of listeners over a single
//! transport per endpoint. Each listener gets a [`Subscription`]; the
//! transport lives exactly as long as at least one subscription is active.
//!
//! # Architecture
//!
//! ```text
//!   listener A ──subscribe("/ws/jobs")──┐
//!   listener B ──subscribe("/ws/jobs")──┼──► ConnectionRecord ──► Transport
//!                                       │      (listeners, retry)     │
//!   listener C ──subscribe("/ws/logs")──┼──► ConnectionRecord ──► Transport
//!                                       │                             │
//!                                       └──◄── TransportEvent ◄───────┘
//! ```
//!
//! Transport events and retry timers are fed through
//! [`crate::state::transition`]; this module only carries out the
//! resulting actions (reset counter, arm timer, reopen, tear down).
//!
//! # Locking
//!
//! All records sit behind one mutex. It is never held while a listener
//! runs, while a transport is closed, or across an `.await`, so listeners
//! may call back into the manager freely.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::message::{self, Message};
use crate::resolver::EndpointResolver;
use crate::state::{self, Action, Event, Phase, RetryContext};
use crate::transport::websocket::WsConnector;
use crate::transport::{Connector, EventHandler, EventSink, ReadyState, Transport, TransportEvent};

/// Callback receiving decoded messages for one endpoint.
///
/// Identity is the allocation behind the listener: clones of the same
/// `Listener` are the same listener, two `Listener::new` calls never are.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&Message) + Send + Sync>);

impl Listener {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    /// Whether `self` and `other` are the same listener.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    fn call(&self, message: &Message) {
        (self.0)(message);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Read-only view of one active endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    /// Endpoint identifier.
    pub endpoint: String,
    /// Resolved transport URL.
    pub url: String,
    /// State of the current transport.
    pub ready_state: ReadyState,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Attached listeners.
    pub listeners: usize,
    /// Retries since the last successful open.
    pub reconnect_attempts: u32,
    /// Whether a retry timer is armed.
    pub retry_pending: bool,
}

/// Armed retry timer.
struct PendingRetry {
    token: u64,
    handle: JoinHandle<()>,
}

/// Per-endpoint shared state.
struct ConnectionRecord {
    url: String,
    transport: Box<dyn Transport>,
    transport_id: u64,
    listeners: Vec<Listener>,
    reconnect_attempts: u32,
    pending_retry: Option<PendingRetry>,
    phase: Phase,
}

impl ConnectionRecord {
    fn status(&self, endpoint: &str) -> EndpointStatus {
        EndpointStatus {
            endpoint: endpoint.to_string(),
            url: self.url.clone(),
            ready_state: self.transport.state(),
            phase: self.phase,
            listeners: self.listeners.len(),
            reconnect_attempts: self.reconnect_attempts,
            retry_pending: self.pending_retry.is_some(),
        }
    }

    /// Cancel the timer and close the transport. Call with the registry
    /// lock released.
    fn dispose(mut self) {
        if let Some(retry) = self.pending_retry.take() {
            retry.handle.abort();
        }
        if matches!(
            self.transport.state(),
            ReadyState::Connecting | ReadyState::Open
        ) {
            self.transport.close();
        }
    }
}

/// Who produced an event; stale producers are ignored.
#[derive(Debug, Clone, Copy)]
enum Source {
    Transport(u64),
    Timer(u64),
}

impl Source {
    fn is_current(self, record: &ConnectionRecord) -> bool {
        match self {
            Self::Transport(id) => record.transport_id == id,
            Self::Timer(token) => record
                .pending_retry
                .as_ref()
                .is_some_and(|retry| retry.token == token),
        }
    }
}

/// Shared interior of [`ConnectionManager`].
struct Registry {
    resolver: EndpointResolver,
    retry: RetryPolicy,
    connector: Box<dyn Connector>,
    records: Mutex<HashMap<String, ConnectionRecord>>,
    next_id: AtomicU64,
    self_ref: Weak<Registry>,
}

impl Registry {
    fn records(&self) -> MutexGuard<'_, HashMap<String, ConnectionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn open_transport(
        &self,
        endpoint: &str,
        url: &str,
    ) -> anyhow::Result<(u64, Box<dyn Transport>)> {
        let transport_id = self.next_id();
        let handler: Weak<dyn EventHandler> = self.self_ref.clone();
        let sink = EventSink::new(handler, endpoint, transport_id);
        log::debug!("[Mux] Opening transport #{} for {} ({})", transport_id, endpoint, url);
        let transport = self.connector.open(url, sink)?;
        Ok((transport_id, transport))
    }

    /// Arm the retry timer, or `None` outside a Tokio runtime.
    fn arm_retry(&self, endpoint: &str, delay: Duration) -> Option<PendingRetry> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("[Mux] Cannot schedule reconnect for {}: {}", endpoint, e);
                return None;
            }
        };

        let token = self.next_id();
        let registry = self.self_ref.clone();
        let endpoint = endpoint.to_string();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                registry.step(&endpoint, Source::Timer(token), Event::RetryElapsed);
            }
        });
        Some(PendingRetry { token, handle })
    }

    /// Feed one lifecycle event into the state machine and carry out the
    /// resulting action.
    fn step(&self, endpoint: &str, source: Source, event: Event) {
        let mut records = self.records();
        let Some(record) = records.get_mut(endpoint) else {
            log::trace!("[Mux] Ignoring {:?} for {}: no record", event, endpoint);
            return;
        };
        if !source.is_current(record) {
            log::trace!("[Mux] Ignoring stale {:?} for {} from {:?}", event, endpoint, source);
            return;
        }

        let ctx = RetryContext {
            attempts: record.reconnect_attempts,
            max_attempts: self.retry.max_attempts,
            has_listeners: !record.listeners.is_empty(),
        };
        let transition = state::transition(record.phase, event, ctx);
        log::trace!(
            "[Mux] {}: {} + {:?} -> {} ({:?})",
            endpoint,
            record.phase,
            event,
            transition.phase,
            transition.action
        );
        record.phase = transition.phase;

        match transition.action {
            Action::None | Action::Ignore => {}
            Action::ResetAttempts => {
                record.reconnect_attempts = 0;
                log::info!("[Mux] Connected to {}", endpoint);
            }
            Action::ScheduleRetry { attempt } => {
                let delay = self.retry.backoff.delay(attempt);
                if let Some(retry) = self.arm_retry(endpoint, delay) {
                    record.reconnect_attempts = attempt;
                    record.pending_retry = Some(retry);
                    log::warn!(
                        "[Mux] {} closed unexpectedly, reconnect {}/{} in {:?}",
                        endpoint,
                        attempt,
                        self.retry.max_attempts,
                        delay
                    );
                } else {
                    record.phase = Phase::ReconnectExhausted;
                    let removed = records.remove(endpoint);
                    drop(records);
                    if let Some(record) = removed {
                        record.dispose();
                    }
                }
            }
            Action::Reconnect => {
                // The firing timer is the pending one; let its task finish.
                record.pending_retry = None;
                let (transport_id, transport) = match self.open_transport(endpoint, &record.url) {
                    Ok(opened) => opened,
                    Err(e) => {
                        log::error!("[Mux] Cannot reconnect {}: {:#}", endpoint, e);
                        record.phase = Phase::ReconnectExhausted;
                        let removed = records.remove(endpoint);
                        drop(records);
                        if let Some(record) = removed {
                            record.dispose();
                        }
                        return;
                    }
                };
                let old = std::mem::replace(&mut record.transport, transport);
                record.transport_id = transport_id;
                log::info!(
                    "[Mux] Reconnecting {} (attempt {}/{})",
                    endpoint,
                    record.reconnect_attempts,
                    self.retry.max_attempts
                );
                drop(records);
                drop(old);
            }
            Action::TearDown => {
                let phase = record.phase;
                let removed = records.remove(endpoint);
                drop(records);
                match phase {
                    Phase::ReconnectExhausted => log::warn!(
                        "[Mux] Giving up on {} after {} reconnect attempts",
                        endpoint,
                        self.retry.max_attempts
                    ),
                    _ => log::info!("[Mux] {} closed cleanly", endpoint),
                }
                if let Some(record) = removed {
                    record.dispose();
                }
            }
        }
    }

    /// Fan one inbound frame out to the endpoint's listeners.
    fn dispatch(&self, endpoint: &str, transport_id: u64, frame: &str) {
        let listeners = {
            let records = self.records();
            match records.get(endpoint) {
                Some(record) if record.transport_id == transport_id => record.listeners.clone(),
                _ => {
                    log::trace!("[Mux] Dropping frame for {}: stale transport", endpoint);
                    return;
                }
            }
        };

        let message = match message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "[Mux] Dropping malformed frame on {}: {} ({})",
                    endpoint,
                    e,
                    preview(frame, 100)
                );
                return;
            }
        };
        log::trace!("[Mux] {} <- {:?}", endpoint, message.kind());

        for listener in &listeners {
            // A listener may have been removed by one that ran before it.
            if !self.is_attached(endpoint, listener) {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener.call(&message)))
            {
                log::error!(
                    "[Mux] Listener on {} panicked: {}",
                    endpoint,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn is_attached(&self, endpoint: &str, listener: &Listener) -> bool {
        self.records()
            .get(endpoint)
            .is_some_and(|record| record.listeners.iter().any(|l| l.same_as(listener)))
    }

    fn remove_listener(&self, endpoint: &str, listener: &Listener) {
        let removed = {
            let mut records = self.records();
            let Some(record) = records.get_mut(endpoint) else {
                return;
            };
            record.listeners.retain(|l| !l.same_as(listener));
            log::debug!(
                "[Mux] Listener left {} ({} remaining)",
                endpoint,
                record.listeners.len()
            );
            if record.listeners.is_empty() {
                records.remove(endpoint)
            } else {
                None
            }
        };

        if let Some(record) = removed {
            log::info!("[Mux] Last listener left {}, closing", endpoint);
            record.dispose();
        }
    }

    fn take_all(&self) -> Vec<(String, ConnectionRecord)> {
        self.records().drain().collect()
    }
}

impl EventHandler for Registry {
    fn handle_transport_event(&self, endpoint: &str, transport_id: u64, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.step(endpoint, Source::Transport(transport_id), Event::Opened),
            TransportEvent::Message(frame) => self.dispatch(endpoint, transport_id, &frame),
            TransportEvent::Error(error) => {
                log::warn!("[Mux] Transport error on {}: {}", endpoint, error);
            }
            TransportEvent::Close { clean } => {
                self.step(endpoint, Source::Transport(transport_id), Event::Closed { clean });
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let records = self
            .records
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, record) in records.drain() {
            record.dispose();
        }
    }
}

/// At most `max` characters of `text`, for log lines.
fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Process-wide directory of endpoint connections.
///
/// Cheap to clone; clones share the same registry. Construct one per
/// process (or per test) and hand it to whoever needs real-time data.
#[derive(Clone)]
pub struct ConnectionManager {
    registry: Arc<Registry>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("base", &self.registry.resolver.base())
            .field("retry", &self.registry.retry)
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager with an explicit connector.
    pub fn new<C>(resolver: EndpointResolver, retry: RetryPolicy, connector: C) -> Self
    where
        C: Connector + 'static,
    {
        let registry = Arc::new_cyclic(|self_ref| Registry {
            resolver,
            retry,
            connector: Box::new(connector),
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        });
        Self { registry }
    }

    /// Create a WebSocket-backed manager from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.resolver(), config.retry_policy(), WsConnector::new())
    }

    /// Attach `listener` to `endpoint`, opening the shared transport if this
    /// is the first listener.
    ///
    /// A blank endpoint, or a connector that cannot open a transport (e.g.
    /// no Tokio runtime for the WebSocket connector), yields a no-op
    /// subscription and leaves no record behind. Subscribing the same
    /// listener twice attaches it once.
    pub fn subscribe(&self, endpoint: &str, listener: Listener) -> Subscription {
        if !EndpointResolver::is_valid_endpoint(endpoint) {
            log::warn!("[Mux] Ignoring subscribe with empty endpoint");
            return Subscription::noop();
        }

        let mut records = self.registry.records();
        if let Some(record) = records.get_mut(endpoint) {
            if record.listeners.iter().any(|l| l.same_as(&listener)) {
                log::debug!("[Mux] Listener already attached to {}", endpoint);
            } else {
                record.listeners.push(listener.clone());
                log::debug!(
                    "[Mux] Listener joined {} ({} attached)",
                    endpoint,
                    record.listeners.len()
                );
            }
        } else {
            let url = self.registry.resolver.resolve(endpoint);
            log::info!("[Mux] First listener for {}, connecting to {}", endpoint, url);
            let (transport_id, transport) = match self.registry.open_transport(endpoint, &url) {
                Ok(opened) => opened,
                Err(e) => {
                    log::warn!("[Mux] Ignoring subscribe to {}: {:#}", endpoint, e);
                    return Subscription::noop();
                }
            };
            records.insert(
                endpoint.to_string(),
                ConnectionRecord {
                    url,
                    transport,
                    transport_id,
                    listeners: vec![listener.clone()],
                    reconnect_attempts: 0,
                    pending_retry: None,
                    phase: Phase::Connecting,
                },
            );
        }
        drop(records);

        Subscription {
            target: Some(Target {
                registry: Arc::downgrade(&self.registry),
                endpoint: endpoint.to_string(),
                listener,
            }),
            done: AtomicBool::new(false),
        }
    }

    /// [`Self::subscribe`] with a closure.
    pub fn subscribe_fn<F>(&self, endpoint: &str, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe(endpoint, Listener::new(callback))
    }

    /// Serialize `message` as JSON and write it if the endpoint is open.
    ///
    /// Otherwise the message is dropped with a diagnostic; nothing is queued.
    pub fn send<T>(&self, endpoint: &str, message: &T)
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_string(message) {
            Ok(frame) => self.send_raw(endpoint, frame),
            Err(e) => log::warn!("[Mux] Not sending to {}: serialize failed: {}", endpoint, e),
        }
    }

    /// Write a pre-serialized frame if the endpoint is open.
    pub fn send_raw(&self, endpoint: &str, frame: String) {
        let records = self.registry.records();
        let Some(record) = records.get(endpoint) else {
            log::warn!("[Mux] Not sending to {}: no connection", endpoint);
            return;
        };

        let state = record.transport.state();
        if state != ReadyState::Open {
            log::warn!("[Mux] Not sending to {}: connection is {}", endpoint, state);
            return;
        }
        if let Err(e) = record.transport.send(frame) {
            log::warn!("[Mux] Send to {} failed: {:#}", endpoint, e);
        }
    }

    /// State of the endpoint's transport, `Closed` when there is none.
    #[must_use]
    pub fn ready_state(&self, endpoint: &str) -> ReadyState {
        self.registry
            .records()
            .get(endpoint)
            .map_or(ReadyState::Closed, |record| record.transport.state())
    }

    /// Active endpoints, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.registry.records().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Listeners attached to `endpoint`.
    #[must_use]
    pub fn listener_count(&self, endpoint: &str) -> usize {
        self.registry
            .records()
            .get(endpoint)
            .map_or(0, |record| record.listeners.len())
    }

    /// Status of one endpoint, if active.
    #[must_use]
    pub fn status(&self, endpoint: &str) -> Option<EndpointStatus> {
        self.registry
            .records()
            .get(endpoint)
            .map(|record| record.status(endpoint))
    }

    /// Status of every active endpoint, sorted by endpoint.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        let mut statuses: Vec<EndpointStatus> = self
            .registry
            .records()
            .iter()
            .map(|(endpoint, record)| record.status(endpoint))
            .collect();
        statuses.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        statuses
    }

    /// Tear down every endpoint. Outstanding subscriptions become no-ops.
    pub fn shutdown(&self) {
        let records = self.registry.take_all();
        if !records.is_empty() {
            log::info!("[Mux] Shutting down {} connection(s)", records.len());
        }
        for (_, record) in records {
            record.dispose();
        }
    }
}

/// What a live subscription points at.
struct Target {
    registry: Weak<Registry>,
    endpoint: String,
    listener: Listener,
}

/// Handle returned by [`ConnectionManager::subscribe`].
///
/// Dropping it does not detach the listener; call [`Self::unsubscribe`].
#[must_use = "keep the Subscription to be able to unsubscribe"]
pub struct Subscription {
    target: Option<Target>,
    done: AtomicBool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("endpoint", &self.endpoint())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    /// Subscription that is attached to nothing.
    pub fn noop() -> Self {
        Self {
            target: None,
            done: AtomicBool::new(true),
        }
    }

    /// Detach this listener. The last detach closes the endpoint.
    ///
    /// Only the first call has an effect. A frame already being dispatched
    /// on another thread may still reach the listener after this returns;
    /// once that dispatch finishes, no further frames are delivered.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(target) = &self.target else {
            return;
        };
        if let Some(registry) = target.registry.upgrade() {
            registry.remove_listener(&target.endpoint, &target.listener);
        }
    }

    /// Endpoint this subscription is for; `None` for a no-op subscription.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.target.as_ref().map(|target| target.endpoint.as_str())
    }

    /// Whether [`Self::unsubscribe`] has not been called yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::SeqCst)
    }
}
