//! sockmux - shared real-time connections with bounded reconnection.
//!
//! Many components subscribe to server-pushed events on a logical
//! endpoint; the manager keeps at most one physical WebSocket per
//! endpoint, fans decoded messages out to every listener, and reconnects
//! after unexpected closes with a bounded number of backoff-delayed
//! attempts.
//!
//! # Modules
//!
//! - [`manager`] - the connection registry (`subscribe`/`send`/`ready_state`)
//! - [`state`] - lifecycle state machine driving reconnection
//! - [`backoff`] - retry policy and delay schedule
//! - [`message`] - inbound frame decoding
//! - [`resolver`] - endpoint → URL mapping
//! - [`transport`] - connector/transport traits and implementations
//! - [`config`] - configuration loading/saving
//!
//! # Usage
//!
//! ```ignore
//! let manager = ConnectionManager::from_config(&Config::load()?);
//! let jobs = manager.subscribe_fn("/ws/jobs", |message| {
//!     println!("{:?}", message);
//! });
//! manager.send("/ws/jobs", &serde_json::json!({"type": "pong"}));
//! jobs.unsubscribe();
//! ```

pub mod backoff;
pub mod config;
pub mod constants;
pub mod manager;
pub mod message;
pub mod resolver;
pub mod state;
pub mod transport;
pub mod ws;

pub use backoff::{Backoff, RetryPolicy};
pub use config::Config;
pub use manager::{ConnectionManager, EndpointStatus, Listener, Subscription};
pub use message::Message;
pub use resolver::EndpointResolver;
pub use transport::ReadyState;
