//! Connection lifecycle state machine.
//!
//! Transport callbacks are turned into [`Event`]s and fed through
//! [`transition`], which decides the next [`Phase`] and the [`Action`] the
//! manager must carry out. The function is pure so the retry bound and
//! teardown rules can be checked without sockets or timers.
//!
//! ```text
//!   subscribe ──► Connecting ──Opened──► Open
//!                    │  ▲                 │
//!        Closed{..}  │  │ RetryElapsed    │ Closed{clean: false}
//!                    ▼  │                 ▼
//!            ClosedUnclean ──► ReconnectScheduled
//!                    │
//!                    └──► ReconnectExhausted (teardown)
//!
//!   Closed{clean: true} ──► ClosedClean (teardown)
//! ```
//!
//! The last unsubscribe tears a record down from any phase; that path is
//! owned by the manager and never goes through here.

use std::fmt;

/// Lifecycle phase of one endpoint's connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Transport opening.
    Connecting,
    /// Transport open; frames flow.
    Open,
    /// Closed on purpose. Terminal.
    ClosedClean,
    /// Closed unexpectedly; retry is being evaluated.
    ClosedUnclean,
    /// Waiting for the retry timer.
    ReconnectScheduled,
    /// Out of attempts (or listeners). Terminal.
    ReconnectExhausted,
}

impl Phase {
    /// Whether a record in this phase must be torn down.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ClosedClean | Self::ReconnectExhausted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::ClosedClean => "closed_clean",
            Self::ClosedUnclean => "closed_unclean",
            Self::ReconnectScheduled => "reconnect_scheduled",
            Self::ReconnectExhausted => "reconnect_exhausted",
        };
        f.write_str(name)
    }
}

/// Lifecycle input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Transport finished its handshake.
    Opened,
    /// Transport closed.
    Closed {
        /// Closure was intentional (local close or normal close frame).
        clean: bool,
    },
    /// Pending retry timer fired.
    RetryElapsed,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    None,
    /// Zero the attempt counter.
    ResetAttempts,
    /// Arm the retry timer for this 1-based attempt.
    ScheduleRetry {
        /// Attempt number the timer will start.
        attempt: u32,
    },
    /// Open a fresh transport in place of the old one.
    Reconnect,
    /// Remove the record, close its transport, cancel its timer.
    TearDown,
    /// Event does not apply in this phase.
    Ignore,
}

/// Retry bookkeeping consulted on an unclean close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// Retries already performed since the last successful open.
    pub attempts: u32,
    /// Configured ceiling.
    pub max_attempts: u32,
    /// Whether anyone is still listening.
    pub has_listeners: bool,
}

/// Result of feeding one event into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Phase after the event.
    pub phase: Phase,
    /// Side effect to carry out.
    pub action: Action,
}

impl Transition {
    fn to(phase: Phase, action: Action) -> Self {
        Self { phase, action }
    }
}

/// Compute the next phase and action.
#[must_use]
pub fn transition(phase: Phase, event: Event, ctx: RetryContext) -> Transition {
    match (phase, event) {
        (Phase::Connecting, Event::Opened) => Transition::to(Phase::Open, Action::ResetAttempts),
        (Phase::Connecting | Phase::Open, Event::Closed { clean: true }) => {
            Transition::to(Phase::ClosedClean, Action::TearDown)
        }
        (Phase::Connecting | Phase::Open, Event::Closed { clean: false }) => {
            transition(Phase::ClosedUnclean, Event::Closed { clean: false }, ctx)
        }
        (Phase::ClosedUnclean, _) => {
            if ctx.has_listeners && ctx.attempts < ctx.max_attempts {
                Transition::to(
                    Phase::ReconnectScheduled,
                    Action::ScheduleRetry {
                        attempt: ctx.attempts + 1,
                    },
                )
            } else {
                Transition::to(Phase::ReconnectExhausted, Action::TearDown)
            }
        }
        (Phase::ReconnectScheduled, Event::RetryElapsed) => {
            Transition::to(Phase::Connecting, Action::Reconnect)
        }
        (phase, _) => Transition::to(phase, Action::Ignore),
    }
}
