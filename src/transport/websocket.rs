//! WebSocket connector.
//!
//! Each transport owns one background task that performs the handshake,
//! pumps inbound frames into the [`EventSink`], and writes queued outbound
//! frames. The handle the manager holds is just a command sender plus a
//! shared state cell, so `send` and `close` never block.
//!
//! # Close semantics
//!
//! | Cause                                        | `clean` |
//! |----------------------------------------------|---------|
//! | `Transport::close` or handle dropped          | `true`  |
//! | Server close frame with code 1000             | `true`  |
//! | Handshake failure, read/write error, EOF      | `false` |
//! | Server close frame with any other code        | `false` |

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Connector, EventSink, ReadyState, Transport, TransportEvent};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Opens real WebSockets. `open` fails outside a Tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: Vec<(String, String)>,
}

impl WsConnector {
    /// Connector without extra handshake headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every handshake (e.g. `Authorization`).
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str, events: EventSink) -> anyhow::Result<Box<dyn Transport>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("No Tokio runtime to drive {url}: {e}"))?;
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting.as_u8()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        runtime.spawn(run_socket(
            url.to_string(),
            self.headers.clone(),
            Arc::clone(&state),
            cmd_rx,
            events,
        ));

        Ok(Box::new(WsTransport { state, cmd_tx }))
    }
}

/// Commands from the handle to the socket task.
#[derive(Debug)]
enum SocketCommand {
    Send(String),
    Close,
}

/// Handle to one socket task.
#[derive(Debug)]
pub struct WsTransport {
    state: Arc<AtomicU8>,
    cmd_tx: mpsc::UnboundedSender<SocketCommand>,
}

impl Transport for WsTransport {
    fn send(&self, frame: String) -> anyhow::Result<()> {
        self.cmd_tx
            .send(SocketCommand::Send(frame))
            .map_err(|_| anyhow::anyhow!("WebSocket task has exited"))
    }

    fn close(&mut self) {
        if self.state() != ReadyState::Closed {
            store(&self.state, ReadyState::Closing);
        }
        let _ = self.cmd_tx.send(SocketCommand::Close);
    }

    fn state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

fn store(state: &AtomicU8, value: ReadyState) {
    state.store(value.as_u8(), Ordering::SeqCst);
}

/// How a connected socket stopped.
enum SocketExit {
    Clean,
    Unclean,
}

/// Socket task: connect, then pump until closed.
async fn run_socket(
    url: String,
    headers: Vec<(String, String)>,
    state: Arc<AtomicU8>,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    events: EventSink,
) {
    log::info!("[Ws] Connecting to {}", url);

    let connected = tokio::select! {
        result = ws::connect(&url, &headers) => Some(result),
        // Closed (or handle dropped) while still connecting; sends cannot
        // arrive here because the manager only writes to open transports.
        _ = wait_for_close(&mut cmd_rx) => None,
    };

    let (mut writer, mut reader) = match connected {
        Some(Ok(pair)) => pair,
        Some(Err(e)) => {
            log::warn!("[Ws] Connection to {} failed: {:#}", url, e);
            store(&state, ReadyState::Closed);
            events.emit(TransportEvent::Error(format!("{e:#}")));
            events.emit(TransportEvent::Close { clean: false });
            return;
        }
        None => {
            log::debug!("[Ws] Close requested while connecting to {}", url);
            store(&state, ReadyState::Closed);
            events.emit(TransportEvent::Close { clean: true });
            return;
        }
    };

    log::info!("[Ws] Connected to {}", url);
    store(&state, ReadyState::Open);
    events.emit(TransportEvent::Open);

    let exit = pump(&url, &mut writer, &mut reader, &mut cmd_rx, &events).await;

    store(&state, ReadyState::Closed);
    match exit {
        SocketExit::Clean => events.emit(TransportEvent::Close { clean: true }),
        SocketExit::Unclean => events.emit(TransportEvent::Close { clean: false }),
    }
}

/// Resolve once a close is requested or every handle is gone.
async fn wait_for_close(cmd_rx: &mut mpsc::UnboundedReceiver<SocketCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        if matches!(cmd, SocketCommand::Close) {
            return;
        }
    }
}

/// Main loop for one open socket.
async fn pump(
    url: &str,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    cmd_rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &EventSink,
) -> SocketExit {
    loop {
        tokio::select! {
            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    log::trace!("[Ws] <- {} ({} bytes)", url, text.len());
                    events.emit(TransportEvent::Message(text));
                }
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => events.emit(TransportEvent::Message(text)),
                    Err(_) => log::warn!("[Ws] Dropping non-UTF-8 binary frame from {}", url),
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        log::warn!("[Ws] {} pong write error: {:#}", url, e);
                        events.emit(TransportEvent::Error(format!("{e:#}")));
                        return SocketExit::Unclean;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    log::info!("[Ws] {} closed by server (code={}, reason={:?})", url, code, reason);
                    return if code == ws::NORMAL_CLOSE_CODE {
                        SocketExit::Clean
                    } else {
                        SocketExit::Unclean
                    };
                }
                Some(Err(e)) => {
                    log::warn!("[Ws] {} read error: {:#}", url, e);
                    events.emit(TransportEvent::Error(format!("{e:#}")));
                    return SocketExit::Unclean;
                }
                None => {
                    log::info!("[Ws] {} stream ended", url);
                    return SocketExit::Unclean;
                }
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Send(frame)) => {
                    log::trace!("[Ws] -> {} ({} bytes)", url, frame.len());
                    if let Err(e) = writer.send_text(frame).await {
                        log::warn!("[Ws] {} write error: {:#}", url, e);
                        events.emit(TransportEvent::Error(format!("{e:#}")));
                        return SocketExit::Unclean;
                    }
                }
                Some(SocketCommand::Close) | None => {
                    log::debug!("[Ws] Closing {}", url);
                    let _ = writer.send_close().await;
                    let _ = writer.close().await;
                    return SocketExit::Clean;
                }
            },
        }
    }
}
