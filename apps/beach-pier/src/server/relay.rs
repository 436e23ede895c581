use std::borrow::Cow;
use std::sync::Arc;
use std::thread;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::control::{self, Framing, Inbound};
use super::pty::{PtyEvent, PtySession};
use super::AppState;
use crate::error::{PtyError, SocketError};

/// Close reasons must fit in a control frame (125 bytes minus the code).
const MAX_CLOSE_REASON: usize = 120;
/// Pending keystroke and resize commands per connection. When full, the
/// socket stops being read until the shell catches up.
const INPUT_QUEUE_DEPTH: usize = 256;

/// Lifecycle of one terminal socket. Reaching `Closed` always means the pty
/// session has been destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Why the forwarding loop stopped.
#[derive(Debug)]
enum Shutdown {
    ClientClosed(Option<String>),
    SocketFailed(SocketError),
    ShellExited,
    InputFailed(PtyError),
    ServerStopping,
}

/// Work for the blocking input thread. Keystrokes and resizes share one queue
/// so they reach the pty in the order they arrived on the socket.
#[derive(Debug)]
enum PtyCommand {
    Write(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

struct Connection {
    id: Uuid,
    state: ConnectionState,
}

impl Connection {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug!(
            connection_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "terminal connection state change"
        );
        self.state = next;
    }
}

/// Serves one `/terminal` socket: one shell, two forwarding directions, one
/// teardown.
pub async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let framing = Framing::from_subprotocol(
        socket
            .protocol()
            .and_then(|value| value.to_str().ok()),
    );
    let mut connection = Connection::new();
    let (mut ws_tx, ws_rx) = socket.split();

    let template = state.template.clone();
    let spawned = tokio::task::spawn_blocking(move || PtySession::spawn(&template)).await;
    let (session, pty_rx) = match spawned {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            counter!("beach_pier_spawn_failures_total", 1);
            warn!(connection_id = %connection.id, error = %err, "failed to spawn shell");
            connection.advance(ConnectionState::Closing);
            send_close(&mut ws_tx, close_code::ERROR, &err.to_string()).await;
            connection.advance(ConnectionState::Closed);
            return;
        }
        Err(err) => {
            warn!(connection_id = %connection.id, error = %err, "spawn task failed");
            send_close(&mut ws_tx, close_code::ERROR, "failed to spawn shell").await;
            connection.advance(ConnectionState::Closed);
            return;
        }
    };
    let session = Arc::new(session);

    connection.advance(ConnectionState::Open);
    let _slot = SessionSlot::claim(&state);
    counter!("beach_pier_sessions_total", 1);
    info!(
        connection_id = %connection.id,
        program = session.program(),
        pid = ?session.process_id(),
        framing = ?framing,
        "terminal session opened"
    );

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    let stopping = state.shutdown_signal();
    let shutdown = match spawn_input_pump(Arc::clone(&session), input_rx, connection.id) {
        // Detached: it exits once `input_tx` is dropped or the pty is gone.
        Ok(_pump) => {
            let channels = Channels {
                ws_rx,
                pty_rx,
                input_tx: &input_tx,
                stopping,
            };
            forward(&mut ws_tx, channels, framing, connection.id).await
        }
        Err(err) => Shutdown::InputFailed(PtyError::Io(err)),
    };
    drop(input_tx);

    connection.advance(ConnectionState::Closing);
    match &shutdown {
        Shutdown::ClientClosed(reason) => {
            info!(connection_id = %connection.id, reason = ?reason, "client closed terminal socket");
        }
        Shutdown::SocketFailed(err) => {
            warn!(connection_id = %connection.id, error = %err, "terminal socket failed");
        }
        Shutdown::ShellExited => {
            info!(connection_id = %connection.id, "shell exited; closing socket");
            send_close(&mut ws_tx, close_code::NORMAL, "shell exited").await;
        }
        Shutdown::InputFailed(err) => {
            warn!(connection_id = %connection.id, error = %err, "writing to pty failed");
            send_close(&mut ws_tx, close_code::ERROR, &err.to_string()).await;
        }
        Shutdown::ServerStopping => {
            info!(connection_id = %connection.id, "server shutting down; closing socket");
            send_close(&mut ws_tx, close_code::AWAY, "server shutting down").await;
        }
    }

    let teardown_session = Arc::clone(&session);
    match tokio::task::spawn_blocking(move || teardown_session.destroy()).await {
        Ok(true) => debug!(connection_id = %connection.id, "pty session destroyed"),
        Ok(false) => {}
        Err(err) => warn!(connection_id = %connection.id, error = %err, "pty teardown task failed"),
    }
    connection.advance(ConnectionState::Closed);
}

/// Counts a live session in the gauge and in `AppState` until dropped.
struct SessionSlot<'a> {
    state: &'a AppState,
}

impl<'a> SessionSlot<'a> {
    fn claim(state: &'a AppState) -> Self {
        state.session_opened();
        increment_gauge!("beach_pier_sessions_active", 1.0);
        Self { state }
    }
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        decrement_gauge!("beach_pier_sessions_active", 1.0);
        self.state.session_closed();
    }
}

struct Channels<'a> {
    ws_rx: SplitStream<WebSocket>,
    pty_rx: mpsc::Receiver<PtyEvent>,
    input_tx: &'a mpsc::Sender<PtyCommand>,
    stopping: watch::Receiver<bool>,
}

async fn forward(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    channels: Channels<'_>,
    framing: Framing,
    connection_id: Uuid,
) -> Shutdown {
    let Channels {
        mut ws_rx,
        mut pty_rx,
        input_tx,
        mut stopping,
    } = channels;
    // A command that did not fit in the input queue. While it waits, the
    // socket is not read, but pty output keeps flowing.
    let mut pending: Option<PtyCommand> = None;
    if *stopping.borrow_and_update() {
        return Shutdown::ServerStopping;
    }

    loop {
        tokio::select! {
            permit = input_tx.reserve(), if pending.is_some() => match (permit, pending.take()) {
                (Ok(permit), Some(command)) => permit.send(command),
                (Ok(_), None) => {}
                (Err(_), _) => {
                    return Shutdown::InputFailed(PtyError::Join("pty input thread stopped".into()));
                }
            },
            frame = ws_rx.next(), if pending.is_none() => {
                let inbound = match frame {
                    Some(Ok(Message::Text(text))) => control::classify_text(framing, text),
                    Some(Ok(Message::Binary(bytes))) => control::classify_binary(framing, bytes),
                    Some(Ok(Message::Close(frame))) => {
                        return Shutdown::ClientClosed(frame.map(|f| f.reason.to_string()));
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Err(err)) => return Shutdown::SocketFailed(SocketError::Receive(err)),
                    None => return Shutdown::ClientClosed(None),
                };
                let command = match inbound {
                    Inbound::Input(bytes) => PtyCommand::Write(bytes),
                    Inbound::Resize { cols, rows } => match control::pty_dimensions(cols, rows) {
                        Some((cols, rows)) => PtyCommand::Resize { cols, rows },
                        None => {
                            warn!(connection_id = %connection_id, cols, rows, "ignoring resize with unusable size");
                            continue;
                        }
                    },
                    Inbound::Unknown(text) => {
                        warn!(
                            connection_id = %connection_id,
                            bytes = text.len(),
                            "dropping unknown control message"
                        );
                        continue;
                    }
                };
                match input_tx.try_send(command) {
                    Ok(()) => {}
                    Err(TrySendError::Full(command)) => {
                        trace!(connection_id = %connection_id, "pty input queue full; pausing socket reads");
                        pending = Some(command);
                    }
                    Err(TrySendError::Closed(_)) => {
                        return Shutdown::InputFailed(PtyError::Join("pty input thread stopped".into()));
                    }
                }
            }
            event = pty_rx.recv() => match event {
                Some(PtyEvent::Output(bytes)) => {
                    let len = bytes.len() as u64;
                    if let Err(err) = ws_tx.send(Message::Binary(bytes)).await {
                        return Shutdown::SocketFailed(SocketError::Send(err));
                    }
                    counter!("beach_pier_bytes_forwarded_total", len, "direction" => "out");
                }
                Some(PtyEvent::Exited) | None => return Shutdown::ShellExited,
            },
            changed = stopping.changed() => {
                // A dropped sender also means the server is going away.
                if changed.is_err() || *stopping.borrow() {
                    return Shutdown::ServerStopping;
                }
            }
        }
    }
}

fn spawn_input_pump(
    session: Arc<PtySession>,
    mut rx: mpsc::Receiver<PtyCommand>,
    connection_id: Uuid,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pty-input-{}", connection_id.simple()))
        .spawn(move || {
            while let Some(command) = rx.blocking_recv() {
                let result = match command {
                    PtyCommand::Write(bytes) => {
                        let len = bytes.len() as u64;
                        session.write(&bytes).map(|()| {
                            counter!("beach_pier_bytes_forwarded_total", len, "direction" => "in");
                        })
                    }
                    PtyCommand::Resize { cols, rows } => session.resize(cols, rows).map(|()| {
                        counter!("beach_pier_resize_events_total", 1);
                        debug!(connection_id = %connection_id, cols, rows, "pty resized");
                    }),
                };
                if let Err(err) = result {
                    if session.is_destroyed() {
                        break;
                    }
                    warn!(connection_id = %connection_id, error = %err, "pty input failed");
                }
            }
        })
}

async fn send_close(ws_tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(truncate_reason(reason)),
    };
    if let Err(err) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "failed to send close frame");
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
