//! Push channel adapter: the one long-lived websocket to the session service.
//!
//! ARCHITECTURE
//! ============
//! [`spawn_push_channel`] starts a background task that connects eagerly and
//! keeps reconnecting with exponential backoff for as long as any
//! [`ChannelHandle`] exists. Handles are cheap clones of the same channel:
//! open one per process and hand clones to every session view, so inbound
//! broadcasts are never delivered twice.
//!
//! The task owns all connection state. Handles talk to it over an mpsc
//! command queue (`join` / `leave`) and receive typed [`ChannelEvent`]s from a
//! broadcast queue. Subscribing is restartable; dropping a [`Subscription`]
//! unsubscribes.
//!
//! LIFECYCLE
//! =========
//! 1. Connect → publish `Connected` → re-send `join-room` for the active room
//! 2. Commands → frames written in order, caller acked after the write
//! 3. Inbound `new-poll` → `ChannelEvent::PollBroadcast`
//! 4. Inbound `done` / `error` → matched to the request by `parent_id`; a
//!    refused join or leave becomes `ChannelEvent::RequestRefused`
//! 5. Drop / error → publish `Disconnected` → backoff → goto 1
//!
//! While disconnected, `join` / `leave` only update the active room; the
//! reconnect step delivers the join. Broadcasts missed while disconnected are
//! gone: the service does not redeliver them. Replies to requests written on
//! a dropped connection never arrive, so pending requests are forgotten on
//! reconnect.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReconnectPolicy;
use crate::error::ErrorCode;
use crate::frame::{Frame, JOIN_ROOM, NEW_POLL, SESSION_CONNECTED, Status};
use crate::poll::Poll;

/// Inbound events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// =============================================================================
// TYPES
// =============================================================================

/// Websocket connection status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Typed inbound event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    PollBroadcast(Poll),
    ConnectionChanged(ConnectionStatus),
    /// The service answered a `join-room` / `leave-room` with an error.
    RequestRefused { syscall: String, room_code: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("push channel has shut down")]
    Closed,
    #[error("{syscall} for room {room_code} refused: {message}")]
    Refused { syscall: String, room_code: String, message: String },
}

impl ErrorCode for ChannelError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "E_CONNECTION",
            Self::Refused { .. } => "E_REFUSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

pub(crate) enum ChannelCommand {
    Join { room_code: String, ack: oneshot::Sender<()> },
    Leave { room_code: String, ack: oneshot::Sender<()> },
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Shared access to the process's push channel.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ChannelHandle {
    async fn request(&self, build: impl FnOnce(oneshot::Sender<()>) -> ChannelCommand) -> Result<(), ChannelError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(build(ack))
            .map_err(|_| ChannelError::Closed)?;
        done.await.map_err(|_| ChannelError::Closed)
    }

    /// Ask the service for `room_code` broadcasts. Joining the room that is
    /// already active sends nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel task is gone.
    pub async fn join(&self, room_code: &str) -> Result<(), ChannelError> {
        let room_code = room_code.to_owned();
        self.request(|ack| ChannelCommand::Join { room_code, ack })
            .await
    }

    /// Stop receiving `room_code` broadcasts. Resolves once the request has
    /// been handed to the socket, or immediately when offline.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel task is gone.
    pub async fn leave(&self, room_code: &str) -> Result<(), ChannelError> {
        let room_code = room_code.to_owned();
        self.request(|ack| ChannelCommand::Leave { room_code, ack })
            .await
    }

    /// Start receiving events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription { rx: self.events.subscribe() }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }
}

/// A consumer of inbound events. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<ChannelEvent>,
}

impl Subscription {
    /// Next event, or `None` once the channel has shut down.
    ///
    /// A slow consumer loses the oldest events rather than stalling the
    /// socket; that loss is logged and treated like a dropped message.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push channel subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// ROOM STATE
// =============================================================================

/// The room the channel should be joined to, and the frames that get it there.
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    active_room: Option<String>,
    /// Requests written on the current connection that have no reply yet.
    pending: HashMap<Uuid, PendingRequest>,
}

#[derive(Debug)]
struct PendingRequest {
    syscall: String,
    room_code: String,
}

impl ChannelState {
    pub(crate) fn active_room(&self) -> Option<&str> {
        self.active_room.as_deref()
    }

    pub(crate) fn join(&mut self, room_code: &str) -> Vec<Frame> {
        if self.active_room.as_deref() == Some(room_code) {
            return Vec::new();
        }
        let mut frames = Vec::with_capacity(2);
        if let Some(previous) = self.active_room.replace(room_code.to_owned()) {
            frames.push(Frame::leave_room(&previous));
        }
        frames.push(Frame::join_room(room_code));
        frames
    }

    pub(crate) fn leave(&mut self, room_code: &str) -> Vec<Frame> {
        if self.active_room.as_deref() != Some(room_code) {
            return Vec::new();
        }
        self.active_room = None;
        vec![Frame::leave_room(room_code)]
    }

    /// Frames to send right after a (re)connect.
    pub(crate) fn rejoin(&self) -> Vec<Frame> {
        self.active_room
            .as_deref()
            .map(Frame::join_room)
            .into_iter()
            .collect()
    }

    pub(crate) fn apply(&mut self, command: ChannelCommand) -> (Vec<Frame>, oneshot::Sender<()>) {
        match command {
            ChannelCommand::Join { room_code, ack } => (self.join(&room_code), ack),
            ChannelCommand::Leave { room_code, ack } => (self.leave(&room_code), ack),
        }
    }

    /// Remember a request written to the socket so its reply can be matched.
    pub(crate) fn sent(&mut self, frame: &Frame) {
        if frame.status != Status::Request {
            return;
        }
        let room_code = frame.room_code().unwrap_or_default().to_owned();
        self.pending.insert(frame.id, PendingRequest { syscall: frame.syscall.clone(), room_code });
    }

    /// A new connection starts with nothing in flight.
    pub(crate) fn reset_pending(&mut self) {
        self.pending.clear();
    }

    /// Map an inbound frame to a typed event, resolving replies to our own
    /// requests first.
    pub(crate) fn inbound(&mut self, frame: &Frame) -> Option<ChannelEvent> {
        let Some(parent_id) = frame.parent_id.filter(|_| frame.status.is_terminal()) else {
            return event_for(frame);
        };
        let Some(request) = self.pending.remove(&parent_id) else {
            return event_for(frame);
        };

        if frame.status != Status::Error {
            debug!(syscall = %request.syscall, room_code = %request.room_code, status = ?frame.status, "request settled");
            return None;
        }

        let message = frame.error_message().unwrap_or("unknown error").to_owned();
        warn!(syscall = %request.syscall, room_code = %request.room_code, %message, "request refused");
        // A refused join must not be replayed on reconnect.
        if request.syscall == JOIN_ROOM && self.active_room.as_deref() == Some(request.room_code.as_str()) {
            self.active_room = None;
        }
        Some(ChannelEvent::RequestRefused { syscall: request.syscall, room_code: request.room_code, message })
    }
}

// =============================================================================
// INBOUND DECODING
// =============================================================================

/// Map an inbound frame to a typed event. Unknown and malformed frames yield
/// `None`.
pub(crate) fn event_for(frame: &Frame) -> Option<ChannelEvent> {
    if frame.status == Status::Error {
        warn!(
            syscall = %frame.syscall,
            message = frame.error_message().unwrap_or("unknown error"),
            "push channel error frame"
        );
        return None;
    }

    match frame.syscall.as_str() {
        NEW_POLL => match frame.decode_data::<Poll>() {
            Ok(poll) => Some(ChannelEvent::PollBroadcast(poll)),
            Err(e) => {
                warn!(id = %frame.id, error = %e, "malformed new-poll payload");
                None
            }
        },
        SESSION_CONNECTED => {
            debug!("push channel session established");
            None
        }
        other => {
            debug!(syscall = %other, status = ?frame.status, "ignoring push channel frame");
            None
        }
    }
}

fn decode_text(text: &str) -> Option<Frame> {
    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "invalid inbound frame");
            None
        }
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

/// Open the push channel and return the first handle to it.
///
/// The connection attempt starts immediately; `join` does not connect.
#[must_use]
pub fn spawn_push_channel(config: ChannelConfig) -> ChannelHandle {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);

    tokio::spawn(channel_loop(config, commands_rx, events.clone(), status_tx));

    ChannelHandle { commands, events, status }
}

enum ConnectionEnd {
    /// Every handle was dropped.
    Shutdown,
    Dropped(String),
}

fn publish_status(
    status: &watch::Sender<ConnectionStatus>,
    events: &broadcast::Sender<ChannelEvent>,
    next: ConnectionStatus,
) {
    if status.send_replace(next) != next {
        let _ = events.send(ChannelEvent::ConnectionChanged(next));
    }
}

/// Main connection loop with reconnect logic.
async fn channel_loop(
    config: ChannelConfig,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Sender<ConnectionStatus>,
) {
    let mut state = ChannelState::default();
    let mut backoff_ms = config.reconnect.initial_ms;

    loop {
        publish_status(&status, &events, ConnectionStatus::Connecting);

        let connect = connect_async(config.url.as_str());
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = commands.recv() => {
                    let Some(command) = command else { return };
                    let (_, ack) = state.apply(command);
                    let _ = ack.send(());
                }
            }
        };

        match connected {
            Ok((stream, _)) => {
                backoff_ms = config.reconnect.initial_ms;
                publish_status(&status, &events, ConnectionStatus::Connected);
                info!(url = %config.url, room_code = ?state.active_room(), "push channel connected");

                match run_connection(stream, &mut state, &mut commands, &events).await {
                    ConnectionEnd::Shutdown => {
                        publish_status(&status, &events, ConnectionStatus::Disconnected);
                        info!("push channel shut down");
                        return;
                    }
                    ConnectionEnd::Dropped(reason) => {
                        warn!(%reason, backoff_ms, "push channel disconnected");
                    }
                }
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, backoff_ms, "push channel connect failed");
            }
        }

        publish_status(&status, &events, ConnectionStatus::Disconnected);
        if !wait_offline(Duration::from_millis(backoff_ms), &mut state, &mut commands).await {
            return;
        }
        backoff_ms = config.reconnect.next_ms(backoff_ms);
    }
}

/// Sleep out the backoff while still accepting room changes.
/// Returns `false` when every handle has been dropped.
async fn wait_offline(
    delay: Duration,
    state: &mut ChannelState,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            command = commands.recv() => {
                let Some(command) = command else { return false };
                let (_, ack) = state.apply(command);
                let _ = ack.send(());
            }
        }
    }
}

/// Process commands and inbound frames until the socket drops.
async fn run_connection(
    stream: WsStream,
    state: &mut ChannelState,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
    events: &broadcast::Sender<ChannelEvent>,
) -> ConnectionEnd {
    let (mut write, mut read) = stream.split();

    state.reset_pending();
    for frame in state.rejoin() {
        if let Err(e) = send_frame(&mut write, &frame).await {
            return ConnectionEnd::Dropped(e.to_string());
        }
        state.sent(&frame);
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = write.close().await;
                    return ConnectionEnd::Shutdown;
                };
                let (frames, ack) = state.apply(command);
                for frame in &frames {
                    if let Err(e) = send_frame(&mut write, frame).await {
                        // The room change is recorded; reconnect delivers it.
                        let _ = ack.send(());
                        return ConnectionEnd::Dropped(e.to_string());
                    }
                    state.sent(frame);
                }
                let _ = ack.send(());
            }
            message = read.next() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => decode_text(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => decode_text(text),
                        Err(_) => None,
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return ConnectionEnd::Dropped("closed by peer".to_owned());
                    }
                    Some(Ok(_)) => None,
                    Some(Err(e)) => return ConnectionEnd::Dropped(e.to_string()),
                };
                if let Some(event) = frame.and_then(|frame| state.inbound(&frame)) {
                    // No subscribers is fine: nobody is attached to a room.
                    let _ = events.send(event);
                }
            }
        }
    }
}

/// JSON text for `frame`, or `None` (logged) if it cannot be encoded.
fn encode_frame(frame: &Frame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(id = %frame.id, syscall = %frame.syscall, error = %e, "unserializable frame skipped");
            None
        }
    }
}

async fn send_frame(
    write: &mut futures_util::stream::SplitSink<WsStream, Message>,
    frame: &Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let Some(text) = encode_frame(frame) else {
        return Ok(());
    };
    debug!(id = %frame.id, syscall = %frame.syscall, room_code = ?frame.room, "send frame");
    write.send(Message::Text(text.into())).await
}

// =============================================================================
// TEST LOOPBACK
// =============================================================================

/// In-process stand-in for the service side of the channel.
#[cfg(test)]
pub(crate) struct Loopback {
    sent: std::sync::Arc<std::sync::Mutex<Vec<Frame>>>,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Sender<ConnectionStatus>,
}

#[cfg(test)]
impl Loopback {
    /// Deliver an event to every subscriber, as if it came off the socket.
    pub(crate) fn inject(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn set_status(&self, next: ConnectionStatus) {
        publish_status(&self.status, &self.events, next);
    }

    /// `(syscall, room)` for every frame written so far.
    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|f| (f.syscall.clone(), f.room.clone().unwrap_or_default()))
            .collect()
    }
}

#[cfg(test)]
impl ChannelHandle {
    /// A connected channel whose frames are recorded instead of sent.
    pub(crate) fn loopback() -> (Self, Loopback) {
        let (commands, mut commands_rx) = mpsc::unbounded_channel::<ChannelCommand>();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(ConnectionStatus::Connected);
        let sent = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let recorder = sent.clone();
        tokio::spawn(async move {
            let mut state = ChannelState::default();
            while let Some(command) = commands_rx.recv().await {
                let (frames, ack) = state.apply(command);
                recorder
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .extend(frames);
                let _ = ack.send(());
            }
        });

        let handle = Self { commands, events: events.clone(), status };
        (handle, Loopback { sent, events, status: status_tx })
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
