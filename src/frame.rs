//! Frame: the message envelope on the push channel.
//!
//! ARCHITECTURE
//! ============
//! Every message exchanged with the session service over the websocket is a
//! Frame. The client sends `join-room` / `leave-room` request frames; the
//! service pushes `new-poll` frames and answers requests with terminal
//! `done` / `error` frames that point back at the request via `parent_id`.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`.
//! - Frames travel as JSON text messages.
//! - Routing happens on `syscall` only; handlers decode `data` into typed
//!   payloads with [`Frame::decode_data`].

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// SYSCALLS
// =============================================================================

/// Client → service: start receiving broadcasts for a room.
pub const JOIN_ROOM: &str = "join-room";

/// Client → service: stop receiving broadcasts for a room.
pub const LEAVE_ROOM: &str = "leave-room";

/// Service → client: a poll was broadcast to the room.
pub const NEW_POLL: &str = "new-poll";

/// Service → client: handshake complete, the connection is usable.
pub const SESSION_CONNECTED: &str = "session:connected";

/// Frame data key carrying the room code on join/leave requests.
pub const FRAME_ROOM_CODE: &str = "roomCode";

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload.
pub type Data = HashMap<String, serde_json::Value>;

/// Lifecycle position of a frame in a request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Item,
    Done,
    Error,
    Cancel,
}

impl Status {
    /// Terminal statuses end a response stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error | Status::Cancel)
    }
}

/// The push channel envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub syscall: String,
    pub status: Status,
    #[serde(default)]
    pub data: Data,
}

fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Frame {
    /// Create a request frame.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Build the `join-room` request for `room_code`.
    #[must_use]
    pub fn join_room(room_code: &str) -> Self {
        Self::request(JOIN_ROOM, Data::new())
            .with_room(room_code)
            .with_data(FRAME_ROOM_CODE, room_code)
    }

    /// Build the `leave-room` request for `room_code`.
    #[must_use]
    pub fn leave_room(room_code: &str) -> Self {
        Self::request(LEAVE_ROOM, Data::new())
            .with_room(room_code)
            .with_data(FRAME_ROOM_CODE, room_code)
    }

    /// Done reply, as the service sends it.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn done(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            room: self.room.clone(),
            from: None,
            syscall: self.syscall.clone(),
            status: Status::Done,
            data: Data::new(),
        }
    }

    /// Error reply carrying `message`, as the service sends it.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn error_reply(&self, message: &str) -> Self {
        let mut reply = self.done().with_data(FRAME_MESSAGE, message);
        reply.status = Status::Error;
        reply
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_room(mut self, room_code: impl Into<String>) -> Self {
        self.room = Some(room_code.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// DECODING
// =============================================================================

impl Frame {
    /// Decode the flat payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the payload does not match `T`.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let map: serde_json::Map<String, serde_json::Value> =
            self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(serde_json::Value::Object(map))
    }

    /// Error message carried by an `error` frame, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.data.get(FRAME_MESSAGE).and_then(serde_json::Value::as_str)
    }

    /// Room code addressed by a join/leave frame.
    #[must_use]
    pub fn room_code(&self) -> Option<&str> {
        self.room.as_deref().or_else(|| {
            self.data
                .get(FRAME_ROOM_CODE)
                .and_then(serde_json::Value::as_str)
        })
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
