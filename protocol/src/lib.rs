//! The message codes and wire formats used consistently across the server and the client.
//! Every frame on the socket is a UTF-8 JSON envelope carrying an integer opcode and a
//! code-specific body. Also contains the binary packing for the drawing canvas.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The buffer size for each subscriber's outbound frame queue.
pub const CHANNEL_BUFFER_SIZE: usize = 256;

// Client -> Server.

/// The host asks to start the game. Empty body.
pub const START_CODE: u8 = 1;
/// A chat message or guess, carrying a [`TextMsg`].
pub const TEXT_CODE: u8 = 2;
/// A stroke for the canvas, carrying a [`Circle`]. Echoed back to all subscribers on success.
pub const DRAW_CODE: u8 = 3;
/// A request to save the current drawing. Empty body, no broadcast.
pub const SAVE_CODE: u8 = 10;

// Server -> Client.

/// A chat entry was appended, carrying a [`Chat`].
pub const CHAT_CODE: u8 = 4;
/// A turn ended, carrying a [`FinishMsg`].
pub const FINISH_CODE: u8 = 5;
/// A new turn began, carrying a [`BeginMsg`].
pub const BEGIN_CODE: u8 = 6;
/// A player joined the room, carrying a [`PlayerMsg`].
pub const JOIN_CODE: u8 = 7;
/// A player left the room, carrying a [`PlayerMsg`].
pub const LEAVE_CODE: u8 = 8;
/// The room was terminated for idling. Empty body.
pub const TIMEOUT_CODE: u8 = 9;
/// The full game snapshot sent to a fresh subscriber.
pub const STATE_CODE: u8 = 11;
/// A rejection delivered only to the offending sender, carrying an [`ErrorMsg`].
pub const ERROR_CODE: u8 = 12;

// Field limits enforced by the server.

/// The minimum chat text length in bytes.
pub const MIN_CHAT_LEN: usize = 5;
/// The maximum chat text length in bytes.
pub const MAX_CHAT_LEN: usize = 50;
/// The maximum x coordinate of a stroke.
pub const MAX_X: u16 = 1000;
/// The maximum y coordinate of a stroke.
pub const MAX_Y: u16 = 1000;
/// The maximum radius code of a stroke.
pub const MAX_RADIUS: u8 = 8;
/// The maximum color code of a stroke.
pub const MAX_COLOR: u8 = 8;

/// The envelope for every frame received from a client.
///
/// `msg` stays unparsed until the opcode is known; `trace_id` is echoed back
/// unchanged on the direct response so clients can measure round-trip latency.
#[derive(Debug, Serialize, Deserialize)]
pub struct InputPayload {
    pub code: u8,
    #[serde(default)]
    pub msg: Value,
    #[serde(rename = "traceID", default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// The envelope for every frame sent to a client.
#[derive(Debug, Serialize)]
pub struct OutputPayload<T> {
    pub code: u8,
    pub msg: T,
    #[serde(rename = "traceID", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// A body for frames that carry no information besides their opcode.
#[derive(Debug, Serialize, Deserialize)]
pub struct EmptyMsg {}

/// A participant of a room. Identity is the id; the name is presentational.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: Uuid,
    pub name: String,
}

/// One stroke unit on the canvas. `connected` tells the client whether the pen
/// was lifted between this stroke and the previous one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    pub color: u8,
    pub radius: u8,
    pub x: u16,
    pub y: u16,
    pub connected: bool,
}

/// The body of a DRAW frame in both directions.
pub type DrawMsg = Circle;

/// One entry of the chat log. `text` is empty when the chat was a successful
/// guess, so the word is not leaked; `guess_points_inc` is positive iff the
/// guess scored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub player: Player,
    pub text: String,
    pub guess_points_inc: i64,
}

/// The body of an inbound TEXT frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct TextMsg {
    pub text: String,
}

/// Announces the turn that just began.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginMsg {
    pub next_word: String,
    pub next_player_index: usize,
}

/// Announces a joining or leaving player. The index keeps the player ordering
/// on the client identical to the server's.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMsg {
    pub player_index: usize,
    pub player: Player,
}

/// Announces the end of a turn: the drawer's score bonus, and the next turn
/// when the game continues (`begin_msg` is absent after the final round).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishMsg {
    pub begin_msg: Option<BeginMsg>,
    pub draw_score_inc: i64,
}

/// The body of an ERROR frame.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMsg {
    pub error_desc: String,
}

/// The packed width of one canvas record on the wire.
const CIRCLE_WIRE_SIZE: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("canvas is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("canvas byte length {0} is not a whole number of records")]
    Truncated(usize),
}

/// Packs the canvas as little-endian fixed-width records
/// `(u8 color, u8 radius, u16 x, u16 y, u8 connected)` and base64-encodes the
/// concatenation. An empty canvas encodes to the empty string.
pub fn encode_canvas(canvas: &[Circle]) -> String {
    if canvas.is_empty() {
        return String::new();
    }
    let mut buf = BytesMut::with_capacity(canvas.len() * CIRCLE_WIRE_SIZE);
    for circle in canvas {
        buf.put_u8(circle.color);
        buf.put_u8(circle.radius);
        buf.put_u16_le(circle.x);
        buf.put_u16_le(circle.y);
        buf.put_u8(circle.connected as u8);
    }
    BASE64.encode(&buf)
}

/// The exact inverse of [`encode_canvas`].
pub fn decode_canvas(encoded: &str) -> Result<Vec<Circle>, CanvasError> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    let raw = BASE64.decode(encoded)?;
    if raw.len() % CIRCLE_WIRE_SIZE != 0 {
        return Err(CanvasError::Truncated(raw.len()));
    }

    let mut buf = &raw[..];
    let mut canvas = Vec::with_capacity(raw.len() / CIRCLE_WIRE_SIZE);
    while buf.has_remaining() {
        canvas.push(Circle {
            color: buf.get_u8(),
            radius: buf.get_u8(),
            x: buf.get_u16_le(),
            y: buf.get_u16_le(),
            connected: buf.get_u8() != 0,
        });
    }
    Ok(canvas)
}
