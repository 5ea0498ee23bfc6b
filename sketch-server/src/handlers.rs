//! Per-opcode handling of client frames against a room: envelope decoding,
//! validation, state mutation and response construction. Every rejection is
//! a typed error that the room serializes into an ERROR frame for the sender
//! alone.

use crate::room::{Room, RoomHandler};
use crate::state::{GameError, Stage};
use bytes::Bytes;
use protocol::{
    BeginMsg, Circle, EmptyMsg, ErrorMsg, FinishMsg, InputPayload, OutputPayload, Player,
    PlayerMsg, TextMsg, BEGIN_CODE, CHAT_CODE, DRAW_CODE, ERROR_CODE, FINISH_CODE, JOIN_CODE,
    LEAVE_CODE, MAX_CHAT_LEN, MAX_COLOR, MAX_RADIUS, MAX_X, MAX_Y, MIN_CHAT_LEN, SAVE_CODE,
    STATE_CODE, START_CODE, TEXT_CODE,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Failed to unmarshal input data")]
    Unmarshal,
    #[error("Failed to marshal output data")]
    Marshal,
    #[error("No matching message type for code")]
    UnknownOpcode,
    #[error("Player must be the host to start the game")]
    NotHost,
    #[error("Cannot start a game that is already started")]
    AlreadyStarted,
    #[error("Chat message must be between {MIN_CHAT_LEN} and {MAX_CHAT_LEN} characters in length")]
    ChatLength,
    #[error("Can't draw on canvas when game is not being played")]
    NotPlaying,
    #[error("Player cannot draw on the canvas")]
    NotDrawer,
    #[error("Cannot draw outside canvas")]
    OutOfBounds,
    #[error("Unknown code for radius {0}")]
    BadRadius(u8),
    #[error("Unknown code for color {0}")]
    BadColor(u8),
    #[error(transparent)]
    Game(#[from] GameError),
}

/// Serializes a response envelope, echoing the sender's trace id when present.
pub(crate) fn encode_frame<T: Serialize>(
    code: u8,
    msg: &T,
    trace_id: Option<String>,
) -> Result<Bytes, RoomError> {
    let payload = OutputPayload { code, msg, trace_id };
    match serde_json::to_vec(&payload) {
        Ok(buf) => Ok(buf.into()),
        Err(err) => {
            tracing::error!(%err, "failed to serialize response frame");
            Err(RoomError::Marshal)
        }
    }
}

/// An ERROR frame for the offending sender. Falls back to an empty frame
/// (which senders skip) in the impossible case that serialization fails.
pub(crate) fn error_frame(error_desc: &str) -> Bytes {
    let payload = OutputPayload {
        code: ERROR_CODE,
        msg: ErrorMsg { error_desc: error_desc.to_owned() },
        trace_id: None,
    };
    match serde_json::to_vec(&payload) {
        Ok(buf) => buf.into(),
        Err(err) => {
            tracing::error!(%err, "failed to serialize error frame");
            Bytes::new()
        }
    }
}

pub(crate) fn leave_frame(player_index: usize, player: &Player) -> Result<Bytes, RoomError> {
    let msg = PlayerMsg { player_index, player: player.clone() };
    encode_frame(LEAVE_CODE, &msg, None)
}

/// A bodiless frame whose opcode is the termination code itself.
pub(crate) fn terminate_frame(term_code: u8) -> Result<Bytes, RoomError> {
    encode_frame(term_code, &EmptyMsg {}, None)
}

impl<H: RoomHandler> Room<H> {
    /// Dispatches one raw client frame. `Ok(Some(..))` is a response for all
    /// subscribers, `Ok(None)` means the message was consumed silently.
    pub(crate) fn handle_message(
        &mut self,
        message: &[u8],
        player: Player,
    ) -> Result<Option<Bytes>, RoomError> {
        let payload: InputPayload =
            serde_json::from_slice(message).map_err(|_| RoomError::Unmarshal)?;
        tracing::debug!(code = payload.code, player = %player.name, "handling message");

        match payload.code {
            START_CODE => self.handle_start_message(player, payload.trace_id).map(Some),
            TEXT_CODE => {
                let msg: TextMsg =
                    serde_json::from_value(payload.msg).map_err(|_| RoomError::Unmarshal)?;
                self.handle_text_message(msg, player, payload.trace_id).map(Some)
            }
            DRAW_CODE => {
                let msg: Circle =
                    serde_json::from_value(payload.msg).map_err(|_| RoomError::Unmarshal)?;
                self.handle_draw_message(msg, player, payload.trace_id).map(Some)
            }
            SAVE_CODE => {
                let snapshot = self.state.capture(&player);
                self.handler.do_capture(snapshot);
                Ok(None)
            }
            _ => Err(RoomError::UnknownOpcode),
        }
    }

    fn handle_start_message(
        &mut self,
        player: Player,
        trace_id: Option<String>,
    ) -> Result<Bytes, RoomError> {
        if self.state.player_is_not_host(&player) {
            return Err(RoomError::NotHost);
        }
        if self.state.stage == Stage::Playing {
            return Err(RoomError::AlreadyStarted);
        }

        self.state.start_game()?;

        self.start_reset_timer(self.state.settings.time_limit_secs);
        self.postpone_expiration();

        let msg = BeginMsg {
            next_word: self.state.turn.curr_word.clone(),
            next_player_index: self.state.turn.curr_player_index.unwrap_or(0),
        };
        encode_frame(BEGIN_CODE, &msg, trace_id)
    }

    fn handle_text_message(
        &mut self,
        msg: TextMsg,
        player: Player,
        trace_id: Option<String>,
    ) -> Result<Bytes, RoomError> {
        if msg.text.len() < MIN_CHAT_LEN || msg.text.len() > MAX_CHAT_LEN {
            return Err(RoomError::ChatLength);
        }

        let chat = self.state.try_guess(&player, &msg.text);
        encode_frame(CHAT_CODE, &chat, trace_id)
    }

    fn handle_draw_message(
        &mut self,
        msg: Circle,
        player: Player,
        trace_id: Option<String>,
    ) -> Result<Bytes, RoomError> {
        if self.state.stage != Stage::Playing {
            return Err(RoomError::NotPlaying);
        }
        if self.state.curr_player().map(|p| p.id) != Some(player.id) {
            return Err(RoomError::NotDrawer);
        }
        if msg.x > MAX_X || msg.y > MAX_Y {
            return Err(RoomError::OutOfBounds);
        }
        if msg.radius > MAX_RADIUS {
            return Err(RoomError::BadRadius(msg.radius));
        }
        if msg.color > MAX_COLOR {
            return Err(RoomError::BadColor(msg.color));
        }

        self.state.draw(msg);
        encode_frame(DRAW_CODE, &msg, trace_id)
    }

    pub(crate) fn handle_join(&mut self, player: Player) -> Result<Bytes, RoomError> {
        let player_index = self.state.join(player.clone())?;
        let msg = PlayerMsg { player_index, player };
        encode_frame(JOIN_CODE, &msg, None)
    }

    pub(crate) fn handle_state(&self) -> Result<Bytes, RoomError> {
        encode_frame(STATE_CODE, &self.state.client_state(), None)
    }

    /// End of turn: credit the drawer, then either begin the next turn (and
    /// arm its timer) or finish the game. Returns the broadcast frame and
    /// whether the game just ended.
    pub(crate) fn handle_reset(&mut self) -> (Bytes, bool) {
        tracing::debug!(code = %self.state.code, "resetting the game");
        self.postpone_expiration();

        let draw_score_inc = self.state.on_reset();

        let begin_msg = if self.state.next_turn() {
            self.start_reset_timer(self.state.settings.time_limit_secs);
            Some(BeginMsg {
                next_word: self.state.turn.curr_word.clone(),
                next_player_index: self.state.turn.curr_player_index.unwrap_or(0),
            })
        } else {
            None
        };

        let finished = begin_msg.is_none();
        let msg = FinishMsg { begin_msg, draw_score_inc };
        match encode_frame(FINISH_CODE, &msg, None) {
            Ok(frame) => (frame, finished),
            Err(err) => (error_frame(&err.to_string()), finished),
        }
    }
}
