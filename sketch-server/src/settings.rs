//! Room configuration as submitted by the create-room request, with the
//! server-side defaults and bounds applied before a room is built from it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_TIME_LIMIT: i64 = 15;
pub const MAX_TIME_LIMIT: i64 = 240;
pub const MIN_PLAYER_LIMIT: usize = 2;
pub const MAX_PLAYER_LIMIT: usize = 12;
pub const MIN_TOTAL_ROUNDS: u32 = 1;
pub const MAX_TOTAL_ROUNDS: u32 = 6;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Time limit must be between 15 and 240 seconds")]
    TimeLimit,
    #[error("Games can only contain between 2 and 12 players")]
    PlayerLimit,
    #[error("Games can only have between 1 and 6 rounds")]
    TotalRounds,
}

/// The settings a room is created with, frozen for the room's lifetime.
///
/// The shared word bank is injected by the server after parsing and is never
/// serialized back to clients.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomSettings {
    pub player_limit: usize,
    pub total_rounds: u32,
    pub time_limit_secs: i64,
    pub custom_word_bank: Vec<String>,
    #[serde(skip)]
    pub shared_word_bank: Vec<String>,
    pub is_public: bool,
}

impl RoomSettings {
    /// Fills every unset (zero) field with the server default.
    pub fn with_defaults(&mut self) {
        if self.player_limit == 0 {
            self.player_limit = 8;
        }
        if self.time_limit_secs == 0 {
            self.time_limit_secs = 45;
        }
        if self.total_rounds == 0 {
            self.total_rounds = 3;
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(MIN_TIME_LIMIT..=MAX_TIME_LIMIT).contains(&self.time_limit_secs) {
            return Err(SettingsError::TimeLimit);
        }
        if !(MIN_PLAYER_LIMIT..=MAX_PLAYER_LIMIT).contains(&self.player_limit) {
            return Err(SettingsError::PlayerLimit);
        }
        if !(MIN_TOTAL_ROUNDS..=MAX_TOTAL_ROUNDS).contains(&self.total_rounds) {
            return Err(SettingsError::TotalRounds);
        }
        Ok(())
    }
}
