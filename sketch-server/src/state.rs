//! The entire state of one game and the rules that mutate it. Everything here
//! is synchronous and single-owner: the room loop is the only task that ever
//! touches a `GameState`, so no locking happens at this level.

use crate::settings::RoomSettings;
use chrono::Utc;
use protocol::{encode_canvas, Chat, Circle, Player};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::ser::Serializer;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

/// Seconds since the unix epoch, the clock used for turn timing and expiry.
pub(crate) fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Error)]
pub enum GameError {
    #[error("Player cannot join, the room is at its player limit")]
    RoomFull,
    #[error("No words left to pick the next word from")]
    NoWords,
}

/// The stage a room is in, serialized as its numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Lobby = 0,
    Playing = 1,
    Post = 2,
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// Per-player aggregates for the current game. Only the points are visible to
/// clients; the word and drawing tallies feed the persisted results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Score {
    pub points: i64,
    #[serde(skip)]
    pub words: i64,
    #[serde(skip)]
    pub drawings: i64,
}

/// A player's slot in the room. Slots are appended on first join and never
/// removed; a leaver is only marked absent, which keeps slot indices, the
/// scoreboard and rejoins stable for the whole game.
#[derive(Clone, Debug)]
struct PlayerSlot {
    player: Player,
    present: bool,
}

/// The state of the current turn.
#[derive(Debug)]
pub(crate) struct GameTurn {
    pub(crate) curr_word: String,
    /// Index of the drawer within the slot list; `None` until the first turn.
    pub(crate) curr_player_index: Option<usize>,
    canvas: Vec<Circle>,
    guessers: HashSet<Uuid>,
    start_time_secs: i64,
}

/// A drawing saved mid-turn, handed to the persistence handler.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub canvas: String,
    pub created_by: Option<Player>,
    pub saved_by: Player,
}

/// One player's terminal summary of a finished game.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameResult {
    pub player_id: Uuid,
    pub points: i64,
    pub win: bool,
    pub words_guessed: i64,
    pub drawings_guessed: i64,
}

pub struct GameState {
    pub(crate) code: String,
    pub(crate) curr_round: u32,
    players: Vec<PlayerSlot>,
    score_board: HashMap<Uuid, Score>,
    chat_log: Vec<Chat>,
    pub(crate) stage: Stage,
    pub(crate) turn: GameTurn,
    pub(crate) settings: RoomSettings,
}

impl GameState {
    pub fn new(code: String, settings: RoomSettings) -> GameState {
        GameState {
            code,
            curr_round: 0,
            players: Vec::new(),
            score_board: HashMap::new(),
            chat_log: Vec::new(),
            stage: Stage::Lobby,
            turn: GameTurn {
                curr_word: String::new(),
                curr_player_index: None,
                canvas: Vec::new(),
                guessers: HashSet::new(),
                start_time_secs: unix_now(),
            },
            settings,
        }
    }

    fn player_index(&self, player: &Player) -> Option<usize> {
        self.players.iter().position(|slot| slot.player.id == player.id)
    }

    fn present_count(&self) -> usize {
        self.players.iter().filter(|slot| slot.present).count()
    }

    /// All present players, in join order.
    pub fn present_players(&self) -> Vec<Player> {
        self.players
            .iter()
            .filter(|slot| slot.present)
            .map(|slot| slot.player.clone())
            .collect()
    }

    /// Adds the player, or marks them present again on a rejoin. Returns the
    /// player's slot index. A rejoin always succeeds; a fresh join fails once
    /// the present population has reached the player limit.
    pub fn join(&mut self, player: Player) -> Result<usize, GameError> {
        if let Some(index) = self.player_index(&player) {
            self.players[index].present = true;
            self.score_board.entry(player.id).or_default();
            return Ok(index);
        }

        if self.present_count() >= self.settings.player_limit {
            return Err(GameError::RoomFull);
        }

        let id = player.id;
        self.players.push(PlayerSlot { player, present: true });
        self.score_board.entry(id).or_default();
        Ok(self.players.len() - 1)
    }

    /// Marks the player absent, keeping the slot. Returns the slot index, or
    /// `None` when the player never joined.
    pub fn leave(&mut self, player: &Player) -> Option<usize> {
        let index = self.player_index(player)?;
        self.players[index].present = false;
        Some(index)
    }

    /// The host is whoever occupies the first slot.
    pub fn player_is_not_host(&self, player: &Player) -> bool {
        self.players.first().map(|slot| slot.player.id) != Some(player.id)
    }

    /// The player whose turn it is to draw, if a turn has begun.
    pub fn curr_player(&self) -> Option<&Player> {
        let index = self.turn.curr_player_index?;
        self.players.get(index).map(|slot| &slot.player)
    }

    /// Advances the drawer to the next slot. Wrapping back to the first slot
    /// completes a rotation and advances the round counter.
    fn cycle_curr_player(&mut self) {
        let next = match self.turn.curr_player_index {
            None => 0,
            Some(index) => index + 1,
        };
        if next >= self.players.len() {
            self.turn.curr_player_index = Some(0);
            self.curr_round += 1;
        } else {
            self.turn.curr_player_index = Some(next);
        }
    }

    /// Picks the word for the next turn, stored lowercased. With both banks
    /// populated a fair coin decides which one is drawn from.
    fn set_next_word(&mut self) -> Result<(), GameError> {
        let shared = &self.settings.shared_word_bank;
        let custom = &self.settings.custom_word_bank;
        let mut rng = rand::thread_rng();

        let word = if shared.is_empty() && custom.is_empty() {
            return Err(GameError::NoWords);
        } else if custom.is_empty() {
            shared.choose(&mut rng)
        } else if shared.is_empty() {
            custom.choose(&mut rng)
        } else if rng.gen_bool(0.5) {
            shared.choose(&mut rng)
        } else {
            custom.choose(&mut rng)
        };

        if let Some(word) = word {
            self.turn.curr_word = word.to_lowercase();
        }
        Ok(())
    }

    /// Sets up a fresh turn for the current drawer.
    fn begin_turn(&mut self) -> Result<(), GameError> {
        self.stage = Stage::Playing;
        self.turn.guessers.clear();
        self.turn.canvas.clear();
        self.set_next_word()?;
        self.turn.start_time_secs = unix_now();
        Ok(())
    }

    /// Starts the game: advances to the next drawer and begins their turn.
    pub fn start_game(&mut self) -> Result<(), GameError> {
        self.cycle_curr_player();
        self.begin_turn()
    }

    /// End-of-turn rotation: advances the drawer and either begins the next
    /// turn (`true`) or finishes the game (`false`). A game whose word banks
    /// have run dry finishes the same way a completed rotation does.
    pub fn next_turn(&mut self) -> bool {
        self.cycle_curr_player();
        if self.has_more_rounds() && self.begin_turn().is_ok() {
            return true;
        }
        self.finish_game();
        false
    }

    pub fn has_more_rounds(&self) -> bool {
        self.curr_round < self.settings.total_rounds
    }

    pub fn finish_game(&mut self) {
        self.stage = Stage::Post;
    }

    /// Evaluates the text as a guess and appends the resulting chat entry.
    /// A scoring guess is logged with an empty text so the word never leaks
    /// through the chat log or the broadcast.
    pub fn try_guess(&mut self, player: &Player, text: &str) -> Chat {
        let points_inc = self.guess(player, text);

        let mut chat = Chat {
            player: player.clone(),
            text: String::new(),
            guess_points_inc: points_inc,
        };
        if points_inc == 0 {
            chat.text = text.to_owned();
        }

        self.chat_log.push(chat.clone());
        chat
    }

    /// Scores a guess, returning the point increment. Zero when the game is
    /// not running, the guesser is the drawer, no token matches the word, or
    /// the guesser already scored this turn.
    fn guess(&mut self, guesser: &Player, text: &str) -> i64 {
        if self.stage != Stage::Playing {
            return 0;
        }
        if self.curr_player().map(|p| p.id) == Some(guesser.id) {
            return 0;
        }
        if !self.contains_curr_word(text) {
            return 0;
        }
        if self.turn.guessers.contains(&guesser.id) {
            return 0;
        }

        let elapsed = unix_now() - self.turn.start_time_secs;
        let limit = self.settings.time_limit_secs;
        let points_inc = (limit - elapsed) / limit * 400 + 50;
        self.inc_score(guesser.id, Score { points: points_inc, words: 1, drawings: 0 });

        self.turn.guessers.insert(guesser.id);
        points_inc
    }

    fn contains_curr_word(&self, text: &str) -> bool {
        text.split_whitespace()
            .any(|word| word.to_lowercase() == self.turn.curr_word)
    }

    fn inc_score(&mut self, player_id: Uuid, inc: Score) {
        let score = self.score_board.entry(player_id).or_default();
        score.points += inc.points;
        score.words += inc.words;
        score.drawings += inc.drawings;
    }

    /// Credits the drawer's end-of-turn bonus: 50 points per correct guesser
    /// plus one finished drawing. Returns the point increment.
    pub fn on_reset(&mut self) -> i64 {
        let points_inc = self.turn.guessers.len() as i64 * 50;
        if let Some(drawer_id) = self.curr_player().map(|p| p.id) {
            self.inc_score(drawer_id, Score { points: points_inc, words: 0, drawings: 1 });
        }
        points_inc
    }

    pub fn draw(&mut self, stroke: Circle) {
        self.turn.canvas.push(stroke);
    }

    pub fn encode_canvas(&self) -> String {
        encode_canvas(&self.turn.canvas)
    }

    pub fn capture(&self, requester: &Player) -> Snapshot {
        Snapshot {
            canvas: self.encode_canvas(),
            created_by: self.curr_player().cloned(),
            saved_by: requester.clone(),
        }
    }

    /// One result per scoreboard entry, ranked by points. Only the top entry
    /// is a win, even on a tie.
    pub fn create_game_results(&self) -> Vec<GameResult> {
        let mut results: Vec<GameResult> = self
            .score_board
            .iter()
            .map(|(id, score)| GameResult {
                player_id: *id,
                points: score.points,
                win: false,
                words_guessed: score.words,
                drawings_guessed: score.drawings,
            })
            .collect();

        results.sort_by(|a, b| b.points.cmp(&a.points));
        if let Some(top) = results.first_mut() {
            top.win = true;
        }
        results
    }

    /// The client-facing snapshot sent in a STATE frame. Absent players are
    /// filtered out and the word banks are never included.
    pub(crate) fn client_state(&self) -> StateSnapshot<'_> {
        StateSnapshot {
            curr_round: self.curr_round,
            players: self
                .players
                .iter()
                .filter(|slot| slot.present)
                .map(|slot| &slot.player)
                .collect(),
            score_board: &self.score_board,
            chat_log: &self.chat_log,
            stage: self.stage,
            turn: TurnSnapshot {
                curr_word: &self.turn.curr_word,
                curr_player: self.curr_player(),
                canvas: self.encode_canvas(),
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StateSnapshot<'a> {
    curr_round: u32,
    players: Vec<&'a Player>,
    score_board: &'a HashMap<Uuid, Score>,
    chat_log: &'a [Chat],
    stage: Stage,
    turn: TurnSnapshot<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnSnapshot<'a> {
    curr_word: &'a str,
    curr_player: Option<&'a Player>,
    canvas: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_settings() -> RoomSettings {
        RoomSettings {
            player_limit: 8,
            total_rounds: 3,
            time_limit_secs: 45,
            custom_word_bank: Vec::new(),
            shared_word_bank: vec!["quick".into(), "fox".into()],
            is_public: false,
        }
    }

    fn named(name: &str) -> Player {
        Player { id: Uuid::new_v4(), name: name.to_owned() }
    }

    #[test]
    fn join_appends_players_and_scores() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let player1 = named("a");
        let player2 = named("b");

        assert_eq!(state.join(player1.clone()).unwrap(), 0);
        assert_eq!(state.join(player2.clone()).unwrap(), 1);

        assert_eq!(state.present_players(), vec![player1.clone(), player2.clone()]);
        assert_eq!(state.score_board.len(), 2);
        assert_eq!(state.score_board[&player1.id], Score::default());
        assert_eq!(state.score_board[&player2.id], Score::default());
    }

    #[test]
    fn rejoin_keeps_the_original_slot() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let player1 = named("a");
        let player2 = named("b");

        state.join(player1.clone()).unwrap();
        state.join(player2.clone()).unwrap();
        state.leave(&player1).unwrap();

        assert_eq!(state.join(player1.clone()).unwrap(), 0);
        assert_eq!(state.present_players(), vec![player1, player2]);
        assert_eq!(state.players.len(), 2);
    }

    #[test]
    fn join_rejects_when_present_players_reach_the_limit() {
        let mut settings = mock_settings();
        settings.player_limit = 2;
        let mut state = GameState::new("1234".into(), settings);
        let player1 = named("a");

        state.join(player1.clone()).unwrap();
        state.join(named("b")).unwrap();
        assert!(matches!(state.join(named("c")), Err(GameError::RoomFull)));

        // a leaver frees a seat, and a rejoin never counts against the limit
        state.leave(&player1).unwrap();
        state.join(named("c")).unwrap();
        assert_eq!(state.join(player1).unwrap(), 0);
    }

    #[test]
    fn leave_marks_absent_but_keeps_the_slot() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let player1 = named("a");
        let player2 = named("b");
        state.join(player1.clone()).unwrap();
        state.join(player2.clone()).unwrap();

        assert_eq!(state.leave(&player2), Some(1));
        assert_eq!(state.present_players(), vec![player1]);
        assert_eq!(state.players.len(), 2);
    }

    #[test]
    fn leave_of_a_stranger_reports_none() {
        let mut state = GameState::new("1234".into(), mock_settings());
        state.join(named("a")).unwrap();
        assert_eq!(state.leave(&named("x")), None);
    }

    #[test]
    fn start_game_begins_the_first_turn() {
        let mut state = GameState::new("1234".into(), mock_settings());
        state.join(named("a")).unwrap();

        state.start_game().unwrap();

        assert_eq!(state.stage, Stage::Playing);
        assert_eq!(state.turn.curr_player_index, Some(0));
        assert_eq!(state.curr_round, 0);
        assert!(!state.turn.curr_word.is_empty());
    }

    #[test]
    fn words_come_from_the_custom_bank_when_shared_is_empty() {
        let mut settings = mock_settings();
        settings.shared_word_bank = Vec::new();
        settings.custom_word_bank = vec!["Banana".into()];
        let mut state = GameState::new("1234".into(), settings);
        state.join(named("a")).unwrap();

        state.start_game().unwrap();
        assert_eq!(state.turn.curr_word, "banana");
    }

    #[test]
    fn starting_with_no_words_fails() {
        let mut settings = mock_settings();
        settings.shared_word_bank = Vec::new();
        let mut state = GameState::new("1234".into(), settings);
        state.join(named("a")).unwrap();

        assert!(matches!(state.start_game(), Err(GameError::NoWords)));
    }

    #[test]
    fn correct_guess_scores_and_hides_the_word() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let drawer = named("drawer");
        let guesser = named("guesser");
        state.join(drawer).unwrap();
        state.join(guesser.clone()).unwrap();
        state.stage = Stage::Playing;
        state.turn.curr_word = "quick".into();
        state.turn.curr_player_index = Some(0);
        state.turn.start_time_secs = unix_now();

        let chat = state.try_guess(&guesser, "the QUICK brown fox");

        assert!(chat.guess_points_inc >= 50);
        assert_eq!(chat.text, "");
        assert!(state.turn.guessers.contains(&guesser.id));
        let score = state.score_board[&guesser.id];
        assert_eq!(score.words, 1);
        assert_eq!(score.points, chat.guess_points_inc);
    }

    #[test]
    fn wrong_guess_keeps_its_text_and_scores_nothing() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let guesser = named("guesser");
        state.join(named("drawer")).unwrap();
        state.join(guesser.clone()).unwrap();
        state.stage = Stage::Playing;
        state.turn.curr_word = "fast".into();
        state.turn.curr_player_index = Some(0);

        let chat = state.try_guess(&guesser, "the quick brown fox");

        assert_eq!(chat.guess_points_inc, 0);
        assert_eq!(chat.text, "the quick brown fox");
        assert_eq!(state.chat_log.len(), 1);
    }

    #[test]
    fn the_drawer_cannot_guess() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let drawer = named("drawer");
        state.join(drawer.clone()).unwrap();
        state.stage = Stage::Playing;
        state.turn.curr_word = "quick".into();
        state.turn.curr_player_index = Some(0);

        assert_eq!(state.try_guess(&drawer, "the quick brown fox").guess_points_inc, 0);
    }

    #[test]
    fn a_player_scores_at_most_once_per_turn() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let guesser = named("guesser");
        state.join(named("drawer")).unwrap();
        state.join(guesser.clone()).unwrap();
        state.stage = Stage::Playing;
        state.turn.curr_word = "quick".into();
        state.turn.curr_player_index = Some(0);

        assert!(state.try_guess(&guesser, "the quick brown fox").guess_points_inc > 0);
        assert_eq!(state.try_guess(&guesser, "the quick brown fox").guess_points_inc, 0);
    }

    #[test]
    fn guessing_outside_the_playing_stage_scores_nothing() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let guesser = named("guesser");
        state.join(guesser.clone()).unwrap();
        state.turn.curr_word = "quick".into();

        assert_eq!(state.try_guess(&guesser, "maybe quick").guess_points_inc, 0);
    }

    #[test]
    fn reset_credits_the_drawer_per_guesser() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let drawer = named("drawer");
        let g1 = named("g1");
        let g2 = named("g2");
        state.join(drawer.clone()).unwrap();
        state.join(g1.clone()).unwrap();
        state.join(g2.clone()).unwrap();
        state.stage = Stage::Playing;
        state.turn.curr_word = "quick".into();
        state.turn.curr_player_index = Some(0);
        state.turn.start_time_secs = unix_now();
        state.try_guess(&g1, "quick quick");
        state.try_guess(&g2, "quick quick");

        assert_eq!(state.on_reset(), 100);
        let score = state.score_board[&drawer.id];
        assert_eq!(score.points, 100);
        assert_eq!(score.drawings, 1);
    }

    #[test]
    fn rotation_advances_drawers_then_finishes() {
        let mut settings = mock_settings();
        settings.total_rounds = 1;
        let mut state = GameState::new("1234".into(), settings);
        state.join(named("a")).unwrap();
        state.join(named("b")).unwrap();
        state.join(named("c")).unwrap();

        state.start_game().unwrap();
        assert_eq!(state.turn.curr_player_index, Some(0));
        assert_eq!(state.curr_round, 0);

        assert!(state.next_turn());
        assert_eq!(state.turn.curr_player_index, Some(1));
        assert!(state.next_turn());
        assert_eq!(state.turn.curr_player_index, Some(2));

        // the wrap past the last drawer completes the only round
        assert!(!state.next_turn());
        assert_eq!(state.turn.curr_player_index, Some(0));
        assert_eq!(state.curr_round, 1);
        assert_eq!(state.stage, Stage::Post);
    }

    #[test]
    fn a_dry_word_bank_ends_the_game_at_the_next_rotation() {
        let mut state = GameState::new("1234".into(), mock_settings());
        state.join(named("a")).unwrap();
        state.join(named("b")).unwrap();
        state.start_game().unwrap();

        state.settings.shared_word_bank = Vec::new();
        state.settings.custom_word_bank = Vec::new();

        assert!(!state.next_turn());
        assert_eq!(state.stage, Stage::Post);
    }

    #[test]
    fn results_are_ranked_with_a_single_winner() {
        let mut state = GameState::new("1234".into(), mock_settings());
        state.score_board = HashMap::from([
            (Uuid::new_v4(), Score { points: 100, words: 1, drawings: 2 }),
            (Uuid::new_v4(), Score { points: 200, words: 2, drawings: 2 }),
            (Uuid::new_v4(), Score { points: 250, words: 3, drawings: 2 }),
        ]);

        let results = state.create_game_results();

        assert_eq!(results.iter().map(|r| r.points).collect::<Vec<_>>(), vec![250, 200, 100]);
        assert!(results[0].win);
        assert!(results[1..].iter().all(|r| !r.win));
    }

    #[test]
    fn canvas_survives_an_encode_decode_round_trip() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let strokes = [
            Circle { color: 4, radius: 3, x: 2, y: 1, connected: true },
            Circle { color: 5, radius: 0, x: 1, y: 2, connected: false },
        ];
        for stroke in strokes {
            state.draw(stroke);
        }

        let encoded = state.encode_canvas();
        assert_eq!(protocol::decode_canvas(&encoded).unwrap(), strokes);
    }

    #[test]
    fn client_state_hides_absentees_and_word_banks() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let stayer = named("stayer");
        let leaver = named("leaver");
        state.join(stayer.clone()).unwrap();
        state.join(leaver.clone()).unwrap();
        state.leave(&leaver).unwrap();

        let encoded = serde_json::to_string(&state.client_state()).unwrap();

        assert!(encoded.contains("stayer"));
        assert!(!encoded.contains("\"name\":\"leaver\""));
        assert!(!encoded.contains("WordBank"));
        // the scoreboard still remembers everyone who ever joined
        assert!(encoded.contains(&leaver.id.to_string()));
    }

    #[test]
    fn capture_records_drawer_and_requester() {
        let mut state = GameState::new("1234".into(), mock_settings());
        let drawer = named("drawer");
        let saver = named("saver");
        state.join(drawer.clone()).unwrap();
        state.join(saver.clone()).unwrap();
        state.turn.curr_player_index = Some(0);
        state.draw(Circle { color: 1, radius: 1, x: 5, y: 5, connected: false });

        let snapshot = state.capture(&saver);

        assert_eq!(snapshot.created_by, Some(drawer));
        assert_eq!(snapshot.saved_by, saver);
        assert!(!snapshot.canvas.is_empty());
    }
}
