//! Session tokens and the guest fallback. A valid token pins a stable player
//! identity across connections; anything else gets a throwaway guest.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use protocol::Player;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to process session token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// The claims carried by a session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub id: Uuid,
    pub name: String,
    pub guest: bool,
    pub exp: i64,
}

pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Authenticator {
    pub fn new(secret: &str) -> Authenticator {
        Authenticator {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue_token(&self, player: &Player, guest: bool) -> Result<String, AuthError> {
        let claims = SessionClaims {
            id: player.id,
            name: player.name.clone(),
            guest,
            exp: (Utc::now() + chrono::Duration::hours(SESSION_TTL_HOURS)).timestamp(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn session(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let data = decode::<SessionClaims>(token, &self.decoding, &Validation::default())?;
        Ok(data.claims)
    }

    /// The player behind a join request: the token's identity when it checks
    /// out, a fresh guest otherwise.
    pub fn player_from_token(&self, token: Option<&str>) -> Player {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => match self.session(token) {
                Ok(claims) => Player { id: claims.id, name: claims.name },
                Err(err) => {
                    tracing::debug!(%err, "invalid session token, assigning a guest");
                    guest_player()
                }
            },
            None => guest_player(),
        }
    }

    /// Echoes a valid token, or issues a fresh guest session.
    pub fn establish_session(&self, token: Option<&str>) -> Result<String, AuthError> {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            if self.session(token).is_ok() {
                return Ok(token.to_owned());
            }
        }
        self.issue_token(&guest_player(), true)
    }
}

pub fn guest_player() -> Player {
    Player {
        id: Uuid::new_v4(),
        name: format!("Guest {}", rand::thread_rng().gen_range(10..99)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guests_get_two_digit_names_and_unique_ids() {
        for _ in 0..50 {
            let guest = guest_player();
            let number: u32 = guest.name.strip_prefix("Guest ").unwrap().parse().unwrap();
            assert!((10..99).contains(&number));
        }
        assert_ne!(guest_player().id, guest_player().id);
    }

    #[test]
    fn tokens_round_trip_the_player_identity() {
        let auth = Authenticator::new("a-test-secret");
        let player = Player { id: Uuid::new_v4(), name: "ada".into() };

        let token = auth.issue_token(&player, false).unwrap();
        let resolved = auth.player_from_token(Some(&token));

        assert_eq!(resolved, player);
    }

    #[test]
    fn bad_tokens_fall_back_to_a_guest() {
        let auth = Authenticator::new("a-test-secret");
        let resolved = auth.player_from_token(Some("not-a-token"));
        assert!(resolved.name.starts_with("Guest "));

        let missing = auth.player_from_token(None);
        assert!(missing.name.starts_with("Guest "));
    }

    #[test]
    fn establish_session_echoes_valid_tokens() {
        let auth = Authenticator::new("a-test-secret");

        let issued = auth.establish_session(None).unwrap();
        let claims = auth.session(&issued).unwrap();
        assert!(claims.guest);

        assert_eq!(auth.establish_session(Some(&issued)).unwrap(), issued);
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let ours = Authenticator::new("a-test-secret");
        let theirs = Authenticator::new("another-secret");
        let player = Player { id: Uuid::new_v4(), name: "eve".into() };

        let forged = theirs.issue_token(&player, false).unwrap();
        assert!(ours.session(&forged).is_err());
    }
}
