//! Postgres persistence for finished games and saved drawings. Everything
//! here runs on spawned tasks: the room loop hands results over and moves
//! on, and a database failure is logged, never surfaced to players.

use crate::room::RoomHandler;
use crate::state::{GameResult, Snapshot};
use sqlx::PgPool;
use uuid::Uuid;

/// The side-effect handler wired into every room.
#[derive(Clone)]
pub struct DbHandler {
    pool: PgPool,
}

impl DbHandler {
    pub fn new(pool: PgPool) -> DbHandler {
        DbHandler { pool }
    }
}

impl RoomHandler for DbHandler {
    fn do_shutdown(&self, results: Vec<GameResult>) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(err) = update_stats(&pool, &results).await {
                tracing::warn!(%err, "failed to persist game results");
            }
        });
    }

    fn do_capture(&self, snapshot: Snapshot) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(err) = save_snapshot(&pool, &snapshot).await {
                tracing::warn!(%err, "failed to persist drawing snapshot");
            }
        });
    }
}

/// Applies every player's result to their lifetime stats in one transaction.
pub async fn update_stats(pool: &PgPool, results: &[GameResult]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for result in results {
        sqlx::query(
            "UPDATE players
             SET points = points + $1,
                 wins = wins + $2,
                 words_guessed = words_guessed + $3,
                 drawings_guessed = drawings_guessed + $4
             WHERE id = $5",
        )
        .bind(result.points)
        .bind(i64::from(result.win))
        .bind(result.words_guessed)
        .bind(result.drawings_guessed)
        .bind(result.player_id.to_string())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Stores one saved drawing with its encoded canvas as the signature.
pub async fn save_snapshot(pool: &PgPool, snapshot: &Snapshot) -> Result<(), sqlx::Error> {
    let Some(created_by) = &snapshot.created_by else {
        tracing::debug!("skipping snapshot with no drawer");
        return Ok(());
    };

    sqlx::query(
        "INSERT INTO drawings (id, created_by, saved_by, signature)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(created_by.id.to_string())
    .bind(snapshot.saved_by.id.to_string())
    .bind(&snapshot.canvas)
    .execute(pool)
    .await?;
    Ok(())
}
