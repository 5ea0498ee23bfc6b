mod auth;
mod db;
mod handlers;
mod room;
mod settings;
mod state;
mod store;
mod transport;

use crate::auth::Authenticator;
use crate::db::DbHandler;
use crate::room::{Room, RoomHandle};
use crate::settings::RoomSettings;
use crate::state::GameState;
use crate::store::BrokerStore;
use anyhow::Context;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The shared word bank every room draws from.
const WORDS: &str = include_str!("../words.txt");

/// How many public codes one listing page returns.
const ROOMS_PAGE_SIZE: usize = 20;

/// How often the sweeper looks for expired rooms.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

struct AppState {
    rooms: Arc<BrokerStore<RoomHandle>>,
    auth: Authenticator,
    handler: DbHandler,
    word_bank: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true),
        )
        .init();

    let jwt_secret = std::env::var("JWT_SECRET_KEY").context("JWT_SECRET_KEY must be set")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let port: u16 = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080);

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect_lazy(&database_url)
        .context("invalid DATABASE_URL")?;

    let word_bank: Vec<String> = WORDS
        .lines()
        .map(str::trim)
        .filter(|word| !word.is_empty())
        .map(str::to_owned)
        .collect();
    anyhow::ensure!(!word_bank.is_empty(), "the embedded word bank is empty");

    let app_state = Arc::new(AppState {
        rooms: BrokerStore::new(SWEEP_PERIOD),
        auth: Authenticator::new(&jwt_secret),
        handler: DbHandler::new(pool),
        word_bank,
    });

    let app = Router::new()
        .route("/api/rooms/create", post(create_room))
        .route("/api/rooms", get(get_rooms))
        .route("/api/rooms/join", get(join_room))
        .route("/api/session", get(establish_session))
        .with_state(app_state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .fallback_service(ServeDir::new("dist").not_found_service(ServeFile::new("dist/index.html")));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "starting the sketch server");
    axum::serve(listener, app).await?;
    Ok(())
}

/// An 8-character hex room code from the system's crypto RNG.
fn hex_code(hex_len: usize) -> Result<String, rand::Error> {
    let mut raw = vec![0u8; hex_len / 2];
    OsRng.try_fill_bytes(&mut raw)?;
    Ok(raw.iter().map(|b| format!("{b:02x}")).collect())
}

#[derive(Serialize)]
struct RoomCodeResp {
    code: String,
    settings: RoomSettings,
}

/// Builds a room from the posted settings, spawns its loop, and stores it.
async fn create_room(
    State(app): State<Arc<AppState>>,
    Json(mut settings): Json<RoomSettings>,
) -> Response {
    settings.with_defaults();
    settings.shared_word_bank = app.word_bank.clone();
    if let Err(err) = settings.validate() {
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }

    let code = match hex_code(8) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "failed to generate a room code");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate a valid room code")
                .into_response();
        }
    };

    let initial_state = GameState::new(code.clone(), settings.clone());
    let (handle, room) = Room::new(initial_state, app.handler.clone());
    tokio::spawn(room.run());
    app.rooms.set(code.clone(), handle).await;

    tracing::info!(code = %code, "started a new room");
    Json(RoomCodeResp { code, settings }).into_response()
}

#[derive(Deserialize)]
struct GetRoomsQuery {
    #[serde(default)]
    offset: usize,
}

async fn get_rooms(
    State(app): State<Arc<AppState>>,
    Query(query): Query<GetRoomsQuery>,
) -> Json<Vec<String>> {
    Json(app.rooms.codes(query.offset, ROOMS_PAGE_SIZE).await)
}

#[derive(Deserialize)]
struct JoinRoomQuery {
    code: String,
    token: Option<String>,
}

/// Upgrades the connection and hands it to the room as a fresh subscriber.
async fn join_room(
    ws: WebSocketUpgrade,
    State(app): State<Arc<AppState>>,
    Query(query): Query<JoinRoomQuery>,
) -> Response {
    let player = app.auth.player_from_token(query.token.as_deref());

    let Some(room) = app.rooms.get(&query.code).await else {
        return (StatusCode::NOT_FOUND, "Cannot find room for provided code").into_response();
    };

    tracing::info!(code = %query.code, player = %player.name, "upgrading connection for room");
    ws.on_upgrade(move |socket| transport::client_session(socket, room, player))
}

#[derive(Serialize)]
struct TokenResp {
    token: String,
}

async fn establish_session(State(app): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let token = headers.get("token").and_then(|value| value.to_str().ok());
    match app.auth.establish_session(token) {
        Ok(token) => Json(TokenResp { token }).into_response(),
        Err(err) => {
            tracing::error!(%err, "failed to establish a session");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to establish a session").into_response()
        }
    }
}
