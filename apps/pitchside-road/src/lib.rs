//! Signaling server for Pitchside network matches.
//!
//! `/handshake` pairs a host and a joiner through a short numeric code.
//! `/rooms/:session_id` relays WebRTC offers, answers and ICE candidates
//! between the two peers of a session.

pub mod config;
pub mod handshake;
pub mod protocol;
pub mod rooms;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::handshake::{PendingPairings, handshake_handler};
use crate::rooms::{Rooms, room_handler};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub pairings: Arc<PendingPairings>,
    pub rooms: Arc<Rooms>,
}

impl AppState {
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            pairings: Arc::new(PendingPairings::new(pending_ttl)),
            rooms: Arc::new(Rooms::new()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    pending_pairings: usize,
    rooms: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        pending_pairings: state.pairings.len(),
        rooms: state.rooms.room_count(),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/handshake", get(handshake_handler))
        .route("/rooms/:session_id", get(room_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Periodically expire unclaimed pairing codes.
pub fn spawn_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let expired = state.pairings.sweep();
            if expired > 0 {
                debug!("expired {} pairing codes", expired);
            }
        }
    })
}

pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let sweeper = spawn_sweeper(state.clone());
    let result = axum::serve(listener, router(state)).await;
    sweeper.abort();
    result
}
