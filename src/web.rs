use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info};

/// Snapshot served by the status endpoint. Each control loop overwrites
/// its own slot after every cycle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ServerState {
    pub devices: Vec<DeviceSnapshot>,
}

impl ServerState {
    pub fn with_devices(urls: &[String]) -> ServerState {
        ServerState {
            devices: urls
                .iter()
                .map(|url| DeviceSnapshot {
                    url: url.clone(),
                    ..DeviceSnapshot::default()
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub url: String,
    pub mode: Option<String>,
    pub running: bool,
    pub target: Option<f64>,
    pub is_holiday: bool,
    pub is_peak: bool,
    pub fan_forced: bool,
    pub last_update: Option<i64>,
    pub last_on: Option<i64>,
}

pub type SharedState = Arc<RwLock<ServerState>>;

pub async fn create_web_server(state: SharedState, listen: SocketAddr) {
    let app = Router::new()
        .route("/api/status", get(get_status))
        .with_state(state);

    info!(%listen, "starting status server");
    let listener = match tokio::net::TcpListener::bind(listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind status server");
            return;
        }
    };
    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "status server exited");
    }
}

async fn get_status(State(state): State<SharedState>) -> Json<ServerState> {
    let snapshot = state.read().unwrap().clone();
    Json(snapshot)
}
