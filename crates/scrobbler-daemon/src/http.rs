use crate::worker::{WorkerEvent, WorkerSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use scrobbler_proto::protocol::BrowserCommand;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    event_tx: mpsc::Sender<WorkerEvent>,
}

pub fn router(event_tx: mpsc::Sender<WorkerEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/command/:name", get(run_command).post(run_command))
        .with_state(HttpState { event_tx })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    event_tx: mpsc::Sender<WorkerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Result<Json<WorkerSnapshot>, StatusCode> {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .event_tx
        .send(WorkerEvent::Snapshot(reply_tx))
        .await
        .is_err()
    {
        error!("Failed to request worker snapshot");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    reply_rx
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn run_command(State(state): State<HttpState>, Path(name): Path<String>) -> StatusCode {
    let Some(command) = BrowserCommand::parse(&name) else {
        return StatusCode::NOT_FOUND;
    };
    info!("HTTP API: command {}", command.as_str());
    if state
        .event_tx
        .send(WorkerEvent::Command(command))
        .await
        .is_err()
    {
        error!("Failed to send {} command", command.as_str());
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}
