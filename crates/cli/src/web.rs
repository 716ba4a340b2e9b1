use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use czkawka_web_core::{Error, Result, ScanJob, ScanManager, ScanRequest};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

pub async fn serve(manager: ScanManager, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let server = axum::Server::try_bind(&addr).map_err(|err| Error::Io(std::io::Error::other(err)))?;
    info!(%addr, "czkawka-web API listening");

    server
        .serve(router(manager).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| Error::Io(std::io::Error::other(err)))?;

    info!("server stopped");
    Ok(())
}

pub fn router(manager: ScanManager) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/scans", get(list_scans_handler).post(start_scan_handler))
        .route(
            "/api/scans/:id",
            get(get_scan_handler).delete(cancel_scan_handler),
        )
        .route("/api/scans/:id/events", get(scan_events_handler))
        .with_state(manager)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
}

#[derive(Serialize)]
struct HealthDto {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorDto {
    error: String,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorDto {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> Json<HealthDto> {
    Json(HealthDto {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_scans_handler(State(manager): State<ScanManager>) -> Json<Vec<ScanJob>> {
    Json(manager.list_scans().await)
}

async fn start_scan_handler(
    State(manager): State<ScanManager>,
    Json(request): Json<ScanRequest>,
) -> std::result::Result<(StatusCode, Json<ScanJob>), ApiError> {
    let job = manager.start_scan(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_scan_handler(
    State(manager): State<ScanManager>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ScanJob>, ApiError> {
    Ok(Json(manager.get_scan(&id).await?))
}

async fn cancel_scan_handler(
    State(manager): State<ScanManager>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ScanJob>, ApiError> {
    Ok(Json(manager.cancel_scan(&id).await?))
}

async fn scan_events_handler(
    State(manager): State<ScanManager>,
    Path(id): Path<String>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, ApiError> {
    let mut subscription = manager.subscribe_progress(&id).await?;
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            let event = match Event::default().json_data(&message) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "failed to encode progress event");
                    continue;
                }
            };
            if tx.send(event).await.is_err() {
                debug!(scan_id = %subscription.scan_id(), "event stream client went away");
                break;
            }
        }
        manager.unsubscribe_progress(subscription);
    });

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok)))
}
