use std::convert::Infallible;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::DiscoveryError,
    session::DiscoveryService,
    types::DiscoveryOverrides,
};

#[derive(Clone)]
pub struct AppState {
    service: DiscoveryService,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Started {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: &DiscoveryError) -> Response {
    let status = match err {
        DiscoveryError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        DiscoveryError::Configuration(_) => StatusCode::BAD_REQUEST,
        DiscoveryError::Concurrency(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Routes of the discovery API, mounted under `/api`.
pub fn router(service: DiscoveryService) -> Router {
    let state = AppState { service };

    let api = Router::new()
        .route("/discovery", get(list_sessions).post(start_session))
        .route("/discovery/events", get(events))
        .route("/discovery/{id}", delete(stop_session))
        .route("/discovery/{id}/progress", get(get_progress))
        .route("/discovery/{id}/results", get(get_results))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, service: DiscoveryService) -> Result<()> {
    let app = router(service.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving discovery API on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    service.cleanup().await;
    Ok(())
}

async fn list_sessions(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.service.sessions().await)
}

async fn start_session(
    State(app): State<AppState>,
    Json(overrides): Json<DiscoveryOverrides>,
) -> Response {
    let session_id = Uuid::new_v4().to_string();

    match app.service.spawn(&session_id, overrides).await {
        Ok(handle) => {
            let id = session_id.clone();
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(session = %id, error = %e, "discovery session failed"),
                    Err(e) => warn!(session = %id, error = %e, "discovery task aborted"),
                }
            });
            (StatusCode::ACCEPTED, Json(Started { session_id })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn stop_session(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    match app.service.stop(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_progress(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    match app.service.progress(&id).await {
        Ok(p) => (StatusCode::OK, Json(p)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_results(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    match app.service.results(&id).await {
        Ok(r) => (StatusCode::OK, Json(r)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = app.service.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let event = Event::default()
                        .json_data(&ev)
                        .unwrap_or_else(|_| Event::default().comment("unserializable event"));
                    return Some((Ok(event), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
