use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use validator_protocol::{RunEvent, RunRequest, ValidatorCommand};
use validator_runner::Runner;

use crate::auth::{require_operator, Credentials, Operator};
use crate::registry::{RunRegistry, StatusSnapshot};
use crate::results::{self, ResultFile, ResultsError};

const RUN_EVENT_BUFFER: usize = 256;
const DASHBOARD_HTML: &str = include_str!("../static/dashboard.html");

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) runner: Arc<Runner>,
    pub(crate) registry: Arc<RunRegistry>,
    pub(crate) credentials: Arc<Credentials>,
    pub(crate) output_dir: Arc<PathBuf>,
    pub(crate) thresholds_file: Arc<PathBuf>,
}

pub(crate) fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/", get(dashboard))
        .route("/commands", get(list_commands))
        .route("/defaults", get(run_defaults))
        .route("/run", get(run_stream))
        .route("/status", get(status))
        .route("/results", get(list_results))
        .route("/results/:name", get(get_result))
        .route("/results/:name/raw", get(download_result))
        .route("/clean", post(clean_results))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(middleware::from_fn(log_http_request))
}

async fn health() -> &'static str {
    "ok"
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        "http request"
    );
    response
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn list_commands() -> Json<[ValidatorCommand; 7]> {
    Json(ValidatorCommand::ALL)
}

#[derive(Serialize)]
struct RunDefaults {
    default_url: String,
}

/// Form hints; the URL is the one the script falls back to when none is given.
async fn run_defaults(State(state): State<AppState>) -> Json<RunDefaults> {
    let default_url = crate::thresholds::read_default_url(&state.thresholds_file)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(
                file = %state.thresholds_file.display(),
                error = %err,
                "failed to read validator settings"
            );
            String::new()
        });
    Json(RunDefaults { default_url })
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.registry.snapshot())
}

/// Streams one run as server-sent events. The stream ends after the terminal event;
/// a client that disconnects first cancels the run.
async fn run_stream(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Query(request): Query<RunRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(RUN_EVENT_BUFFER);
    let cancel = CancellationToken::new();
    start_run(&state, &operator, request, tx, cancel.clone());

    let guard = cancel.drop_guard();
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(sse_event(&event)), (rx, guard)))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn start_run(
    state: &AppState,
    operator: &Operator,
    request: RunRequest,
    tx: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
) {
    // Invalid commands skip the registry; the runner rejects them without launching.
    let ticket = match request.validated_command() {
        Ok(command) => match state.registry.try_begin(command, &operator.username) {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                tracing::warn!(
                    command = %command,
                    operator = %operator.username,
                    error = %err,
                    "run rejected"
                );
                let _ = tx.try_send(RunEvent::failed(err.to_string(), None));
                return;
            }
        },
        Err(_) => None,
    };

    let runner = Arc::clone(&state.runner);
    let operator = operator.username.clone();
    tokio::spawn(async move {
        let run_id = ticket.as_ref().map(|ticket| ticket.id());
        tracing::info!(
            run_id = ?run_id,
            command = %request.command,
            operator = %operator,
            "run started"
        );
        let terminal = runner.run(&request, &tx, cancel).await;
        tracing::info!(
            run_id = ?run_id,
            event = terminal.wire_name(),
            "run finished"
        );
        if let Some(ticket) = ticket {
            ticket.finish(&terminal);
        }
    });
}

fn sse_event(event: &RunEvent) -> Event {
    Event::default()
        .event(event.wire_name())
        .data(event.wire_data().to_string())
}

async fn list_results(State(state): State<AppState>) -> Result<Json<Vec<ResultFile>>, StatusCode> {
    results::list_output_files(&state.output_dir)
        .await
        .map(Json)
        .map_err(|err| {
            tracing::error!(error = %err, "failed to list output files");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_result(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    serve_result(&state, &name, false).await
}

async fn download_result(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    serve_result(&state, &name, true).await
}

async fn serve_result(state: &AppState, name: &str, attachment: bool) -> Response {
    let content = match results::read_output_file(&state.output_dir, name).await {
        Ok(content) => content,
        Err(ResultsError::InvalidName(_)) => return StatusCode::BAD_REQUEST.into_response(),
        Err(ResultsError::NotFound(_)) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(file = %name, error = %err, "failed to read output file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let content_type = if name.ends_with(".json") {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    let mut response = ([(header::CONTENT_TYPE, content_type)], content).into_response();
    if attachment {
        let disposition = format!("attachment; filename=\"{}\"", name.replace('"', "_"));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }
    response
}

#[derive(Serialize)]
struct CleanResponse {
    removed: usize,
}

async fn clean_results(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
) -> Result<Json<CleanResponse>, StatusCode> {
    let removed = results::clean_output_dir(&state.output_dir)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to clean output directory");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    tracing::info!(removed, operator = %operator.username, "output directory cleaned");
    Ok(Json(CleanResponse { removed }))
}
