//! # Módulo de Servidor - Control Plane HTTP
//!
//! Expõe o motor via HTTP/JSON: runs síncronos, runs com stream SSE,
//! submissão de inputs manuais, cancelamento e preview de cron.
//!
//! ## Rotas:
//!
//! | Método | Rota | Efeito |
//! |---|---|---|
//! | `POST` | `/api/test-suites/{suiteId}/run` | Run síncrono da suíte |
//! | `POST` | `/api/test-suites/{suiteId}/steps/{stepId}/run` | Run síncrono de um step |
//! | `GET`  | `/api/test-suites/{suiteId}/run/stream` | Run com eventos SSE |
//! | `GET`  | `/api/test-suites/{suiteId}/steps/{stepId}/run/stream` | Idem, um step |
//! | `POST` | `/api/test-suites/{suiteId}/run/{runId}/inputs` | Submete inputs manuais |
//! | `POST` | `/api/test-suites/{suiteId}/run/{runId}/cancel` | Cancela o run |
//! | `GET`  | `/api/schedules/preview` | Próximos disparos de um cron |
//! | `GET`  | `/health` | Liveness |
//!
//! O stream SSE carrega os eventos nomeados do run (`run-started`,
//! `step`, `input-required`, `complete`, `run-error`). Cliente que
//! desconecta (timeout do SSE incluído) cancela o run: o guard do
//! stream dispara o cancel no drop, e cancelar um run já concluído é
//! um no-op.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::coordinator::{RunCoordinator, RunRequest};
use crate::loader::SnapshotStore;
use crate::protocol::{RunEvent, SuiteSnapshot, TriggerType};
use crate::registry::{CancelOutcome, RunLookup, RunRegistry};
use crate::schedule;
use crate::validation;

// ============================================================================
// ESTADO COMPARTILHADO
// ============================================================================

/// Estado dos handlers HTTP.
pub struct AppState {
    pub store: SnapshotStore,
    pub registry: Arc<RunRegistry>,
    pub coordinator: Arc<RunCoordinator>,
}

/// Monta o router com todas as rotas do control plane.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/test-suites/{suite_id}/run", post(run_suite))
        .route(
            "/api/test-suites/{suite_id}/steps/{step_id}/run",
            post(run_step),
        )
        .route("/api/test-suites/{suite_id}/run/stream", get(stream_suite))
        .route(
            "/api/test-suites/{suite_id}/steps/{step_id}/run/stream",
            get(stream_step),
        )
        .route(
            "/api/test-suites/{suite_id}/run/{run_id}/inputs",
            post(submit_inputs),
        )
        .route(
            "/api/test-suites/{suite_id}/run/{run_id}/cancel",
            post(cancel_run),
        )
        .route("/api/schedules/preview", get(preview_schedule))
        .route("/health", get(health))
        .with_state(state)
}

/// Sobe o servidor e serve até o processo cair.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("control plane ouvindo em http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

// ============================================================================
// TIPOS DE REQUISIÇÃO/RESPOSTA
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunBody {
    #[serde(default)]
    pub environment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub environment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct InputsBody {
    pub values: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputsAccepted {
    pub accepted: usize,
    pub ignored: bool,
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub cron: String,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub cron: String,
    pub next_fire_times: Vec<chrono::DateTime<chrono::Utc>>,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Busca o snapshot e valida antes de criar qualquer run.
fn load_validated(
    state: &AppState,
    suite_id: Uuid,
) -> Result<SuiteSnapshot, ApiError> {
    let snapshot = state
        .store
        .get(suite_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("suíte desconhecida: {}", suite_id)))?;

    if let Err(errors) = validation::validate_snapshot(snapshot) {
        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(api_error(StatusCode::BAD_REQUEST, joined.join("; ")));
    }
    Ok(snapshot.clone())
}

/// POST /api/test-suites/{suiteId}/run
async fn run_suite(
    State(state): State<Arc<AppState>>,
    Path(suite_id): Path<Uuid>,
    body: Option<Json<RunBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let snapshot = load_validated(&state, suite_id)?;
    run_sync(state, snapshot, body.environment_id, None).await
}

/// POST /api/test-suites/{suiteId}/steps/{stepId}/run
async fn run_step(
    State(state): State<Arc<AppState>>,
    Path((suite_id, step_id)): Path<(Uuid, Uuid)>,
    body: Option<Json<RunBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let snapshot = load_validated(&state, suite_id)?;
    if snapshot.suite.step(step_id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("step desconhecido: {}", step_id),
        ));
    }
    run_sync(state, snapshot, body.environment_id, Some(step_id)).await
}

/// Run síncrono: dirige o coordenador no próprio handler e devolve o
/// resultado agregado. Os eventos do stream são descartados.
async fn run_sync(
    state: Arc<AppState>,
    snapshot: SuiteSnapshot,
    environment_id: Option<Uuid>,
    target_step: Option<Uuid>,
) -> Result<Json<crate::protocol::SuiteExecutionResult>, ApiError> {
    let run_id = Uuid::new_v4();
    let (control, rx) = state.registry.register(run_id);
    drop(rx);

    let request = RunRequest {
        snapshot,
        environment_id,
        trigger: TriggerType::Manual,
        target_step,
        schedule_id: None,
    };
    let result = state.coordinator.execute(request, control).await;
    state.registry.complete(run_id);
    Ok(Json(result))
}

/// GET /api/test-suites/{suiteId}/run/stream
async fn stream_suite(
    State(state): State<Arc<AppState>>,
    Path(suite_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let snapshot = load_validated(&state, suite_id)?;
    Ok(start_stream(state, snapshot, query.environment_id, None))
}

/// GET /api/test-suites/{suiteId}/steps/{stepId}/run/stream
async fn stream_step(
    State(state): State<Arc<AppState>>,
    Path((suite_id, step_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let snapshot = load_validated(&state, suite_id)?;
    if snapshot.suite.step(step_id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("step desconhecido: {}", step_id),
        ));
    }
    Ok(start_stream(state, snapshot, query.environment_id, Some(step_id)))
}

/// Cancela o run quando o cliente SSE some sem o run ter terminado.
struct CancelOnDrop {
    registry: Arc<RunRegistry>,
    run_id: Uuid,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.registry.cancel(self.run_id) == CancelOutcome::Signalled {
            warn!(run_id = %self.run_id, "stream SSE caiu, run cancelado");
        }
    }
}

/// Registra o run, dispara o driver em background e devolve o stream.
fn start_stream(
    state: Arc<AppState>,
    snapshot: SuiteSnapshot,
    environment_id: Option<Uuid>,
    target_step: Option<Uuid>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let run_id = Uuid::new_v4();
    let (control, rx) = state.registry.register(run_id);

    let request = RunRequest {
        snapshot,
        environment_id,
        trigger: TriggerType::Manual,
        target_step,
        schedule_id: None,
    };

    let registry = Arc::clone(&state.registry);
    let coordinator = Arc::clone(&state.coordinator);
    tokio::spawn(async move {
        // O controle fica vivo até depois do tombstone: assim o guard
        // do stream vê o run como concluído, não como cancelável.
        coordinator.execute(request, Arc::clone(&control)).await;
        registry.complete(run_id);
        drop(control);
    });

    let guard = CancelOnDrop {
        registry: Arc::clone(&state.registry),
        run_id,
    };
    let stream = UnboundedReceiverStream::new(rx).map(move |event: RunEvent| {
        let _held = &guard;
        Ok(SseEvent::default()
            .event(event.name())
            .data(event.payload().to_string()))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// POST /api/test-suites/{suiteId}/run/{runId}/inputs
async fn submit_inputs(
    State(state): State<Arc<AppState>>,
    Path((_suite_id, run_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<InputsBody>,
) -> Result<impl IntoResponse, ApiError> {
    match state.registry.submit_inputs(run_id, body.values) {
        Some(accepted) => Ok(Json(InputsAccepted {
            accepted,
            ignored: false,
        })),
        None => match state.registry.lookup(run_id) {
            // Submissão atrasada: aceita e ignora.
            RunLookup::Completed => Ok(Json(InputsAccepted {
                accepted: 0,
                ignored: true,
            })),
            _ => Err(api_error(
                StatusCode::NOT_FOUND,
                format!("run desconhecido: {}", run_id),
            )),
        },
    }
}

/// POST /api/test-suites/{suiteId}/run/{runId}/cancel
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path((_suite_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    match state.registry.cancel(run_id) {
        CancelOutcome::Signalled => {
            info!(%run_id, "cancelamento solicitado");
            Ok(StatusCode::ACCEPTED)
        }
        // Cancelar depois de completo é no-op, não erro.
        CancelOutcome::AlreadyCompleted => Ok(StatusCode::NO_CONTENT),
        CancelOutcome::Unknown => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("run desconhecido: {}", run_id),
        )),
    }
}

/// GET /api/schedules/preview?cron=...&count=...
async fn preview_schedule(
    Query(query): Query<PreviewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    match schedule::preview(&query.cron, query.count) {
        Ok(next_fire_times) => Ok(Json(PreviewResponse {
            cron: query.cron,
            next_fire_times,
        })),
        Err(err) => {
            error!(cron = %query.cron, error = %err, "preview de cron rejeitado");
            Err(api_error(StatusCode::BAD_REQUEST, err.to_string()))
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
