//! # Módulo Coordenador - A Máquina de Estados de um Run
//!
//! O coordenador é o dono de um run: ele dirige o planner, o cache, o
//! broker de inputs, o executor HTTP, a extração e as verificações, e
//! emite os eventos do stream na ordem certa.
//!
//! ## Ciclo de um step dentro do run:
//!
//! ```text
//! PENDING → RESOLVING → (AWAITING_INPUT?) → PRE_LISTEN? → EXECUTING
//!         → (RETRY_WAIT → EXECUTING)*      → POST_VERIFY
//!         → SUCCESS | ERROR | VERIFICATION_FAILED | SKIPPED
//! ```
//!
//! ## Regras que o coordenador garante:
//!
//! - Um driver lógico por run: os eventos saem na ordem do plano, e o
//!   `step` de B sempre sai depois do `step` de cada predecessor de B.
//! - Dependência em `ERROR`/`VERIFICATION_FAILED`/`SKIPPED` propaga:
//!   o dependente vira `SKIPPED`, transitivamente.
//! - Aresta sem `useCache` declarado é neutra: o dependente lê o
//!   resultado vivo que o produtor publicou neste run.
//! - Aresta com `useCache = true` serve a contribuição pelo cache: hit
//!   marca `fromCache = true` no resultado do dependente e não gera
//!   nova chamada HTTP; produtor cacheable com entrada expirada
//!   re-executa (pull através do cache).
//! - Aresta com `useCache = false` re-executa o produtor na hora, com
//!   resultado fresco que NÃO atualiza o cache compartilhado.
//! - `FIRE_SIDE_EFFECT` insere um pull sintético do alvo, imediato e
//!   sujeito ao cache (hit vira evento com `fromCache = true`, sem
//!   chamada HTTP), fora da ordem do planner.
//! - Cancelamento: steps não terminais viram `SKIPPED`, chamadas em
//!   voo são interrompidas, o run termina `CANCELLED`.

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::connectors::ConnectorFactory;
use crate::errors::EngineError;
use crate::executors::{ExecutionOutcome, HttpStepExecutor};
use crate::extractors::{self, ExtractionInput};
use crate::inputs::InputWaitError;
use crate::limits::ExecutionLimits;
use crate::placeholder::{self, InputFieldRef, ResolutionContext, StepContext};
use crate::planner;
use crate::protocol::{
    Environment, InputField, Run, RunEvent, RunStatus, Step, StepExecutionResult, StepStatus,
    Suite, SuiteExecutionResult, SuiteSnapshot, TriggerType,
};
use crate::registry::RunControl;
use crate::verify::VerificationRunner;

// ============================================================================
// PEDIDO DE RUN
// ============================================================================

/// Tudo que o coordenador precisa para dirigir um run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub snapshot: SuiteSnapshot,
    pub environment_id: Option<Uuid>,
    pub trigger: TriggerType,
    /// `Some` para run de step único; `None` para a suíte inteira.
    pub target_step: Option<Uuid>,
    pub schedule_id: Option<Uuid>,
}

/// Run cancelado no meio de um step.
struct Interrupted;

/// Profundidade máxima de pulls encadeados (side effects e arestas
/// `useCache = false`). Acima disso o pull degrada para warning.
const MAX_PULL_DEPTH: u8 = 8;

// ============================================================================
// ESTADO DE UM RUN
// ============================================================================

struct RunState {
    cache: ResponseCache,
    /// Contexto publicado por step, chaveado pelo NOME do step.
    contexts: HashMap<String, StepContext>,
    /// Último status terminal de cada step.
    final_status: HashMap<Uuid, StepStatus>,
    /// Resultados na ordem de emissão (espelho do stream).
    emitted: Vec<StepExecutionResult>,
    /// Alvos já puxados por side effect neste run.
    side_effect_pulled: HashSet<Uuid>,
    secrets: Vec<String>,
}

impl RunState {
    fn record(&mut self, result: StepExecutionResult) {
        self.final_status.insert(result.step_id, result.status);
        self.emitted.push(result);
    }
}

// ============================================================================
// COORDENADOR
// ============================================================================

/// Coordenador de runs: um por processo, dirige N runs isolados.
#[derive(Debug)]
pub struct RunCoordinator {
    limits: ExecutionLimits,
    executor: HttpStepExecutor,
    factory: Arc<ConnectorFactory>,
}

impl RunCoordinator {
    pub fn new(limits: ExecutionLimits, factory: Arc<ConnectorFactory>) -> Self {
        let executor = HttpStepExecutor::new(limits.http_timeout());
        Self {
            limits,
            executor,
            factory,
        }
    }

    /// Dirige um run do começo ao fim, emitindo os eventos no controle.
    ///
    /// O chamador registra o run no registry antes e o conclui depois;
    /// aqui dentro só existe UM escritor para o estado do run.
    pub async fn execute(
        &self,
        request: RunRequest,
        control: Arc<RunControl>,
    ) -> SuiteExecutionResult {
        let run_id = control.run_id;
        let started_at = Utc::now();
        let started = Instant::now();
        let suite = &request.snapshot.suite;
        let environment = request.snapshot.environment(request.environment_id);

        control.emit(RunEvent::RunStarted { run_id });
        info!(%run_id, suite = %suite.name, trigger = ?request.trigger, "run iniciado");

        // Limite de tamanho e plano. Falha aqui aborta o run inteiro:
        // um run-error e nenhum evento de step.
        let plan = if suite.steps.len() > self.limits.max_steps {
            Err(EngineError::Validation(format!(
                "suíte com {} steps excede o máximo de {}",
                suite.steps.len(),
                self.limits.max_steps
            )))
        } else {
            match request.target_step {
                Some(target) => planner::plan_step(suite, target).map_err(EngineError::from),
                None => planner::plan_suite(suite).map_err(EngineError::from),
            }
        };

        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%run_id, kind = err.kind(), error = %err, "run abortado no planejamento");
                control.emit(RunEvent::RunError {
                    message: format!("{}: {}", err.kind(), err),
                });
                return SuiteExecutionResult {
                    run_id,
                    suite_id: suite.id,
                    suite_name: suite.name.clone(),
                    trigger_type: request.trigger,
                    status: RunStatus::Failure,
                    started_at,
                    completed_at: Utc::now(),
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    steps: Vec::new(),
                };
            }
        };

        let mut state = RunState {
            cache: ResponseCache::new(),
            contexts: HashMap::new(),
            final_status: HashMap::new(),
            emitted: Vec::new(),
            side_effect_pulled: HashSet::new(),
            secrets: placeholder::secret_values(&environment),
        };

        let mut cancelled = false;

        for (index, step_id) in plan.ordered.iter().enumerate() {
            let step = suite.step(*step_id).expect("plano só contém steps da suíte");

            if control.is_cancelled() {
                cancelled = true;
                self.skip_remaining(&plan.ordered[index..], suite, &control, &mut state);
                break;
            }

            // Propagação de falha: qualquer dependência fora de SUCCESS
            // pula este step, transitivamente.
            if let Some(reason) = self.failed_dependency(step, &state) {
                let result = StepExecutionResult::skipped(step.id, &step.name, reason);
                control.emit(RunEvent::Step(Box::new(result.clone())));
                state.record(result);
                continue;
            }

            match self
                .execute_one(
                    suite,
                    &environment,
                    step,
                    request.trigger,
                    &control,
                    &mut state,
                    true,
                    0,
                )
                .await
            {
                Ok(_) => {}
                Err(Interrupted) => {
                    cancelled = true;
                    self.skip_remaining(&plan.ordered[index..], suite, &control, &mut state);
                    break;
                }
            }
        }

        let status = aggregate_status(&state.final_status, cancelled);
        let result = SuiteExecutionResult {
            run_id,
            suite_id: suite.id,
            suite_name: suite.name.clone(),
            trigger_type: request.trigger,
            status,
            started_at,
            completed_at: Utc::now(),
            total_duration_ms: started.elapsed().as_millis() as u64,
            steps: state.emitted,
        };

        info!(%run_id, status = ?status, steps = result.steps.len(), "run terminado");
        control.emit(RunEvent::Complete(Box::new(result.clone())));
        result
    }

    /// Marca os steps ainda não terminais como SKIPPED (cancelamento).
    fn skip_remaining(
        &self,
        remaining: &[Uuid],
        suite: &Suite,
        control: &RunControl,
        state: &mut RunState,
    ) {
        for step_id in remaining {
            if state.final_status.contains_key(step_id) {
                continue;
            }
            let Some(step) = suite.step(*step_id) else {
                continue;
            };
            let result = StepExecutionResult::skipped(step.id, &step.name, "run cancelado");
            control.emit(RunEvent::Step(Box::new(result.clone())));
            state.record(result);
        }
    }

    /// Primeira dependência não-SUCCESS, se houver.
    fn failed_dependency(&self, step: &Step, state: &RunState) -> Option<String> {
        for dep in &step.dependencies {
            match state.final_status.get(&dep.depends_on_step_id) {
                Some(StepStatus::Success) | None => {}
                Some(status) => {
                    return Some(format!(
                        "dependência em estado {:?}",
                        status
                    ));
                }
            }
        }
        None
    }

    /// Executa UM step: resolve, espera input, arma pre-listen, chama
    /// HTTP, extrai, verifica, atualiza cache e emite o evento.
    ///
    /// Recursivo (boxed) para os pulls sintéticos: arestas
    /// `useCache = false`, cache expirado e side effects.
    #[allow(clippy::too_many_arguments)]
    fn execute_one<'a>(
        &'a self,
        suite: &'a Suite,
        environment: &'a Environment,
        step: &'a Step,
        trigger: TriggerType,
        control: &'a RunControl,
        state: &'a mut RunState,
        update_cache: bool,
        depth: u8,
    ) -> BoxFuture<'a, Result<StepExecutionResult, Interrupted>> {
        Box::pin(async move {
            if control.is_cancelled() {
                return Err(Interrupted);
            }

            // ----------------------------------------------------------------
            // Pulls de dependência. Aresta neutra (useCache ausente)
            // lê o resultado vivo; useCache=false força re-execução
            // fresca; useCache=true serve pelo cache: hit marca o
            // fromCache do dependente, miss de produtor cacheable
            // (entrada expirada) re-executa.
            // ----------------------------------------------------------------
            let mut served_from_cache = false;
            for dep in &step.dependencies {
                let Some(producer) = suite.step(dep.depends_on_step_id) else {
                    continue;
                };
                // Produtor que nunca rodou (pull sintético de um alvo
                // com dependências não planejadas) fica como está:
                // placeholders avisam.
                if !state.final_status.contains_key(&producer.id) {
                    continue;
                }
                if dep.forces_fresh() {
                    if depth < MAX_PULL_DEPTH {
                        self.execute_one(
                            suite,
                            environment,
                            producer,
                            trigger,
                            control,
                            &mut *state,
                            false,
                            depth + 1,
                        )
                        .await?;
                    }
                } else if dep.wants_cache() {
                    if state.cache.get(producer.id).is_some() {
                        // Contribuição servida pelo cache: sem nova
                        // chamada HTTP para o produtor.
                        served_from_cache = true;
                    } else if producer.cacheable && depth < MAX_PULL_DEPTH {
                        // Expirou dentro do run: pull através do cache.
                        self.execute_one(
                            suite,
                            environment,
                            producer,
                            trigger,
                            control,
                            &mut *state,
                            true,
                            depth + 1,
                        )
                        .await?;
                    }
                }
            }

            let mut warnings: Vec<String> = Vec::new();

            // ----------------------------------------------------------------
            // AWAITING_INPUT: coleta #{...} e suspende se preciso.
            // ----------------------------------------------------------------
            let fields = collect_input_fields(step);
            if trigger == TriggerType::Manual && !fields.is_empty() {
                let reuse_edge = step.dependencies.iter().any(|d| d.reuse_manual_input);
                let all_cached = fields
                    .iter()
                    .all(|f| control.inputs.cached(&f.name).is_some());

                // Aresta com reuseManualInput e tudo já submetido:
                // reaproveita em silêncio, sem evento.
                if !(reuse_edge && all_cached) {
                    let prompt: Vec<InputField> = fields
                        .iter()
                        .map(|f| InputField {
                            name: f.name.clone(),
                            default_value: f.default_value.clone(),
                            cached_value: control.inputs.cached(&f.name),
                        })
                        .collect();
                    control.emit(RunEvent::InputRequired {
                        run_id: control.run_id,
                        step_id: step.id,
                        step_name: step.name.clone(),
                        fields: prompt,
                    });

                    let names: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
                    match control
                        .inputs
                        .wait_for(&names, self.limits.input_wait(), &control.cancel)
                        .await
                    {
                        Ok(_) => {}
                        Err(InputWaitError::Cancelled) => return Err(Interrupted),
                        Err(InputWaitError::TimedOut) => {
                            let err = EngineError::InputTimeout {
                                step: step.name.clone(),
                            };
                            let result = self.error_result(step, err.to_string(), warnings);
                            control.emit(RunEvent::Step(Box::new(result.clone())));
                            state.record(result.clone());
                            return Ok(result);
                        }
                    }
                }
            }
            let inputs = control.inputs.snapshot();

            // ----------------------------------------------------------------
            // RESOLVING: expande todos os templates do step.
            // ----------------------------------------------------------------
            let prepared = {
                let ctx = ResolutionContext {
                    environment,
                    steps: &state.contexts,
                    inputs: &inputs,
                };
                match crate::executors::http::prepare(step, &ctx) {
                    Ok(prepared) => prepared,
                    Err(err) => {
                        let result = self.error_result(step, err.to_string(), warnings);
                        control.emit(RunEvent::Step(Box::new(result.clone())));
                        state.record(result.clone());
                        return Ok(result);
                    }
                }
            };
            warnings.extend(prepared.warnings.clone());

            // ----------------------------------------------------------------
            // PRE_LISTEN: arma listeners ANTES da chamada HTTP.
            // ----------------------------------------------------------------
            let runner = VerificationRunner::new(&self.factory);
            let mut resolved_queries: Vec<String> = Vec::with_capacity(step.verifications.len());
            for verification in &step.verifications {
                let ctx = ResolutionContext {
                    environment,
                    steps: &state.contexts,
                    inputs: &inputs,
                };
                let resolved = placeholder::resolve(&verification.query, &ctx);
                warnings.extend(resolved.warnings.clone());
                resolved_queries.push(resolved.text);
            }
            for (verification, query) in step.verifications.iter().zip(&resolved_queries) {
                if verification.pre_listen {
                    if let Err(err) = runner
                        .start_pre_listen(environment, verification, query)
                        .await
                    {
                        warnings.push(format!(
                            "pre-listen de '{}' falhou: {}",
                            verification.connector_name, err
                        ));
                    }
                }
            }

            // ----------------------------------------------------------------
            // EXECUTING (+ RETRY_WAIT): o executor dirige o loop.
            // ----------------------------------------------------------------
            let exchange = match self.executor.execute(step, &prepared, &control.cancel).await {
                ExecutionOutcome::Finished(exchange) => exchange,
                ExecutionOutcome::Cancelled => return Err(Interrupted),
            };

            // ----------------------------------------------------------------
            // Extração: bindings publicados para os próximos steps.
            // ----------------------------------------------------------------
            let request_body_text = prepared.body_text();
            let request_headers = prepared.header_map();
            let request_query = prepared.query_map();
            let extraction = extractors::extract(
                &step.extracted_variables,
                &ExtractionInput {
                    response_body: &exchange.response_body,
                    response_headers: &exchange.response_headers,
                    status_code: exchange.status,
                    request_body: &request_body_text,
                    request_headers: &request_headers,
                    request_query_params: &request_query,
                    request_url: &prepared.url,
                },
            );
            warnings.extend(extraction.warnings.clone());

            state.contexts.insert(
                step.name.clone(),
                StepContext {
                    extracted: extraction.bindings,
                    implicit: json!({
                        "response": extractors::parse_tree(&exchange.response_body),
                        "status": exchange.status,
                        "headers": exchange.response_headers.clone(),
                        "request": {
                            "body": extractors::parse_tree(&request_body_text),
                            "url": prepared.url.clone(),
                            "headers": request_headers.clone(),
                            "query": request_query.clone(),
                        },
                    }),
                },
            );

            // ----------------------------------------------------------------
            // POST_VERIFY: todas as verificações anexadas.
            // ----------------------------------------------------------------
            let mut verification_results = Vec::with_capacity(step.verifications.len());
            for (verification, query) in step.verifications.iter().zip(&resolved_queries) {
                verification_results.push(runner.run(environment, verification, query).await);
            }
            let verifications_passed = verification_results.iter().all(|v| v.passed);

            // Verificação que falha rebaixa SUCCESS; ERROR permanece.
            let status = match exchange.classification {
                StepStatus::Success if !verifications_passed => StepStatus::VerificationFailed,
                other => other,
            };

            // ----------------------------------------------------------------
            // Resultado final do step (com segredos mascarados no eco).
            // ----------------------------------------------------------------
            let result = StepExecutionResult {
                step_id: step.id,
                step_name: step.name.clone(),
                status,
                response_code: exchange.status,
                response_body: exchange.response_body.clone(),
                response_headers: exchange.response_headers.clone(),
                duration_ms: exchange.duration_ms,
                error_message: exchange.error_message.clone(),
                from_cache: served_from_cache,
                extracted_variables: extraction.strings,
                verification_results,
                request_url: placeholder::mask_secrets(&prepared.url, &state.secrets),
                request_body: placeholder::mask_secrets(&request_body_text, &state.secrets),
                request_headers: mask_map(&request_headers, &state.secrets),
                request_query_params: mask_map(&request_query, &state.secrets),
                warnings,
            };

            if update_cache && step.cacheable && status == StepStatus::Success {
                state
                    .cache
                    .put(step.id, step.cache_ttl_seconds, result.clone());
            }

            control.emit(RunEvent::Step(Box::new(result.clone())));
            state.record(result.clone());

            // ----------------------------------------------------------------
            // Side effects: pull sintético, imediato, sujeito ao cache.
            // ----------------------------------------------------------------
            for target_id in &exchange.side_effects {
                let Some(target) = suite.step(*target_id) else {
                    continue;
                };
                if depth >= MAX_PULL_DEPTH {
                    warn!(step = %step.name, target = %target.name, "cadeia de pulls profunda demais, side effect ignorado");
                    continue;
                }
                if !state.side_effect_pulled.insert(*target_id) {
                    // Já puxado neste run; o cache responde se puder.
                    if let Some(mut hit) = state.cache.get(*target_id) {
                        hit.from_cache = true;
                        control.emit(RunEvent::Step(Box::new(hit.clone())));
                        state.record(hit);
                    }
                    continue;
                }
                if let Some(mut hit) = state.cache.get(*target_id) {
                    hit.from_cache = true;
                    control.emit(RunEvent::Step(Box::new(hit.clone())));
                    state.record(hit);
                    continue;
                }
                self.execute_one(
                    suite,
                    environment,
                    target,
                    trigger,
                    control,
                    &mut *state,
                    true,
                    depth + 1,
                )
                .await?;
            }

            Ok(result)
        })
    }

    /// Resultado de step que falhou antes da chamada HTTP.
    fn error_result(
        &self,
        step: &Step,
        message: String,
        warnings: Vec<String>,
    ) -> StepExecutionResult {
        let mut result = StepExecutionResult::skipped(step.id, &step.name, message);
        result.status = StepStatus::Error;
        result.warnings = warnings;
        result
    }
}

fn mask_map(map: &HashMap<String, String>, secrets: &[String]) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), placeholder::mask_secrets(v, secrets)))
        .collect()
}

/// Todos os campos `#{...}` dos templates de um step, na ordem.
fn collect_input_fields(step: &Step) -> Vec<InputFieldRef> {
    let mut fields: Vec<InputFieldRef> = Vec::new();
    let mut push_all = |found: Vec<InputFieldRef>| {
        for field in found {
            if !fields.iter().any(|f| f.name == field.name) {
                fields.push(field);
            }
        }
    };

    push_all(placeholder::scan_input_fields(&step.url));
    for header in &step.headers {
        push_all(placeholder::scan_input_fields(&header.value));
    }
    push_all(placeholder::scan_input_fields(&step.body));
    for field in &step.form_fields {
        push_all(placeholder::scan_input_fields(&field.value));
    }
    for param in &step.query_params {
        push_all(placeholder::scan_input_fields(&param.value));
    }
    for verification in &step.verifications {
        push_all(placeholder::scan_input_fields(&verification.query));
    }
    fields
}

// ============================================================================
// AGREGAÇÃO
// ============================================================================

/// Status agregado do run a partir dos status finais por step.
///
/// - `CANCELLED` quando o run foi cancelado;
/// - `SUCCESS` quando todo step executado (não pulado) é SUCCESS;
/// - `FAILURE` quando nenhum executado é SUCCESS (e houve tentativa);
/// - `PARTIAL_FAILURE` para misturas.
pub fn aggregate_status(
    final_status: &HashMap<Uuid, StepStatus>,
    cancelled: bool,
) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }

    let attempted: Vec<StepStatus> = final_status
        .values()
        .copied()
        .filter(|s| *s != StepStatus::Skipped)
        .collect();

    if attempted.iter().all(|s| *s == StepStatus::Success) {
        return RunStatus::Success;
    }
    if !attempted.iter().any(|s| *s == StepStatus::Success) {
        return RunStatus::Failure;
    }
    RunStatus::PartialFailure
}

/// Registro do run para o catálogo (o motor cria `RUNNING` e finaliza
/// uma única vez; quem persiste é o lado de fora).
pub fn run_record(request: &RunRequest, result: &SuiteExecutionResult) -> Run {
    Run {
        id: result.run_id,
        suite_id: result.suite_id,
        environment_id: request.environment_id,
        trigger_type: request.trigger,
        schedule_id: request.schedule_id,
        status: result.status,
        started_at: result.started_at,
        completed_at: Some(result.completed_at),
        total_duration_ms: result.total_duration_ms,
        result_data: serde_json::to_value(result).ok(),
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::scripted::ScriptedDriver;
    use crate::connectors::{ConnectorDriver, ConnectorError, ListenerSetup};
    use crate::protocol::{
        Assertion, AssertionOperator, BodyType, ConnectorRef, ConnectorType, ExtractedVariable,
        ExtractionSource, HandlerAction, HttpMethod, KeyValue, MatchCode, ResponseHandler,
        StepDependency, Verification,
    };
    use crate::registry::RunRegistry;
    use async_trait::async_trait;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::future::IntoFuture;
    use std::sync::Mutex;
    use std::time::Duration;

    // ------------------------------------------------------------------
    // API de mentira para os cenários ponta a ponta
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct StubState {
        /// Ordem de chegada (paths), para asserções de ordem.
        hits: Mutex<Vec<String>>,
        /// Quantas vezes /flaky ainda responde 500.
        flaky_failures: Mutex<u32>,
        /// Último Authorization visto em /me.
        auth_seen: Mutex<Option<String>>,
        /// Último valor de ?v= visto em /echo.
        echo_seen: Mutex<Option<String>>,
    }

    impl StubState {
        fn log(&self, path: &str) {
            self.hits.lock().unwrap().push(path.to_string());
        }

        fn hits(&self) -> Vec<String> {
            self.hits.lock().unwrap().clone()
        }

        fn count(&self, path: &str) -> usize {
            self.hits.lock().unwrap().iter().filter(|h| *h == path).count()
        }
    }

    async fn token_handler(State(state): State<Arc<StubState>>) -> Json<serde_json::Value> {
        state.log("/token");
        Json(json!({"t": "abc"}))
    }

    async fn me_handler(
        State(state): State<Arc<StubState>>,
        headers: HeaderMap,
    ) -> Json<serde_json::Value> {
        state.log("/me");
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *state.auth_seen.lock().unwrap() = auth.clone();
        Json(json!({"me": "ok", "auth": auth}))
    }

    async fn flaky_handler(
        State(state): State<Arc<StubState>>,
    ) -> (axum::http::StatusCode, Json<serde_json::Value>) {
        state.log("/flaky");
        let mut remaining = state.flaky_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"err": "boom"})),
            );
        }
        (axum::http::StatusCode::OK, Json(json!({"ok": true})))
    }

    async fn order_handler(State(state): State<Arc<StubState>>) -> Json<serde_json::Value> {
        state.log("/order");
        Json(json!({"orderId": "o-1"}))
    }

    async fn notify_handler(State(state): State<Arc<StubState>>) -> Json<serde_json::Value> {
        state.log("/notify");
        Json(json!({"notified": true}))
    }

    async fn echo_handler(
        State(state): State<Arc<StubState>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        state.log("/echo");
        let v = params.get("v").cloned();
        *state.echo_seen.lock().unwrap() = v.clone();
        Json(json!({"v": v}))
    }

    async fn missing_handler(State(state): State<Arc<StubState>>) -> axum::http::StatusCode {
        state.log("/missing");
        axum::http::StatusCode::NOT_FOUND
    }

    async fn spawn_stub() -> (String, Arc<StubState>) {
        let state = Arc::new(StubState::default());
        let app = Router::new()
            .route("/token", get(token_handler))
            .route("/me", get(me_handler))
            .route("/flaky", get(flaky_handler))
            .route("/order", post(order_handler))
            .route("/notify", post(notify_handler))
            .route("/echo", get(echo_handler))
            .route("/missing", get(missing_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());
        (format!("http://{}", addr), state)
    }

    // ------------------------------------------------------------------
    // Construtores de suíte
    // ------------------------------------------------------------------

    fn step(name: &str, method: HttpMethod, url: &str) -> Step {
        Step {
            id: Uuid::new_v4(),
            name: name.to_string(),
            method,
            url: url.to_string(),
            headers: vec![],
            body_type: BodyType::None,
            body: String::new(),
            form_fields: vec![],
            query_params: vec![],
            disabled_default_headers: vec![],
            cacheable: false,
            cache_ttl_seconds: 0,
            dependency_only: false,
            sort_order: 0,
            dependencies: vec![],
            response_handlers: vec![],
            extracted_variables: vec![],
            verifications: vec![],
        }
    }

    /// Aresta neutra: sem useCache declarado.
    fn depends(on: &Step) -> StepDependency {
        StepDependency {
            depends_on_step_id: on.id,
            use_cache: None,
            reuse_manual_input: false,
        }
    }

    /// Aresta que pede a contribuição do produtor via cache.
    fn depends_cached(on: &Step) -> StepDependency {
        StepDependency {
            depends_on_step_id: on.id,
            use_cache: Some(true),
            reuse_manual_input: false,
        }
    }

    fn snapshot(steps: Vec<Step>) -> SuiteSnapshot {
        SuiteSnapshot {
            suite: Suite {
                id: Uuid::new_v4(),
                name: "suite".to_string(),
                environment_id: None,
                steps,
                deleted_at: None,
            },
            environments: vec![],
        }
    }

    fn request(snapshot: SuiteSnapshot, trigger: TriggerType) -> RunRequest {
        RunRequest {
            snapshot,
            environment_id: None,
            trigger,
            target_step: None,
            schedule_id: None,
        }
    }

    fn coordinator() -> RunCoordinator {
        RunCoordinator::new(ExecutionLimits::strict(), Arc::new(ConnectorFactory::new()))
    }

    async fn run_suite(
        coordinator: &RunCoordinator,
        req: RunRequest,
    ) -> (SuiteExecutionResult, Vec<RunEvent>) {
        let registry = RunRegistry::new();
        let (control, mut rx) = registry.register(Uuid::new_v4());
        let result = coordinator.execute(req, control).await;
        registry.complete(result.run_id);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn step_events(events: &[RunEvent]) -> Vec<&StepExecutionResult> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Step(result) => Some(result.as_ref()),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Agregação (tabela verdade)
    // ------------------------------------------------------------------

    #[test]
    fn test_aggregate_status_table() {
        use StepStatus::*;

        let table: Vec<(Vec<StepStatus>, bool, RunStatus)> = vec![
            (vec![Success, Success], false, RunStatus::Success),
            (vec![], false, RunStatus::Success),
            (vec![Error, Skipped], false, RunStatus::Failure),
            (vec![VerificationFailed], false, RunStatus::Failure),
            (vec![Success, Error], false, RunStatus::PartialFailure),
            (
                vec![Success, VerificationFailed],
                false,
                RunStatus::PartialFailure,
            ),
            (vec![Success, Success], true, RunStatus::Cancelled),
        ];

        for (statuses, cancelled, expected) in table {
            let map: HashMap<Uuid, StepStatus> = statuses
                .into_iter()
                .map(|s| (Uuid::new_v4(), s))
                .collect();
            assert_eq!(aggregate_status(&map, cancelled), expected);
        }
    }

    // ------------------------------------------------------------------
    // Cenários ponta a ponta contra a API de mentira
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_cached_dependency() {
        let (base, stub) = spawn_stub().await;

        let mut a = step("A", HttpMethod::Get, &format!("{}/token", base));
        a.cacheable = true;
        a.extracted_variables = vec![ExtractedVariable {
            variable_name: "token".to_string(),
            json_path: "$.t".to_string(),
            source: ExtractionSource::ResponseBody,
        }];
        let mut b = step("B", HttpMethod::Get, &format!("{}/me", base));
        b.dependencies = vec![depends(&a)];
        b.headers = vec![KeyValue {
            key: "Authorization".to_string(),
            value: "{{A.token}}".to_string(),
        }];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![a, b]), TriggerType::Manual)).await;

        assert_eq!(result.status, RunStatus::Success);
        let steps = step_events(&events);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_name, "A");
        assert_eq!(steps[1].step_name, "B");
        assert!(!steps[0].from_cache);
        assert!(!steps[1].from_cache);
        assert_eq!(stub.auth_seen.lock().unwrap().as_deref(), Some("abc"));
        assert_eq!(steps[0].extracted_variables["token"], "abc");
    }

    #[tokio::test]
    async fn test_cache_reuse_executes_producer_once() {
        let (base, stub) = spawn_stub().await;

        let mut a = step("A", HttpMethod::Get, &format!("{}/token", base));
        a.cacheable = true;
        a.extracted_variables = vec![ExtractedVariable {
            variable_name: "token".to_string(),
            json_path: "$.t".to_string(),
            source: ExtractionSource::ResponseBody,
        }];
        let mut b = step("B", HttpMethod::Get, &format!("{}/me", base));
        b.dependencies = vec![depends_cached(&a)];
        b.headers = vec![KeyValue {
            key: "Authorization".to_string(),
            value: "{{A.token}}".to_string(),
        }];
        let mut c = step("C", HttpMethod::Get, &format!("{}/me", base));
        c.dependencies = vec![depends_cached(&a)];
        c.headers = vec![KeyValue {
            key: "Authorization".to_string(),
            value: "{{A.token}}".to_string(),
        }];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![a, b, c]), TriggerType::Manual)).await;

        assert_eq!(result.status, RunStatus::Success);
        // A executou UMA vez; B e C receberam o mesmo token.
        assert_eq!(stub.count("/token"), 1);
        assert_eq!(stub.count("/me"), 2);
        assert_eq!(stub.auth_seen.lock().unwrap().as_deref(), Some("abc"));

        // A contribuição de A veio do cache para os DOIS dependentes:
        // os resultados de B e de C carregam fromCache = true.
        let steps = step_events(&events);
        let a_result = steps.iter().find(|s| s.step_name == "A").unwrap();
        let b_result = steps.iter().find(|s| s.step_name == "B").unwrap();
        let c_result = steps.iter().find(|s| s.step_name == "C").unwrap();
        assert!(!a_result.from_cache);
        assert!(b_result.from_cache);
        assert!(c_result.from_cache);
    }

    #[tokio::test]
    async fn test_use_cache_false_forces_reexecution() {
        let (base, stub) = spawn_stub().await;

        let mut a = step("A", HttpMethod::Get, &format!("{}/token", base));
        a.cacheable = true;
        let mut b = step("B", HttpMethod::Get, &format!("{}/me", base));
        b.dependencies = vec![StepDependency {
            depends_on_step_id: a.id,
            use_cache: Some(false),
            reuse_manual_input: false,
        }];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![a, b]), TriggerType::Manual)).await;

        assert_eq!(result.status, RunStatus::Success);
        // A rodou no plano e de novo no pull fresco de B.
        assert_eq!(stub.count("/token"), 2);
        assert_eq!(step_events(&events).len(), 3);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let (base, stub) = spawn_stub().await;
        *stub.flaky_failures.lock().unwrap() = 2;

        let mut s = step("Flaky", HttpMethod::Get, &format!("{}/flaky", base));
        s.response_handlers = vec![
            ResponseHandler {
                priority: 1,
                match_code: MatchCode::Range(5),
                action: HandlerAction::Retry,
                retry_count: 3,
                retry_delay_seconds: 0,
                side_effect_step_id: None,
            },
            ResponseHandler {
                priority: 2,
                match_code: MatchCode::Range(2),
                action: HandlerAction::Success,
                retry_count: 0,
                retry_delay_seconds: 0,
                side_effect_step_id: None,
            },
        ];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![s]), TriggerType::Manual)).await;

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(stub.count("/flaky"), 3);
        let steps = step_events(&events);
        assert_eq!(steps[0].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_error() {
        let (base, stub) = spawn_stub().await;
        *stub.flaky_failures.lock().unwrap() = 10;

        let mut s = step("Flaky", HttpMethod::Get, &format!("{}/flaky", base));
        s.response_handlers = vec![ResponseHandler {
            priority: 1,
            match_code: MatchCode::Range(5),
            action: HandlerAction::Retry,
            retry_count: 2,
            retry_delay_seconds: 0,
            side_effect_step_id: None,
        }];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![s]), TriggerType::Manual)).await;

        assert_eq!(result.status, RunStatus::Failure);
        assert_eq!(stub.count("/flaky"), 2);
        let steps = step_events(&events);
        assert_eq!(steps[0].status, StepStatus::Error);
        assert!(steps[0].error_message.as_ref().unwrap().contains("retry"));
    }

    #[tokio::test]
    async fn test_side_effect_fires_and_step_errors_without_classifier() {
        let (base, stub) = spawn_stub().await;

        let n = step("Notify", HttpMethod::Post, &format!("{}/notify", base));
        let mut p = step("Order", HttpMethod::Post, &format!("{}/order", base));
        p.response_handlers = vec![ResponseHandler {
            priority: 1,
            match_code: MatchCode::Range(2),
            action: HandlerAction::FireSideEffect,
            retry_count: 0,
            retry_delay_seconds: 0,
            side_effect_step_id: Some(n.id),
        }];

        let mut n_clone = n.clone();
        n_clone.dependency_only = true;
        let (result, events) = run_suite(
            &coordinator(),
            request(snapshot(vec![p, n_clone]), TriggerType::Manual),
        )
        .await;

        let steps = step_events(&events);
        // P e N aparecem; sem outro handler, P é ERROR e N executa.
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_name, "Order");
        assert_eq!(steps[0].status, StepStatus::Error);
        assert_eq!(steps[1].step_name, "Notify");
        assert_eq!(steps[1].status, StepStatus::Success);
        assert_eq!(stub.count("/notify"), 1);
        assert_eq!(result.status, RunStatus::PartialFailure);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_transitively() {
        let (base, _stub) = spawn_stub().await;

        let a = step("A", HttpMethod::Get, &format!("{}/missing", base));
        let mut b = step("B", HttpMethod::Get, &format!("{}/me", base));
        b.dependencies = vec![depends(&a)];
        let mut c = step("C", HttpMethod::Get, &format!("{}/me", base));
        c.dependencies = vec![depends(&b)];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![a, b, c]), TriggerType::Manual)).await;

        let steps = step_events(&events);
        assert_eq!(steps[0].status, StepStatus::Error); // 404 sem handler
        assert_eq!(steps[1].status, StepStatus::Skipped);
        assert_eq!(steps[2].status, StepStatus::Skipped);
        assert_eq!(result.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_cycle_aborts_with_run_error_only() {
        let mut a = step("A", HttpMethod::Get, "http://unused/a");
        let mut b = step("B", HttpMethod::Get, "http://unused/b");
        let (a_id, b_id) = (a.id, b.id);
        a.dependencies = vec![StepDependency {
            depends_on_step_id: b_id,
            use_cache: None,
            reuse_manual_input: false,
        }];
        b.dependencies = vec![StepDependency {
            depends_on_step_id: a_id,
            use_cache: None,
            reuse_manual_input: false,
        }];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![a, b]), TriggerType::Manual)).await;

        assert_eq!(result.status, RunStatus::Failure);
        assert_eq!(events[0].name(), "run-started");
        assert_eq!(events[1].name(), "run-error");
        assert!(matches!(&events[1], RunEvent::RunError { message } if message.contains("CYCLE_DETECTED")));
        assert!(step_events(&events).is_empty());
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let (base, stub) = spawn_stub().await;
        let a = step("A", HttpMethod::Get, &format!("{}/token", base));

        let registry = RunRegistry::new();
        let (control, mut rx) = registry.register(Uuid::new_v4());
        control.cancel.cancel();

        let result = coordinator()
            .execute(request(snapshot(vec![a]), TriggerType::Manual), control)
            .await;

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(stub.count("/token"), 0);
        let mut saw_skipped = false;
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Step(step) = &event {
                assert_eq!(step.status, StepStatus::Skipped);
                saw_skipped = true;
            }
        }
        assert!(saw_skipped);
    }

    #[tokio::test]
    async fn test_scheduled_run_fills_defaults_and_warns_on_missing() {
        let (base, stub) = spawn_stub().await;

        let mut s = step("Echo", HttpMethod::Get, &format!("{}/echo", base));
        s.query_params = vec![
            KeyValue {
                key: "v".to_string(),
                value: "#{code:42}".to_string(),
            },
            KeyValue {
                key: "w".to_string(),
                value: "#{nodefault}".to_string(),
            },
        ];

        let (result, events) = run_suite(&coordinator(), request(snapshot(vec![s]), TriggerType::Scheduled)).await;

        assert_eq!(result.status, RunStatus::Success);
        // Nenhum input-required em run agendado.
        assert!(events.iter().all(|e| e.name() != "input-required"));
        assert_eq!(stub.echo_seen.lock().unwrap().as_deref(), Some("42"));
        let steps = step_events(&events);
        assert!(steps[0].warnings.iter().any(|w| w.contains("nodefault")));
    }

    #[tokio::test]
    async fn test_manual_input_pause_and_reuse() {
        let (base, stub) = spawn_stub().await;

        let mut x = step("X", HttpMethod::Get, &format!("{}/echo", base));
        x.query_params = vec![KeyValue {
            key: "v".to_string(),
            value: "#{otp}".to_string(),
        }];
        let mut y = step("Y", HttpMethod::Get, &format!("{}/echo", base));
        y.query_params = vec![KeyValue {
            key: "v".to_string(),
            value: "#{otp}".to_string(),
        }];
        y.dependencies = vec![StepDependency {
            depends_on_step_id: x.id,
            use_cache: None,
            reuse_manual_input: true,
        }];

        let registry = RunRegistry::new();
        let (control, mut rx) = registry.register(Uuid::new_v4());
        let coordinator = coordinator();
        let req = request(snapshot(vec![x, y]), TriggerType::Manual);

        let driver = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { coordinator.execute(req, control).await })
        };

        // Espera o pedido de input e submete.
        let mut prompts = 0;
        let mut result = None;
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::InputRequired { fields, .. } => {
                    prompts += 1;
                    assert_eq!(fields[0].name, "otp");
                    registry.submit_inputs(
                        control.run_id,
                        HashMap::from([("otp".to_string(), "123456".to_string())]),
                    );
                }
                RunEvent::Complete(r) => {
                    result = Some(*r);
                    break;
                }
                _ => {}
            }
        }
        driver.await.unwrap();

        // UM pedido só; X e Y receberam o mesmo valor.
        assert_eq!(prompts, 1);
        let result = result.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(stub.count("/echo"), 2);
        assert_eq!(stub.echo_seen.lock().unwrap().as_deref(), Some("123456"));
    }

    #[tokio::test]
    async fn test_pre_listen_armed_before_http_call() {
        // Driver que loga no mesmo diário que a API de mentira.
        struct LoggingDriver {
            log: Arc<StubState>,
        }

        #[async_trait]
        impl ConnectorDriver for LoggingDriver {
            fn connector_type(&self) -> ConnectorType {
                ConnectorType::Kafka
            }

            async fn execute(
                &self,
                _config: &HashMap<String, String>,
                _query: &str,
                _timeout: Duration,
            ) -> Result<String, ConnectorError> {
                self.log.log("kafka-query");
                Ok(json!({"found": true, "key": "k1", "value": "v"}).to_string())
            }

            async fn start_listener(
                &self,
                _config: &HashMap<String, String>,
                _query: &str,
                _setup: &ListenerSetup,
            ) -> Result<(), ConnectorError> {
                self.log.log("kafka-listen");
                Ok(())
            }
        }

        let (base, stub) = spawn_stub().await;

        let mut environment = Environment::empty();
        environment.id = Uuid::new_v4();
        environment.connectors = vec![ConnectorRef {
            name: "events".to_string(),
            connector_type: ConnectorType::Kafka,
            config: HashMap::new(),
        }];

        let mut publish = step("Publish", HttpMethod::Post, &format!("{}/order", base));
        publish.response_handlers = vec![ResponseHandler {
            priority: 1,
            match_code: MatchCode::Range(2),
            action: HandlerAction::Success,
            retry_count: 0,
            retry_delay_seconds: 0,
            side_effect_step_id: None,
        }];
        publish.verifications = vec![Verification {
            connector_name: "events".to_string(),
            query: "topic=events\nkey=k1".to_string(),
            timeout_seconds: 5,
            query_timeout_seconds: 5,
            pre_listen: true,
            assertions: vec![Assertion {
                json_path: "$.found".to_string(),
                operator: AssertionOperator::Equals,
                expected_value: "true".to_string(),
            }],
        }];

        let mut snap = snapshot(vec![publish]);
        snap.suite.environment_id = Some(environment.id);
        snap.environments = vec![environment];

        let factory = Arc::new(
            ConnectorFactory::new().with_driver(Arc::new(LoggingDriver {
                log: Arc::clone(&stub),
            })),
        );
        let coordinator = RunCoordinator::new(ExecutionLimits::strict(), factory);

        let (result, _) = run_suite(&coordinator, request(snap, TriggerType::Manual)).await;
        assert_eq!(result.status, RunStatus::Success);

        // O listener foi armado ANTES da chamada HTTP; a query de
        // assertion veio depois.
        let hits = stub.hits();
        let listen_pos = hits.iter().position(|h| h == "kafka-listen").unwrap();
        let http_pos = hits.iter().position(|h| h == "/order").unwrap();
        let query_pos = hits.iter().position(|h| h == "kafka-query").unwrap();
        assert!(listen_pos < http_pos);
        assert!(http_pos < query_pos);
    }

    #[tokio::test]
    async fn test_verification_failure_downgrades_success() {
        let (base, _stub) = spawn_stub().await;

        let mut environment = Environment::empty();
        environment.id = Uuid::new_v4();
        environment.connectors = vec![ConnectorRef {
            name: "db".to_string(),
            connector_type: ConnectorType::Postgres,
            config: HashMap::new(),
        }];

        let mut s = step("Create", HttpMethod::Post, &format!("{}/order", base));
        s.verifications = vec![Verification {
            connector_name: "db".to_string(),
            query: "SELECT count(*) FROM orders".to_string(),
            timeout_seconds: 5,
            query_timeout_seconds: 5,
            pre_listen: false,
            assertions: vec![Assertion {
                json_path: "$.rowCount".to_string(),
                operator: AssertionOperator::Equals,
                expected_value: "1".to_string(),
            }],
        }];

        let mut snap = snapshot(vec![s]);
        snap.suite.environment_id = Some(environment.id);
        snap.environments = vec![environment];

        let factory = Arc::new(ConnectorFactory::new().with_driver(Arc::new(
            ScriptedDriver::always(ConnectorType::Postgres, r#"{"rows":[],"rowCount":0}"#),
        )));
        let coordinator = RunCoordinator::new(ExecutionLimits::strict(), factory);

        let (result, events) = run_suite(&coordinator, request(snap, TriggerType::Manual)).await;

        let steps = step_events(&events);
        assert_eq!(steps[0].status, StepStatus::VerificationFailed);
        // O código HTTP fica intacto; só o status do step rebaixa.
        assert_eq!(steps[0].response_code, 200);
        assert!(!steps[0].verification_results[0].passed);
        assert_eq!(result.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_run_record_round_trip() {
        let (base, _stub) = spawn_stub().await;
        let s = step("A", HttpMethod::Get, &format!("{}/token", base));
        let req = request(snapshot(vec![s]), TriggerType::Scheduled);

        let coordinator = coordinator();
        let (result, _) = run_suite(&coordinator, req.clone()).await;

        let record = run_record(&req, &result);
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.trigger_type, TriggerType::Scheduled);
        assert!(record.completed_at.is_some());
        assert!(record.result_data.is_some());
    }
}
