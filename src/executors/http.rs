//! # Executor HTTP - Montagem e Disparo da Requisição de um Step
//!
//! Este é o executor central do motor. Para um step já planejado, ele:
//!
//! 1. **Resolve** URL, headers, query params, body e campos de form
//!    (headers padrão do ambiente primeiro, step sobrescreve por chave
//!    case-insensitive, `disabledDefaultHeaders` suprime)
//! 2. **Completa** o `Content-Type` quando o usuário não declarou
//!    (JSON ⇒ `application/json`; multipart fica por conta do cliente)
//! 3. **Troca** `${FILE:chave}` pelos bytes do arquivo do ambiente em
//!    campos `file` de form-data (referência sem arquivo é `ERROR`)
//! 4. **Dispara** a requisição medindo a duração
//! 5. **Classifica** o desfecho pelos response handlers
//!
//! ## Seleção de handler:
//!
//! Os handlers são varridos em prioridade crescente; o primeiro cujo
//! `matchCode` casa decide. Código exato vence faixa quando a
//! prioridade empata. `FIRE_SIDE_EFFECT` NÃO classifica: ele registra o
//! pull do alvo e a varredura continua até outro handler decidir; se
//! nenhum decidir, o step é `ERROR`. Um step SEM handlers usa o
//! implícito `2xx ⇒ SUCCESS`.
//!
//! ## Retry:
//!
//! `RETRY` re-dispara após `retryDelaySeconds`, no máximo até
//! `retryCount` tentativas totais; esgotou, vira `ERROR`.
//!
//! ## Falha de I/O:
//!
//! Conexão recusada ou timeout viram o status sintético `0` e forçam o
//! caminho de `ERROR`, a menos que um handler `5xx` explícito exista
//! (único padrão que casa com 0).

use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::placeholder::{self, ResolutionContext};
use crate::protocol::{
    BodyType, FormFieldType, HandlerAction, HttpMethod, ResponseHandler, Step, StepStatus,
};

// ============================================================================
// REQUISIÇÃO PREPARADA
// ============================================================================

/// Campo de form-data já resolvido.
#[derive(Debug, Clone)]
pub struct PreparedField {
    pub key: String,
    pub text: Option<String>,
    /// (nome do arquivo, bytes) para campos `file`.
    pub file: Option<(String, Vec<u8>)>,
}

/// Body já resolvido, pronto para virar requisição.
#[derive(Debug, Clone)]
pub enum PreparedBody {
    None,
    Json(String),
    Form(Vec<PreparedField>),
}

/// Requisição de um step com todos os placeholders expandidos.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    /// URL final, já com a query string anexada.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: PreparedBody,
    pub warnings: Vec<String>,
}

impl PreparedRequest {
    /// Body como texto, para eco no resultado e extração.
    pub fn body_text(&self) -> String {
        match &self.body {
            PreparedBody::None => String::new(),
            PreparedBody::Json(text) => text.clone(),
            PreparedBody::Form(fields) => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|f| match &f.text {
                        Some(text) => format!("{}={}", f.key, text),
                        None => format!("{}=<arquivo>", f.key),
                    })
                    .collect();
                parts.join("&")
            }
        }
    }

    pub fn header_map(&self) -> HashMap<String, String> {
        self.headers.iter().cloned().collect()
    }

    pub fn query_map(&self) -> HashMap<String, String> {
        self.query.iter().cloned().collect()
    }
}

// ============================================================================
// PREPARAÇÃO
// ============================================================================

/// Resolve todos os templates de um step contra o contexto do run.
///
/// O único erro duro aqui é referência de arquivo sem arquivo; todo o
/// resto degrada para warning e segue.
pub fn prepare(step: &Step, ctx: &ResolutionContext<'_>) -> Result<PreparedRequest, EngineError> {
    let mut warnings = Vec::new();

    let resolved_url = placeholder::resolve(&step.url, ctx);
    warnings.extend(resolved_url.warnings);

    // Query params resolvidos e URL-encodados.
    let mut query = Vec::with_capacity(step.query_params.len());
    for param in &step.query_params {
        let resolved = placeholder::resolve(&param.value, ctx);
        warnings.extend(resolved.warnings);
        query.push((param.key.clone(), resolved.text));
    }

    let mut url = resolved_url.text;
    if !query.is_empty() {
        let encoded: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        let separator = if url.contains('?') { "&" } else { "?" };
        url = format!("{}{}{}", url, separator, encoded.join("&"));
    }

    // Headers padrão do ambiente primeiro (fora os suprimidos).
    let mut headers: Vec<(String, String)> = Vec::new();
    for default in &ctx.environment.default_headers {
        let disabled = step
            .disabled_default_headers
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&default.key));
        if disabled {
            continue;
        }
        let value = match default.value_type {
            crate::protocol::ValueKind::Static => {
                let resolved = placeholder::resolve(&default.value, ctx);
                warnings.extend(resolved.warnings);
                resolved.text
            }
            kind => placeholder::expand_kind(&default.value, kind, ctx.environment),
        };
        headers.push((default.key.clone(), value));
    }

    // Headers do step sobrescrevem por chave case-insensitive.
    for header in &step.headers {
        let resolved = placeholder::resolve(&header.value, ctx);
        warnings.extend(resolved.warnings);
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&header.key));
        headers.push((header.key.clone(), resolved.text));
    }

    // Body por tipo.
    let body = match step.body_type {
        BodyType::None => PreparedBody::None,
        BodyType::Json => {
            let resolved = placeholder::resolve(&step.body, ctx);
            warnings.extend(resolved.warnings);
            // Content-Type automático; header declarado vence.
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            PreparedBody::Json(resolved.text)
        }
        BodyType::FormData => {
            let mut fields = Vec::with_capacity(step.form_fields.len());
            for form_field in &step.form_fields {
                match form_field.field_type {
                    FormFieldType::Text => {
                        let resolved = placeholder::resolve(&form_field.value, ctx);
                        warnings.extend(resolved.warnings);
                        fields.push(PreparedField {
                            key: form_field.key.clone(),
                            text: Some(resolved.text),
                            file: None,
                        });
                    }
                    FormFieldType::File => {
                        let file = resolve_file_reference(&form_field.value, ctx)?;
                        fields.push(PreparedField {
                            key: form_field.key.clone(),
                            text: None,
                            file: Some(file),
                        });
                    }
                }
            }
            PreparedBody::Form(fields)
        }
    };

    Ok(PreparedRequest {
        method: step.method,
        url,
        headers,
        query,
        body,
        warnings,
    })
}

/// Troca `${FILE:chave}` pelos bytes do arquivo do ambiente.
fn resolve_file_reference(
    value: &str,
    ctx: &ResolutionContext<'_>,
) -> Result<(String, Vec<u8>), EngineError> {
    let trimmed = value.trim();
    let key = trimmed
        .strip_prefix("${FILE:")
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| {
            EngineError::Resolution(format!(
                "campo de arquivo exige token ${{FILE:chave}}, recebeu '{}'",
                value
            ))
        })?;

    let stored = ctx.environment.file(key).ok_or_else(|| {
        EngineError::Resolution(format!("referência '${{FILE:{}}}' sem arquivo no ambiente", key))
    })?;
    let bytes = stored.bytes().map_err(|e| {
        EngineError::Resolution(format!("arquivo '{}' com base64 inválido: {}", key, e))
    })?;
    let file_name = stored
        .file_name
        .clone()
        .unwrap_or_else(|| stored.file_key.clone());
    Ok((file_name, bytes))
}

// ============================================================================
// SELEÇÃO DE HANDLER
// ============================================================================

/// Handlers que casam com o status, na ordem de decisão: prioridade
/// crescente, código exato antes de faixa no empate.
pub fn matching_handlers(handlers: &[ResponseHandler], status: u16) -> Vec<&ResponseHandler> {
    let mut matched: Vec<&ResponseHandler> = handlers
        .iter()
        .filter(|h| h.match_code.matches(status))
        .collect();
    // sort estável: declaração desempata por último.
    matched.sort_by_key(|h| (h.priority, !h.match_code.is_exact()));
    matched
}

// ============================================================================
// TROCA HTTP
// ============================================================================

/// Desfecho bruto de uma execução HTTP, antes de extração e verificação.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    /// `SUCCESS` ou `ERROR`; verificação pode rebaixar depois.
    pub classification: StepStatus,
    pub status: u16,
    pub response_body: String,
    pub response_headers: HashMap<String, String>,
    pub duration_ms: u64,
    pub attempts: u32,
    pub error_message: Option<String>,
    /// Alvos de `FIRE_SIDE_EFFECT` acumulados nas tentativas.
    pub side_effects: Vec<Uuid>,
}

/// Resultado do executor: troca concluída ou run cancelado no meio.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Finished(HttpExchange),
    Cancelled,
}

/// Executor HTTP com cliente reutilizável.
///
/// Reusar o `Client` mantém o pool de conexões entre steps do processo.
#[derive(Debug, Clone)]
pub struct HttpStepExecutor {
    client: Client,
    timeout: Duration,
}

impl HttpStepExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// Dispara a requisição preparada, dirigindo o loop de retry pelos
    /// response handlers do step.
    pub async fn execute(
        &self,
        step: &Step,
        prepared: &PreparedRequest,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut side_effects: Vec<Uuid> = Vec::new();

        loop {
            attempts += 1;
            if cancel.is_cancelled() {
                return ExecutionOutcome::Cancelled;
            }

            let (status, response_headers, response_body, io_error) = tokio::select! {
                response = self.send_once(prepared) => response,
                _ = cancel.cancelled() => return ExecutionOutcome::Cancelled,
            };

            debug!(step = %step.name, status, attempt = attempts, "resposta recebida");

            // Varre os handlers que casam, em ordem de decisão.
            // FIRE_SIDE_EFFECT acumula e continua; o primeiro handler
            // classificador encerra a varredura.
            let handlers = matching_handlers(&step.response_handlers, status);
            let mut decision: Option<&ResponseHandler> = None;
            for handler in handlers {
                match handler.action {
                    HandlerAction::FireSideEffect => {
                        if let Some(target) = handler.side_effect_step_id {
                            if !side_effects.contains(&target) {
                                side_effects.push(target);
                            }
                        }
                    }
                    _ => {
                        decision = Some(handler);
                        break;
                    }
                }
            }

            let duration_ms = started.elapsed().as_millis() as u64;
            let exchange = |classification: StepStatus, error_message: Option<String>| {
                HttpExchange {
                    classification,
                    status,
                    response_body: response_body.clone(),
                    response_headers: response_headers.clone(),
                    duration_ms,
                    attempts,
                    error_message,
                    side_effects: side_effects.clone(),
                }
            };

            match decision {
                Some(handler) => match handler.action {
                    HandlerAction::Success => {
                        info!(step = %step.name, status, attempts, "step classificado SUCCESS");
                        return ExecutionOutcome::Finished(exchange(StepStatus::Success, None));
                    }
                    HandlerAction::Error => {
                        return ExecutionOutcome::Finished(exchange(
                            StepStatus::Error,
                            Some(io_error.unwrap_or_else(|| {
                                format!("handler {} classificou ERROR", handler.match_code)
                            })),
                        ));
                    }
                    HandlerAction::Retry => {
                        if attempts < handler.retry_count {
                            warn!(
                                step = %step.name,
                                status,
                                attempt = attempts,
                                max = handler.retry_count,
                                "tentativa falhou, aguardando retry"
                            );
                            let delay = Duration::from_secs(handler.retry_delay_seconds);
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => return ExecutionOutcome::Cancelled,
                            }
                            continue;
                        }
                        let err = EngineError::RetryExhausted {
                            attempts,
                            last_error: io_error.unwrap_or_else(|| format!("status {}", status)),
                        };
                        return ExecutionOutcome::Finished(exchange(
                            StepStatus::Error,
                            Some(err.to_string()),
                        ));
                    }
                    HandlerAction::FireSideEffect => unreachable!("não classifica"),
                },
                None => {
                    // Sem handler decisor. Step sem handlers usa o
                    // implícito 2xx ⇒ SUCCESS; com handlers, ERROR.
                    if step.response_handlers.is_empty() && (200..300).contains(&status) {
                        return ExecutionOutcome::Finished(exchange(StepStatus::Success, None));
                    }
                    let message = match io_error {
                        Some(io) => EngineError::HttpIo(io).to_string(),
                        None => format!("nenhum handler casou com o status {}", status),
                    };
                    return ExecutionOutcome::Finished(exchange(StepStatus::Error, Some(message)));
                }
            }
        }
    }

    /// Uma tentativa: monta a requisição a partir da preparada e envia.
    /// Falha de I/O vira `(0, vazio, vazio, mensagem)`.
    async fn send_once(
        &self,
        prepared: &PreparedRequest,
    ) -> (u16, HashMap<String, String>, String, Option<String>) {
        let method = reqwest::Method::from_bytes(prepared.method.as_str().as_bytes())
            .expect("método validado no protocolo");
        let mut builder = self
            .client
            .request(method, &prepared.url)
            .timeout(self.timeout);

        for (key, value) in &prepared.headers {
            builder = builder.header(key, value);
        }

        builder = match &prepared.body {
            PreparedBody::None => builder,
            PreparedBody::Json(text) => builder.body(text.clone()),
            PreparedBody::Form(fields) => {
                let mut form = reqwest::multipart::Form::new();
                for field in fields {
                    form = match (&field.text, &field.file) {
                        (Some(text), _) => form.text(field.key.clone(), text.clone()),
                        (None, Some((file_name, bytes))) => form.part(
                            field.key.clone(),
                            reqwest::multipart::Part::bytes(bytes.clone())
                                .file_name(file_name.clone()),
                        ),
                        (None, None) => form,
                    };
                }
                builder.multipart(form)
            }
        };

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers: HashMap<String, String> = response
                    .headers()
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.as_str().to_string(),
                            v.to_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect();
                let body = response.text().await.unwrap_or_default();
                (status, headers, body, None)
            }
            Err(e) => {
                warn!(url = %prepared.url, error = %e, "falha de I/O HTTP");
                (0, HashMap::new(), String::new(), Some(e.to_string()))
            }
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
