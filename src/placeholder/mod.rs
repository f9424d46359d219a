//! # Módulo de Placeholders - Resolução de Templates
//!
//! Este módulo expande os placeholders embutidos em URLs, headers,
//! bodies, query params e queries de verificação.
//!
//! ## Para todos entenderem:
//!
//! Um step raramente é escrito com valores fixos. Ele diz coisas como
//! "chame `${BASE_URL}/users` com o token que o step Login extraiu".
//! O resolvedor é quem troca esses pedaços pelo valor real na hora de
//! executar.
//!
//! ## As quatro famílias de placeholder:
//!
//! | Sintaxe              | Fonte                                        |
//! |----------------------|----------------------------------------------|
//! | `${NOME}`            | Variável do ambiente                         |
//! | `${FILE:chave}`      | Arquivo do ambiente (token fica para o executor HTTP) |
//! | `{{Step.caminho}}`   | Contexto publicado por um step anterior      |
//! | `#{nome}` / `#{nome:padrão}` | Input manual do operador             |
//!
//! ## Regras do scanner:
//!
//! - Uma única passada da esquerda para a direita. O texto expandido
//!   NÃO é re-escaneado (sem recursão acidental).
//! - Placeholder desconhecido ou desbalanceado fica como texto literal
//!   e vira um `warning` no resultado do step.
//! - Variável de tipo `VARIABLE` expande referências `${X}` internas em
//!   exatamente um nível; `UUID` gera um v4 novo POR OCORRÊNCIA;
//!   `ISO_TIMESTAMP` emite o agora em UTC ISO-8601 com milissegundos.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::jsonpath;
use crate::protocol::{Environment, ValueKind};

// ============================================================================
// CONTEXTO DE RESOLUÇÃO
// ============================================================================

/// Contexto publicado por um step já executado, consumido pelos
/// placeholders `{{Step.caminho}}` dos steps seguintes.
///
/// O caminho é tentado primeiro contra os bindings extraídos (quando é
/// um identificador simples que bate com um nome declarado) e depois
/// contra a árvore implícita (`response`, `status`, `headers`,
/// `request.*`).
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    /// Bindings das variáveis extraídas, pelo nome declarado.
    pub extracted: HashMap<String, Value>,
    /// Árvore implícita com a resposta e a requisição resolvida.
    pub implicit: Value,
}

impl StepContext {
    /// Busca um caminho neste contexto.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        if !path.contains('.') && !path.contains('[') {
            if let Some(bound) = self.extracted.get(path) {
                return Some(bound.clone());
            }
        }
        jsonpath::evaluate(&self.implicit, path)
    }
}

/// Tudo que o resolvedor enxerga ao expandir um template.
#[derive(Debug)]
pub struct ResolutionContext<'a> {
    pub environment: &'a Environment,
    /// Contextos dos steps já executados, por NOME do step.
    pub steps: &'a HashMap<String, StepContext>,
    /// Valores de input manual já disponíveis neste run.
    pub inputs: &'a HashMap<String, String>,
}

/// Resultado de uma resolução: o texto final e os avisos colhidos.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub text: String,
    pub warnings: Vec<String>,
}

/// Campo de input manual encontrado em um template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFieldRef {
    pub name: String,
    pub default_value: Option<String>,
}

// ============================================================================
// EXPANSÃO DE VALUE KIND
// ============================================================================

/// Expande um valor conforme o tipo declarado no ambiente.
///
/// `VARIABLE` substitui referências `${X}` internas usando o valor das
/// variáveis referenciadas, um nível só: se `X` também for `VARIABLE`,
/// o texto dela entra como está, sem nova expansão.
pub fn expand_kind(value: &str, kind: ValueKind, environment: &Environment) -> String {
    match kind {
        ValueKind::Static => value.to_string(),
        ValueKind::Uuid => Uuid::new_v4().to_string(),
        ValueKind::IsoTimestamp => iso_timestamp_now(),
        ValueKind::Variable => expand_one_level(value, environment),
    }
}

/// Agora em UTC, ISO-8601 com milissegundos (`2024-01-15T12:00:00.000Z`).
fn iso_timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Um nível de substituição de `${X}` dentro do valor de uma variável
/// tipo `VARIABLE`. Referências não encontradas ficam literais.
fn expand_one_level(value: &str, environment: &Environment) -> String {
    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && value[i..].starts_with("${") {
            if let Some(close) = value[i + 2..].find('}') {
                let name = &value[i + 2..i + 2 + close];
                match environment.variable(name) {
                    Some(var) => match var.value_type {
                        // Sem recursão além deste nível.
                        ValueKind::Variable | ValueKind::Static => out.push_str(&var.value),
                        ValueKind::Uuid => out.push_str(&Uuid::new_v4().to_string()),
                        ValueKind::IsoTimestamp => out.push_str(&iso_timestamp_now()),
                    },
                    None => out.push_str(&value[i..i + 2 + close + 1]),
                }
                i += 2 + close + 1;
                continue;
            }
        }
        let ch = value[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

// ============================================================================
// SCANNER PRINCIPAL
// ============================================================================

/// Resolve um template em uma única passada da esquerda para a direita.
///
/// Reconhece os tokens de abertura das quatro famílias e despacha cada
/// uma para a fonte certa. O que não casar com nada conhecido segue
/// literal, com um aviso.
pub fn resolve(template: &str, ctx: &ResolutionContext<'_>) -> Resolved {
    let mut out = String::with_capacity(template.len());
    let mut warnings = Vec::new();
    let mut i = 0;

    while i < template.len() {
        let rest = &template[i..];

        // ${FILE:chave} fica intacto: quem troca por bytes é o executor
        // HTTP, e só em campos file de form-data.
        if rest.starts_with("${FILE:") {
            match rest.find('}') {
                Some(close) => {
                    out.push_str(&rest[..=close]);
                    i += close + 1;
                }
                None => {
                    warnings.push(format!("placeholder desbalanceado: '{}'", rest));
                    out.push_str(rest);
                    break;
                }
            }
            continue;
        }

        // ${NOME}: variável do ambiente.
        if rest.starts_with("${") {
            match rest.find('}') {
                Some(close) => {
                    let name = &rest[2..close];
                    match ctx.environment.variable(name) {
                        Some(var) => {
                            out.push_str(&expand_kind(&var.value, var.value_type, ctx.environment));
                        }
                        None => {
                            warnings.push(format!(
                                "variável de ambiente não resolvida: '${{{}}}'",
                                name
                            ));
                            out.push_str(&rest[..=close]);
                        }
                    }
                    i += close + 1;
                }
                None => {
                    warnings.push(format!("placeholder desbalanceado: '{}'", rest));
                    out.push_str(rest);
                    break;
                }
            }
            continue;
        }

        // {{Step.caminho}}: contexto de um step anterior.
        if rest.starts_with("{{") {
            match rest.find("}}") {
                Some(close) => {
                    let token = rest[2..close].trim();
                    match expand_step_reference(token, ctx) {
                        StepLookup::Value(text) => out.push_str(&text),
                        StepLookup::MissingPath => {
                            // Chave ausente vira string vazia na
                            // interpolação; presença é papel de
                            // EXISTS/NOT_EXISTS.
                        }
                        StepLookup::UnknownStep => {
                            warnings.push(format!(
                                "referência de step não resolvida: '{{{{{}}}}}'",
                                token
                            ));
                            out.push_str(&rest[..close + 2]);
                        }
                    }
                    i += close + 2;
                }
                None => {
                    warnings.push(format!("placeholder desbalanceado: '{}'", rest));
                    out.push_str(rest);
                    break;
                }
            }
            continue;
        }

        // #{nome} ou #{nome:padrão}: input manual.
        if rest.starts_with("#{") {
            match rest.find('}') {
                Some(close) => {
                    let token = &rest[2..close];
                    let (name, default) = split_input_token(token);
                    match ctx.inputs.get(name) {
                        Some(value) => out.push_str(value),
                        None => match default {
                            Some(d) => out.push_str(d),
                            None => {
                                warnings.push(format!("input manual sem valor: '{}'", name));
                            }
                        },
                    }
                    i += close + 1;
                }
                None => {
                    warnings.push(format!("placeholder desbalanceado: '{}'", rest));
                    out.push_str(rest);
                    break;
                }
            }
            continue;
        }

        let ch = rest.chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }

    Resolved {
        text: out,
        warnings,
    }
}

enum StepLookup {
    Value(String),
    MissingPath,
    UnknownStep,
}

/// Expande `Step.caminho` contra o contexto publicado do step.
fn expand_step_reference(token: &str, ctx: &ResolutionContext<'_>) -> StepLookup {
    let Some((step_name, path)) = token.split_once('.') else {
        return StepLookup::UnknownStep;
    };
    let Some(step_ctx) = ctx.steps.get(step_name) else {
        return StepLookup::UnknownStep;
    };
    match step_ctx.lookup(path) {
        Some(value) => StepLookup::Value(jsonpath::stringify(&value)),
        None => StepLookup::MissingPath,
    }
}

/// Divide `nome:padrão` no PRIMEIRO `:`; o padrão pode conter `:`.
fn split_input_token(token: &str) -> (&str, Option<&str>) {
    match token.split_once(':') {
        Some((name, default)) => (name, Some(default)),
        None => (token, None),
    }
}

// ============================================================================
// COLETA DE INPUTS MANUAIS
// ============================================================================

/// Varre um template e coleta as ocorrências `#{nome[:padrão]}`.
///
/// Nomes repetidos são deduplicados; o primeiro padrão encontrado vale.
pub fn scan_input_fields(template: &str) -> Vec<InputFieldRef> {
    let mut fields: Vec<InputFieldRef> = Vec::new();
    let mut i = 0;

    while i < template.len() {
        let rest = &template[i..];
        if rest.starts_with("#{") {
            if let Some(close) = rest.find('}') {
                let (name, default) = split_input_token(&rest[2..close]);
                if !name.is_empty() && !fields.iter().any(|f| f.name == name) {
                    fields.push(InputFieldRef {
                        name: name.to_string(),
                        default_value: default.map(str::to_string),
                    });
                }
                i += close + 1;
                continue;
            }
            break; // desbalanceado: a resolução avisa, aqui só paramos
        }
        let ch = rest.chars().next().unwrap();
        i += ch.len_utf8();
    }

    fields
}

// ============================================================================
// SEGREDOS
// ============================================================================

/// Valores de variáveis secretas que precisam ser mascarados quando a
/// requisição resolvida é ecoada nos resultados.
pub fn secret_values(environment: &Environment) -> Vec<String> {
    environment
        .variables
        .iter()
        .filter(|v| v.secret && !v.value.is_empty())
        .map(|v| v.value.clone())
        .collect()
}

/// Substitui ocorrências de valores secretos por `******`.
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    let mut masked = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            masked = masked.replace(secret.as_str(), "******");
        }
    }
    masked
}

// ============================================================================
// TESTES
// ============================================================================
