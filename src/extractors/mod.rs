//! # Módulo de Extração - Bindings Pós-Execução
//!
//! Depois que o executor finaliza um step, este módulo computa os
//! bindings das variáveis extraídas a partir da tabela
//! `(source, jsonPath)` declarada no step.
//!
//! ## Para todos entenderem:
//!
//! Imagine que o step de login devolve `{ "data": { "token": "abc" } }`.
//! Uma regra `(token, $.data.token, RESPONSE_BODY)` captura o "abc" e o
//! publica com o nome `token`. Steps seguintes usam `{{Login.token}}`.
//!
//! ## Fontes suportadas:
//!
//! | Source            | O que o `jsonPath` significa                |
//! |-------------------|---------------------------------------------|
//! | `RESPONSE_BODY`   | Caminho JSON no body da resposta            |
//! | `RESPONSE_HEADER` | Nome exato do header da resposta            |
//! | `STATUS_CODE`     | Ignorado; o código vira string              |
//! | `REQUEST_BODY`    | Caminho JSON no body resolvido da requisição |
//! | `REQUEST_HEADER`  | Nome exato do header enviado                |
//! | `QUERY_PARAM`     | Nome exato do parâmetro enviado             |
//! | `REQUEST_URL`     | Ignorado; a URL totalmente resolvida        |
//!
//! Campo ausente vira string vazia E gera um warning no resultado do
//! step. Os bindings são publicados duas vezes: no namespace do run
//! (`NomeDoStep.variavel`) e no contexto consumido pelos placeholders
//! `{{...}}` dos steps seguintes.

use serde_json::Value;
use std::collections::HashMap;

use crate::jsonpath;
use crate::protocol::{ExtractedVariable, ExtractionSource};

// ============================================================================
// ENTRADA E SAÍDA
// ============================================================================

/// Visão da troca HTTP resolvida que a extração enxerga.
#[derive(Debug)]
pub struct ExtractionInput<'a> {
    pub response_body: &'a str,
    pub response_headers: &'a HashMap<String, String>,
    pub status_code: u16,
    pub request_body: &'a str,
    pub request_headers: &'a HashMap<String, String>,
    pub request_query_params: &'a HashMap<String, String>,
    pub request_url: &'a str,
}

/// Bindings computados de um step.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    /// Valores tipados, para o contexto dos placeholders `{{...}}`.
    pub bindings: HashMap<String, Value>,
    /// Forma string, ecoada em `extractedVariables` do resultado.
    pub strings: HashMap<String, String>,
    pub warnings: Vec<String>,
}

// ============================================================================
// EXTRAÇÃO
// ============================================================================

/// Computa todos os bindings declarados de um step.
pub fn extract(rules: &[ExtractedVariable], input: &ExtractionInput<'_>) -> ExtractionOutcome {
    let mut outcome = ExtractionOutcome::default();

    // Bodies são parseados uma vez só; texto não-JSON vira string crua,
    // alcançável com o caminho `$`.
    let response_tree = parse_tree(input.response_body);
    let request_tree = parse_tree(input.request_body);

    for rule in rules {
        let value = match rule.source {
            ExtractionSource::ResponseBody => jsonpath::evaluate(&response_tree, &rule.json_path),
            ExtractionSource::RequestBody => jsonpath::evaluate(&request_tree, &rule.json_path),
            ExtractionSource::ResponseHeader => input
                .response_headers
                .get(&rule.json_path)
                .map(|v| Value::String(v.clone())),
            ExtractionSource::RequestHeader => input
                .request_headers
                .get(&rule.json_path)
                .map(|v| Value::String(v.clone())),
            ExtractionSource::QueryParam => input
                .request_query_params
                .get(&rule.json_path)
                .map(|v| Value::String(v.clone())),
            ExtractionSource::StatusCode => Some(Value::String(input.status_code.to_string())),
            ExtractionSource::RequestUrl => Some(Value::String(input.request_url.to_string())),
        };

        match value {
            Some(found) => {
                outcome
                    .strings
                    .insert(rule.variable_name.clone(), jsonpath::stringify(&found));
                outcome.bindings.insert(rule.variable_name.clone(), found);
            }
            None => {
                outcome.warnings.push(format!(
                    "extração '{}' sem valor na fonte {:?} (caminho '{}')",
                    rule.variable_name, rule.source, rule.json_path
                ));
                outcome
                    .strings
                    .insert(rule.variable_name.clone(), String::new());
                outcome
                    .bindings
                    .insert(rule.variable_name.clone(), Value::String(String::new()));
            }
        }
    }

    outcome
}

/// Parseia um body como JSON; texto cru vira `Value::String`.
pub fn parse_tree(body: &str) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

// ============================================================================
// TESTES
// ============================================================================
