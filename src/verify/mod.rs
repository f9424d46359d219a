//! # Módulo de Verificação - Queries de Infra + Assertions
//!
//! Cada verificação de um step roda em duas fases:
//!
//! 1. **Pre-listen** (se `preListen = true`): antes da chamada HTTP do
//!    step, o listener é armado no conector (grupo de consumo isolado,
//!    posicionado no fim do tópico). O coordenador serializa isso antes
//!    de disparar a requisição, para o evento não ser perdido.
//! 2. **Assertions** (sempre, depois da chamada): o driver executa a
//!    query resolvida dentro do teto `queryTimeoutSeconds`, o JSON
//!    devolvido vira uma árvore e cada assertion é avaliada na ordem
//!    declarada.
//!
//! Uma verificação **passa** quando o driver respondeu sem erro, toda
//! assertion passou e a duração total coube em `timeoutSeconds`. Uma
//! verificação que falha NÃO mexe no código HTTP do step: o status vira
//! `VERIFICATION_FAILED` (a menos que o step já fosse `ERROR`).
//!
//! ## Operadores:
//!
//! `EQUALS`/`NOT_EQUALS` comparam a forma string (com tolerância
//! numérica: `1.0` é igual a `1`). `CONTAINS` cobre substring e
//! pertencimento em array. `GT/LT/GTE/LTE` exigem os dois lados
//! parseáveis como double, senão a assertion falha com mensagem
//! explicativa. `REGEX` compila o esperado e casa contra a forma
//! string. `EXISTS`/`NOT_EXISTS` checam presença do caminho.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::connectors::{ConnectorError, ConnectorFactory, ListenerSetup};
use crate::jsonpath;
use crate::protocol::{
    Assertion, AssertionOperator, AssertionResult, Environment, Verification, VerificationResult,
};

// ============================================================================
// RUNNER
// ============================================================================

/// Executa as verificações de um step contra a factory de conectores.
#[derive(Debug)]
pub struct VerificationRunner<'a> {
    factory: &'a ConnectorFactory,
}

impl<'a> VerificationRunner<'a> {
    pub fn new(factory: &'a ConnectorFactory) -> Self {
        Self { factory }
    }

    /// Fase de pre-listen: arma o listener ANTES da chamada HTTP.
    ///
    /// O motor fornece a identidade isolada do assinante; o driver só
    /// retorna quando a assinatura está posicionada.
    pub async fn start_pre_listen(
        &self,
        environment: &Environment,
        verification: &Verification,
        resolved_query: &str,
    ) -> Result<(), ConnectorError> {
        let connector = environment
            .connector(&verification.connector_name)
            .ok_or_else(|| {
                ConnectorError::UnknownConnector(verification.connector_name.clone())
            })?;
        let driver = self.factory.driver_for(connector)?;
        let setup = ListenerSetup::isolated();
        debug!(
            connector = %verification.connector_name,
            group = %setup.group_id,
            "armando listener de pre-listen"
        );
        driver
            .start_listener(&connector.config, resolved_query, &setup)
            .await
    }

    /// Fase de assertions: executa a query e avalia cada assertion.
    pub async fn run(
        &self,
        environment: &Environment,
        verification: &Verification,
        resolved_query: &str,
    ) -> VerificationResult {
        let started = Instant::now();
        let budget = Duration::from_secs(verification.timeout_seconds.max(1));
        let query_cap = Duration::from_secs(verification.query_timeout_seconds.max(1));

        let raw = match self
            .execute_query(environment, verification, resolved_query, query_cap)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(connector = %verification.connector_name, error = %err, "query de verificação falhou");
                return VerificationResult {
                    connector_name: verification.connector_name.clone(),
                    passed: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error_message: Some(err.to_string()),
                    assertion_results: Vec::new(),
                };
            }
        };

        // O contrato dos drivers é devolver JSON; qualquer outra coisa
        // é tratada como falha de query.
        let tree: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(tree) => tree,
            Err(_) => {
                return VerificationResult {
                    connector_name: verification.connector_name.clone(),
                    passed: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error_message: Some(format!(
                        "driver devolveu resultado não-JSON: '{}'",
                        truncate(&raw, 120)
                    )),
                    assertion_results: Vec::new(),
                };
            }
        };

        let assertion_results: Vec<AssertionResult> = verification
            .assertions
            .iter()
            .map(|a| evaluate_assertion(a, &tree))
            .collect();

        let duration = started.elapsed();
        let all_passed = assertion_results.iter().all(|r| r.passed);
        let within_budget = duration <= budget;

        VerificationResult {
            connector_name: verification.connector_name.clone(),
            passed: all_passed && within_budget,
            duration_ms: duration.as_millis() as u64,
            error_message: if within_budget {
                None
            } else {
                Some(format!(
                    "verificação excedeu o orçamento de {}s",
                    verification.timeout_seconds
                ))
            },
            assertion_results,
        }
    }

    async fn execute_query(
        &self,
        environment: &Environment,
        verification: &Verification,
        resolved_query: &str,
        query_cap: Duration,
    ) -> Result<String, ConnectorError> {
        let connector = environment
            .connector(&verification.connector_name)
            .ok_or_else(|| {
                ConnectorError::UnknownConnector(verification.connector_name.clone())
            })?;
        let driver = self.factory.driver_for(connector)?;

        // O teto vale mesmo para drivers que ignorem o parâmetro.
        match tokio::time::timeout(
            query_cap,
            driver.execute(&connector.config, resolved_query, query_cap),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(query_cap)),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============================================================================
// AVALIAÇÃO DE ASSERTION
// ============================================================================

/// Avalia uma assertion contra a árvore devolvida pelo driver.
pub fn evaluate_assertion(assertion: &Assertion, tree: &serde_json::Value) -> AssertionResult {
    let actual = jsonpath::evaluate(tree, &assertion.json_path);
    let actual_str = actual.as_ref().map(jsonpath::stringify);

    let (passed, message) = match assertion.operator {
        AssertionOperator::Exists => (actual.is_some(), None),
        AssertionOperator::NotExists => (actual.is_none(), None),
        _ => match &actual {
            None => (
                false,
                Some(format!(
                    "caminho '{}' não encontrado no resultado",
                    assertion.json_path
                )),
            ),
            Some(value) => check_operator(assertion, value),
        },
    };

    AssertionResult {
        json_path: assertion.json_path.clone(),
        operator: assertion.operator,
        expected_value: assertion.expected_value.clone(),
        actual_value: actual_str,
        passed,
        message,
    }
}

fn check_operator(assertion: &Assertion, actual: &serde_json::Value) -> (bool, Option<String>) {
    let expected = assertion.expected_value.as_str();
    let actual_str = jsonpath::stringify(actual);

    match assertion.operator {
        AssertionOperator::Equals => (loose_equals(&actual_str, expected), None),
        AssertionOperator::NotEquals => (!loose_equals(&actual_str, expected), None),
        AssertionOperator::Contains => (contains(actual, &actual_str, expected), None),
        AssertionOperator::NotContains => (!contains(actual, &actual_str, expected), None),
        AssertionOperator::Regex => match regex::Regex::new(expected) {
            Ok(re) => (re.is_match(&actual_str), None),
            Err(e) => (false, Some(format!("regex inválida '{}': {}", expected, e))),
        },
        AssertionOperator::Gt
        | AssertionOperator::Lt
        | AssertionOperator::Gte
        | AssertionOperator::Lte => numeric_compare(assertion.operator, &actual_str, expected),
        AssertionOperator::Exists | AssertionOperator::NotExists => (true, None),
    }
}

/// Igualdade string com tolerância numérica: "1.0" equivale a "1".
fn loose_equals(actual: &str, expected: &str) -> bool {
    if actual == expected {
        return true;
    }
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Substring para escalares; pertencimento para arrays.
fn contains(actual: &serde_json::Value, actual_str: &str, expected: &str) -> bool {
    if let Some(items) = actual.as_array() {
        return items.iter().any(|i| jsonpath::stringify(i) == expected);
    }
    actual_str.contains(expected)
}

/// Comparação numérica: os dois lados precisam parsear como double.
fn numeric_compare(
    operator: AssertionOperator,
    actual: &str,
    expected: &str,
) -> (bool, Option<String>) {
    let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) else {
        return (
            false,
            Some(format!(
                "operador numérico exige os dois lados como número (atual '{}', esperado '{}')",
                actual, expected
            )),
        );
    };
    let passed = match operator {
        AssertionOperator::Gt => a > b,
        AssertionOperator::Lt => a < b,
        AssertionOperator::Gte => a >= b,
        AssertionOperator::Lte => a <= b,
        _ => false,
    };
    (passed, None)
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::scripted::ScriptedDriver;
    use crate::connectors::ConnectorDriver;
    use crate::protocol::{ConnectorRef, ConnectorType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn assertion(path: &str, operator: AssertionOperator, expected: &str) -> Assertion {
        Assertion {
            json_path: path.to_string(),
            operator,
            expected_value: expected.to_string(),
        }
    }

    fn env_with_connector(kind: ConnectorType) -> Environment {
        let mut environment = Environment::empty();
        environment.connectors = vec![ConnectorRef {
            name: "infra".to_string(),
            connector_type: kind,
            config: HashMap::new(),
        }];
        environment
    }

    fn verification(assertions: Vec<Assertion>) -> Verification {
        Verification {
            connector_name: "infra".to_string(),
            query: "SELECT 1".to_string(),
            timeout_seconds: 5,
            query_timeout_seconds: 5,
            pre_listen: false,
            assertions,
        }
    }

    // ------------------------------------------------------------------
    // Operadores
    // ------------------------------------------------------------------

    #[test]
    fn test_equals_with_numeric_tolerance() {
        let tree = json!({"rowCount": 1});
        let r = evaluate_assertion(
            &assertion("$.rowCount", AssertionOperator::Equals, "1.0"),
            &tree,
        );
        assert!(r.passed);
        assert_eq!(r.actual_value.as_deref(), Some("1"));
    }

    #[test]
    fn test_not_equals() {
        let tree = json!({"status": "PAID"});
        assert!(
            evaluate_assertion(
                &assertion("$.status", AssertionOperator::NotEquals, "PENDING"),
                &tree
            )
            .passed
        );
    }

    #[test]
    fn test_contains_substring_and_array_membership() {
        let tree = json!({"msg": "order created", "tags": ["a", "b"]});
        assert!(
            evaluate_assertion(&assertion("$.msg", AssertionOperator::Contains, "created"), &tree)
                .passed
        );
        assert!(
            evaluate_assertion(&assertion("$.tags", AssertionOperator::Contains, "b"), &tree)
                .passed
        );
        assert!(
            evaluate_assertion(
                &assertion("$.tags", AssertionOperator::NotContains, "z"),
                &tree
            )
            .passed
        );
    }

    #[test]
    fn test_numeric_operators() {
        let tree = json!({"count": 5});
        assert!(evaluate_assertion(&assertion("$.count", AssertionOperator::Gt, "4"), &tree).passed);
        assert!(evaluate_assertion(&assertion("$.count", AssertionOperator::Gte, "5"), &tree).passed);
        assert!(evaluate_assertion(&assertion("$.count", AssertionOperator::Lt, "6"), &tree).passed);
        assert!(!evaluate_assertion(&assertion("$.count", AssertionOperator::Lte, "4"), &tree).passed);
    }

    #[test]
    fn test_numeric_operator_requires_numbers() {
        let tree = json!({"name": "ana"});
        let r = evaluate_assertion(&assertion("$.name", AssertionOperator::Gt, "3"), &tree);
        assert!(!r.passed);
        assert!(r.message.unwrap().contains("numérico"));
    }

    #[test]
    fn test_regex_operator() {
        let tree = json!({"id": "ord-12345"});
        assert!(
            evaluate_assertion(
                &assertion("$.id", AssertionOperator::Regex, r"^ord-\d+$"),
                &tree
            )
            .passed
        );
        let bad = evaluate_assertion(&assertion("$.id", AssertionOperator::Regex, "("), &tree);
        assert!(!bad.passed);
        assert!(bad.message.unwrap().contains("regex inválida"));
    }

    #[test]
    fn test_exists_and_not_exists() {
        let tree = json!({"a": null});
        assert!(evaluate_assertion(&assertion("$.a", AssertionOperator::Exists, ""), &tree).passed);
        assert!(
            evaluate_assertion(&assertion("$.b", AssertionOperator::NotExists, ""), &tree).passed
        );
        let missing = evaluate_assertion(&assertion("$.b", AssertionOperator::Equals, "x"), &tree);
        assert!(!missing.passed);
        assert!(missing.message.unwrap().contains("não encontrado"));
    }

    // ------------------------------------------------------------------
    // Runner
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_passes_when_everything_lines_up() {
        let factory = ConnectorFactory::new().with_driver(Arc::new(ScriptedDriver::always(
            ConnectorType::Postgres,
            r#"{"rows":[{"status":"PAID"}],"rowCount":1}"#,
        )));
        let environment = env_with_connector(ConnectorType::Postgres);
        let runner = VerificationRunner::new(&factory);

        let result = runner
            .run(
                &environment,
                &verification(vec![
                    assertion("$.rowCount", AssertionOperator::Equals, "1"),
                    assertion("$.rows[0].status", AssertionOperator::Equals, "PAID"),
                ]),
                "SELECT status FROM orders",
            )
            .await;

        assert!(result.passed);
        assert_eq!(result.assertion_results.len(), 2);
        assert!(result.error_message.is_none());
    }

    #[tokio::test]
    async fn test_run_fails_on_driver_error() {
        let factory = ConnectorFactory::new().with_driver(Arc::new(ScriptedDriver::new(
            ConnectorType::Redis,
            vec![Err("connection refused".to_string())],
        )));
        let environment = env_with_connector(ConnectorType::Redis);
        let runner = VerificationRunner::new(&factory);

        let result = runner
            .run(&environment, &verification(vec![]), "GET k")
            .await;
        assert!(!result.passed);
        assert!(result.error_message.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_run_fails_on_unknown_connector() {
        let factory = ConnectorFactory::new();
        let environment = Environment::empty();
        let runner = VerificationRunner::new(&factory);

        let result = runner
            .run(&environment, &verification(vec![]), "PING")
            .await;
        assert!(!result.passed);
        assert!(result.error_message.unwrap().contains("infra"));
    }

    #[tokio::test]
    async fn test_run_fails_on_non_json_result() {
        let factory = ConnectorFactory::new().with_driver(Arc::new(ScriptedDriver::always(
            ConnectorType::Redis,
            "PONG",
        )));
        let environment = env_with_connector(ConnectorType::Redis);
        let runner = VerificationRunner::new(&factory);

        let result = runner
            .run(&environment, &verification(vec![]), "PING")
            .await;
        assert!(!result.passed);
        assert!(result.error_message.unwrap().contains("não-JSON"));
    }

    #[tokio::test]
    async fn test_query_cap_interrupts_slow_driver() {
        struct SleepyDriver;

        #[async_trait]
        impl ConnectorDriver for SleepyDriver {
            fn connector_type(&self) -> ConnectorType {
                ConnectorType::Kafka
            }

            async fn execute(
                &self,
                _config: &HashMap<String, String>,
                _query: &str,
                _timeout: Duration,
            ) -> Result<String, ConnectorError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("{}".to_string())
            }
        }

        let factory = ConnectorFactory::new().with_driver(Arc::new(SleepyDriver));
        let environment = env_with_connector(ConnectorType::Kafka);
        let runner = VerificationRunner::new(&factory);

        let mut v = verification(vec![]);
        v.query_timeout_seconds = 1;

        // pause() faz o relógio do tokio avançar sozinho: o teste não
        // espera de verdade.
        tokio::time::pause();
        let result = runner.run(&environment, &v, "topic=events").await;
        assert!(!result.passed);
        assert!(result.error_message.unwrap().contains("tempo limite"));
    }

    #[tokio::test]
    async fn test_pre_listen_records_isolated_group() {
        let driver = Arc::new(ScriptedDriver::always(ConnectorType::Kafka, "{}"));
        let factory = ConnectorFactory::new().with_driver(driver.clone());
        let environment = env_with_connector(ConnectorType::Kafka);
        let runner = VerificationRunner::new(&factory);

        let mut v = verification(vec![]);
        v.pre_listen = true;
        runner
            .start_pre_listen(&environment, &v, "topic=events\nkey=k1")
            .await
            .unwrap();

        let calls = driver.calls.lock().unwrap();
        assert_eq!(calls.listens, vec!["topic=events\nkey=k1".to_string()]);
        assert!(calls.group_ids[0].starts_with("orch-verify-"));
    }
}
