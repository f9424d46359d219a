//! # Módulo de Validação de Suítes
//!
//! Valida os invariantes de um snapshot antes de executar, para
//! descobrir problemas cedo e com mensagens claras.
//!
//! ## Para leigos:
//!
//! Imagine conferir um formulário antes de enviar: campos obrigatórios
//! preenchidos, nada duplicado, nenhuma referência para algo que não
//! existe. Este módulo faz isso para suítes e ambientes. O mesmo check
//! roda no save (pelo catálogo) e de novo no início do run (aqui).
//!
//! ## Invariantes verificados:
//!
//! 1. **Nomes de step únicos** dentro da suíte (e não vazios)
//! 2. **Dependências existem** e nenhum step depende de si mesmo
//! 3. **Grafo é um DAG** (ciclos são rejeitados, via planner)
//! 4. **`FIRE_SIDE_EFFECT` aponta** para um step da mesma suíte
//! 5. **Variáveis extraídas** com nomes únicos por step
//! 6. **Chaves de variável e de arquivo únicas** por ambiente
//!
//! A gramática de `matchCode` (`200` | `2xx`..`5xx`) é validada na
//! desserialização: um snapshot com padrão inválido nem carrega.

use std::collections::HashSet;
use thiserror::Error;

use crate::planner;
use crate::protocol::{Environment, HandlerAction, Step, Suite, SuiteSnapshot};

// ============================================================================
// TIPOS DE ERRO
// ============================================================================

/// Erros de validação de snapshot.
///
/// Cada variante representa um invariante quebrado. A validação coleta
/// TODOS os problemas de uma vez em vez de parar no primeiro.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("suíte '{suite}': nome de step duplicado '{name}'")]
    DuplicateStepName { suite: String, name: String },

    #[error("suíte '{suite}': step com nome vazio")]
    EmptyStepName { suite: String },

    #[error("step '{step}': dependência aponta para step inexistente")]
    UnknownDependency { step: String },

    #[error("step '{step}': depende de si mesmo")]
    SelfDependency { step: String },

    #[error("ciclo de dependências envolvendo: {steps:?}")]
    CircularDependency { steps: Vec<String> },

    #[error("step '{step}': handler FIRE_SIDE_EFFECT sem sideEffectStepId")]
    SideEffectWithoutTarget { step: String },

    #[error("step '{step}': sideEffectStepId aponta para fora da suíte")]
    SideEffectUnknownTarget { step: String },

    #[error("step '{step}': variável extraída duplicada '{name}'")]
    DuplicateExtractedVariable { step: String, name: String },

    #[error("step '{step}': verificação referencia conector desconhecido '{connector}'")]
    UnknownConnector { step: String, connector: String },

    #[error("ambiente '{environment}': chave de variável duplicada '{key}'")]
    DuplicateVariableKey { environment: String, key: String },

    #[error("ambiente '{environment}': fileKey duplicado '{key}'")]
    DuplicateFileKey { environment: String, key: String },
}

/// Resultado da validação: sucesso ou a lista completa de problemas.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

// ============================================================================
// VALIDAÇÃO DE SNAPSHOT
// ============================================================================

/// Valida a suíte e todos os ambientes de um snapshot hidratado.
pub fn validate_snapshot(snapshot: &SuiteSnapshot) -> ValidationResult {
    let mut errors = Vec::new();

    collect_suite_errors(&snapshot.suite, &snapshot.environments, &mut errors);
    for environment in &snapshot.environments {
        collect_environment_errors(environment, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Valida uma suíte isolada (sem checar conectores de ambiente).
pub fn validate_suite(suite: &Suite) -> ValidationResult {
    let mut errors = Vec::new();
    collect_suite_errors(suite, &[], &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn collect_suite_errors(
    suite: &Suite,
    environments: &[Environment],
    errors: &mut Vec<ValidationError>,
) {
    // Nomes únicos e não vazios.
    let mut seen_names: HashSet<&str> = HashSet::new();
    for step in &suite.steps {
        if step.name.trim().is_empty() {
            errors.push(ValidationError::EmptyStepName {
                suite: suite.name.clone(),
            });
            continue;
        }
        if !seen_names.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName {
                suite: suite.name.clone(),
                name: step.name.clone(),
            });
        }
    }

    let step_ids: HashSet<_> = suite.steps.iter().map(|s| s.id).collect();

    for step in &suite.steps {
        collect_step_errors(step, &step_ids, environments, errors);
    }

    // Ciclos complexos (A→B→C→A) saem do mesmo check que o run usa.
    if let Err(planner::PlanError::CycleDetected { steps }) = planner::plan_suite(suite) {
        errors.push(ValidationError::CircularDependency { steps });
    }
}

fn collect_step_errors(
    step: &Step,
    step_ids: &HashSet<uuid::Uuid>,
    environments: &[Environment],
    errors: &mut Vec<ValidationError>,
) {
    for dep in &step.dependencies {
        if dep.depends_on_step_id == step.id {
            errors.push(ValidationError::SelfDependency {
                step: step.name.clone(),
            });
        } else if !step_ids.contains(&dep.depends_on_step_id) {
            errors.push(ValidationError::UnknownDependency {
                step: step.name.clone(),
            });
        }
    }

    for handler in &step.response_handlers {
        if handler.action == HandlerAction::FireSideEffect {
            match handler.side_effect_step_id {
                None => errors.push(ValidationError::SideEffectWithoutTarget {
                    step: step.name.clone(),
                }),
                Some(target) if !step_ids.contains(&target) => {
                    errors.push(ValidationError::SideEffectUnknownTarget {
                        step: step.name.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    let mut seen_vars: HashSet<&str> = HashSet::new();
    for extraction in &step.extracted_variables {
        if !seen_vars.insert(extraction.variable_name.as_str()) {
            errors.push(ValidationError::DuplicateExtractedVariable {
                step: step.name.clone(),
                name: extraction.variable_name.clone(),
            });
        }
    }

    // Verificações precisam achar o conector em algum ambiente do
    // snapshot. Sem ambientes hidratados o check fica para o run.
    if !environments.is_empty() {
        for verification in &step.verifications {
            let known = environments
                .iter()
                .any(|e| e.connector(&verification.connector_name).is_some());
            if !known {
                errors.push(ValidationError::UnknownConnector {
                    step: step.name.clone(),
                    connector: verification.connector_name.clone(),
                });
            }
        }
    }
}

fn collect_environment_errors(environment: &Environment, errors: &mut Vec<ValidationError>) {
    let mut seen_keys: HashSet<&str> = HashSet::new();
    for variable in &environment.variables {
        if !seen_keys.insert(variable.key.as_str()) {
            errors.push(ValidationError::DuplicateVariableKey {
                environment: environment.name.clone(),
                key: variable.key.clone(),
            });
        }
    }

    let mut seen_files: HashSet<&str> = HashSet::new();
    for file in &environment.files {
        if !seen_files.insert(file.file_key.as_str()) {
            errors.push(ValidationError::DuplicateFileKey {
                environment: environment.name.clone(),
                key: file.file_key.clone(),
            });
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        BodyType, EnvironmentVariable, ExtractedVariable, ExtractionSource, HttpMethod, MatchCode,
        ResponseHandler, StepDependency, StoredFile, ValueKind,
    };
    use uuid::Uuid;

    fn base_step(name: &str) -> Step {
        Step {
            id: Uuid::new_v4(),
            name: name.to_string(),
            method: HttpMethod::Get,
            url: "/x".to_string(),
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

    fn suite_of(steps: Vec<Step>) -> Suite {
        Suite {
            id: Uuid::new_v4(),
            name: "s".to_string(),
            environment_id: None,
            steps,
            deleted_at: None,
        }
    }

    #[test]
    fn test_valid_suite_passes() {
        let a = base_step("A");
        let mut b = base_step("B");
        b.dependencies = vec![StepDependency {
            depends_on_step_id: a.id,
            use_cache: None,
            reuse_manual_input: false,
        }];
        assert!(validate_suite(&suite_of(vec![a, b])).is_ok());
    }

    #[test]
    fn test_duplicate_step_name() {
        let errors = validate_suite(&suite_of(vec![base_step("A"), base_step("A")])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateStepName { .. })));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut a = base_step("A");
        a.dependencies = vec![StepDependency {
            depends_on_step_id: a.id,
            use_cache: None,
            reuse_manual_input: false,
        }];
        let errors = validate_suite(&suite_of(vec![a])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::SelfDependency { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut a = base_step("A");
        let mut b = base_step("B");
        a.dependencies = vec![StepDependency {
            depends_on_step_id: b.id,
            use_cache: None,
            reuse_manual_input: false,
        }];
        b.dependencies = vec![StepDependency {
            depends_on_step_id: a.id,
            use_cache: None,
            reuse_manual_input: false,
        }];
        let errors = validate_suite(&suite_of(vec![a, b])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::CircularDependency { .. })));
    }

    #[test]
    fn test_side_effect_must_point_inside_suite() {
        let mut a = base_step("A");
        a.response_handlers = vec![ResponseHandler {
            priority: 1,
            match_code: MatchCode::Range(2),
            action: HandlerAction::FireSideEffect,
            retry_count: 0,
            retry_delay_seconds: 0,
            side_effect_step_id: Some(Uuid::new_v4()),
        }];
        let errors = validate_suite(&suite_of(vec![a])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::SideEffectUnknownTarget { .. })));

        let mut b = base_step("B");
        b.response_handlers = vec![ResponseHandler {
            priority: 1,
            match_code: MatchCode::Range(2),
            action: HandlerAction::FireSideEffect,
            retry_count: 0,
            retry_delay_seconds: 0,
            side_effect_step_id: None,
        }];
        let errors = validate_suite(&suite_of(vec![b])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::SideEffectWithoutTarget { .. })));
    }

    #[test]
    fn test_duplicate_extracted_variable() {
        let mut a = base_step("A");
        a.extracted_variables = vec![
            ExtractedVariable {
                variable_name: "token".to_string(),
                json_path: "$.t".to_string(),
                source: ExtractionSource::ResponseBody,
            },
            ExtractedVariable {
                variable_name: "token".to_string(),
                json_path: "$.u".to_string(),
                source: ExtractionSource::ResponseBody,
            },
        ];
        let errors = validate_suite(&suite_of(vec![a])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateExtractedVariable { .. })));
    }

    #[test]
    fn test_environment_unique_keys() {
        let mut environment = Environment::empty();
        environment.name = "staging".to_string();
        environment.variables = vec![
            EnvironmentVariable {
                key: "K".to_string(),
                value: "1".to_string(),
                value_type: ValueKind::Static,
                secret: false,
            },
            EnvironmentVariable {
                key: "K".to_string(),
                value: "2".to_string(),
                value_type: ValueKind::Static,
                secret: false,
            },
        ];
        environment.files = vec![
            StoredFile {
                file_key: "f".to_string(),
                file_name: None,
                data: String::new(),
            },
            StoredFile {
                file_key: "f".to_string(),
                file_name: None,
                data: String::new(),
            },
        ];

        let snapshot = SuiteSnapshot {
            suite: suite_of(vec![base_step("A")]),
            environments: vec![environment],
        };
        let errors = validate_snapshot(&snapshot).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateVariableKey { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateFileKey { .. })));
    }

    #[test]
    fn test_collects_multiple_errors_at_once() {
        let mut a = base_step("Dup");
        a.dependencies = vec![StepDependency {
            depends_on_step_id: Uuid::new_v4(),
            use_cache: None,
            reuse_manual_input: false,
        }];
        let b = base_step("Dup");
        let errors = validate_suite(&suite_of(vec![a, b])).unwrap_err();
        assert!(errors.len() >= 2);
    }
}
