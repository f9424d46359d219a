//! # Módulo de Erros do Motor
//!
//! Define a taxonomia de erros que atravessa o motor: o que aborta um
//! run inteiro, o que vira estado terminal de um step e o que volta
//! síncrono para quem chamou o control plane.
//!
//! ## Para todos entenderem:
//!
//! Nem toda falha tem o mesmo peso. Um ciclo no grafo derruba o run
//! antes do primeiro step; um timeout HTTP derruba só aquele step (e
//! pula os dependentes); um id desconhecido nem cria run. Cada
//! variante carrega uma tag estável (`kind`) que dashboards e CI podem
//! usar sem parsear mensagens.
//!
//! | Tag                       | Efeito                                  |
//! |---------------------------|-----------------------------------------|
//! | `VALIDATION`              | Síncrono, nenhum run criado             |
//! | `NOT_FOUND`               | Síncrono                                |
//! | `CYCLE_DETECTED`          | Run aborta com `run-error`              |
//! | `RESOLUTION`              | Step vira `ERROR`, mensagem cita o token |
//! | `HTTP_IO`                 | Step vira `ERROR` (status 0)            |
//! | `HANDLER_RETRY_EXHAUSTED` | Step vira `ERROR`                       |
//! | `VERIFICATION_QUERY`      | Verificação falha, step `VERIFICATION_FAILED` |
//! | `ASSERTION`               | Idem                                    |
//! | `INPUT_TIMEOUT`           | Step vira `ERROR`, run continua         |
//! | `CANCELLED`               | Steps restantes `SKIPPED`, run `CANCELLED` |

use thiserror::Error;

use crate::planner::PlanError;

/// Erro estruturado do motor de execução.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Entrada inválida no control plane (payload, ids, grammar).
    #[error("requisição inválida: {0}")]
    Validation(String),

    /// Entidade desconhecida (suíte, step, run, conector).
    #[error("não encontrado: {0}")]
    NotFound(String),

    /// Falha de planejamento: ciclo ou referência quebrada no grafo.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Placeholder ou referência de arquivo sem resolução.
    #[error("falha de resolução: {0}")]
    Resolution(String),

    /// Falha de I/O na chamada HTTP (conexão, timeout). Vira status 0.
    #[error("falha de I/O HTTP: {0}")]
    HttpIo(String),

    /// O handler de retry esgotou as tentativas.
    #[error("retry esgotado após {attempts} tentativa(s): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// O driver do conector falhou ao executar a query.
    #[error("query de verificação falhou em '{connector}': {message}")]
    VerificationQuery { connector: String, message: String },

    /// Pelo menos uma assertion avaliou falso.
    #[error("assertion falhou: {0}")]
    Assertion(String),

    /// O operador não submeteu os inputs dentro do prazo.
    #[error("timeout aguardando input manual do step '{step}'")]
    InputTimeout { step: String },

    /// Cancelamento explícito ou queda do transporte.
    #[error("run cancelado")]
    Cancelled,
}

impl EngineError {
    /// Tag estável da taxonomia, independente da mensagem.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Plan(e) => e.kind(),
            Self::Resolution(_) => "RESOLUTION",
            Self::HttpIo(_) => "HTTP_IO",
            Self::RetryExhausted { .. } => "HANDLER_RETRY_EXHAUSTED",
            Self::VerificationQuery { .. } => "VERIFICATION_QUERY",
            Self::Assertion(_) => "ASSERTION",
            Self::InputTimeout { .. } => "INPUT_TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Erros que abortam o run inteiro (contra falhas locais de step,
    /// que viram estado terminal e fluem pelo DAG).
    pub fn aborts_run(&self) -> bool {
        matches!(self, Self::Plan(_) | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).kind(), "VALIDATION");
        assert_eq!(EngineError::NotFound("x".into()).kind(), "NOT_FOUND");
        assert_eq!(EngineError::Resolution("x".into()).kind(), "RESOLUTION");
        assert_eq!(EngineError::HttpIo("x".into()).kind(), "HTTP_IO");
        assert_eq!(
            EngineError::RetryExhausted {
                attempts: 3,
                last_error: "500".into()
            }
            .kind(),
            "HANDLER_RETRY_EXHAUSTED"
        );
        assert_eq!(
            EngineError::VerificationQuery {
                connector: "kafka".into(),
                message: "boom".into()
            }
            .kind(),
            "VERIFICATION_QUERY"
        );
        assert_eq!(EngineError::Assertion("x".into()).kind(), "ASSERTION");
        assert_eq!(
            EngineError::InputTimeout { step: "s".into() }.kind(),
            "INPUT_TIMEOUT"
        );
        assert_eq!(EngineError::Cancelled.kind(), "CANCELLED");
    }

    #[test]
    fn test_plan_errors_map_through() {
        let cycle = EngineError::from(PlanError::CycleDetected {
            steps: vec!["A".into(), "B".into()],
        });
        assert_eq!(cycle.kind(), "CYCLE_DETECTED");
        assert!(cycle.aborts_run());

        let local = EngineError::HttpIo("connection refused".into());
        assert!(!local.aborts_run());
    }

    #[test]
    fn test_messages_name_the_offender() {
        let err = EngineError::Resolution("token '${FILE:missing}' sem arquivo".into());
        assert!(err.to_string().contains("${FILE:missing}"));
    }
}
