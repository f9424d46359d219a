//! # Módulo de Limites de Execução
//!
//! Define os tetos operacionais do motor: timeouts, tamanho de upload,
//! paginação e tamanho de suíte.
//!
//! ## Para todos entenderem:
//!
//! Limites são as regras da casa: quanto tempo uma chamada HTTP pode
//! demorar, quanto tempo esperamos o operador digitar um input, qual o
//! maior arquivo aceito num ambiente. Sem eles, uma suíte malformada
//! poderia segurar recursos para sempre.
//!
//! ## Limites configuráveis (via variáveis de ambiente):
//!
//! | Limite                | Padrão  | Variável                        |
//! |-----------------------|---------|---------------------------------|
//! | timeout HTTP por step | 30 s    | `ORCHESTRA_HTTP_TIMEOUT_SECS`   |
//! | espera de input       | 300 s   | `ORCHESTRA_INPUT_WAIT_SECS`     |
//! | steps por suíte       | 200     | `ORCHESTRA_MAX_STEPS`           |
//! | upload de arquivo     | 50 MiB  | `ORCHESTRA_MAX_UPLOAD_BYTES`    |
//!
//! Paginação (superfícies de listagem e preview de cron): página padrão
//! 10, máxima 100. Fixas, não configuráveis.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// CONSTANTES PADRÃO
// ============================================================================

/// Timeout de requisição HTTP de um step.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Espera máxima por um input manual antes de classificar o step.
pub const DEFAULT_INPUT_WAIT_SECS: u64 = 300;

/// Número máximo de steps aceitos em uma suíte.
pub const DEFAULT_MAX_STEPS: usize = 200;

/// Tamanho máximo de um arquivo de ambiente: 50 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Página padrão das superfícies de listagem.
pub const PAGE_SIZE_DEFAULT: usize = 10;

/// Página máxima das superfícies de listagem.
pub const PAGE_SIZE_MAX: usize = 100;

// ============================================================================
// ESTRUTURA DE LIMITES
// ============================================================================

/// Limites em vigor para um processo do motor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Timeout de cada chamada HTTP de step, em segundos.
    pub http_timeout_secs: u64,

    /// Espera máxima por input manual, em segundos.
    pub input_wait_secs: u64,

    /// Máximo de steps por suíte.
    pub max_steps: usize,

    /// Teto de bytes de um arquivo armazenado em ambiente.
    pub max_upload_bytes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            input_wait_secs: DEFAULT_INPUT_WAIT_SECS,
            max_steps: DEFAULT_MAX_STEPS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl ExecutionLimits {
    /// Carrega limites das variáveis de ambiente, mantendo o padrão
    /// para o que não estiver definido.
    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Ok(val) = std::env::var("ORCHESTRA_HTTP_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                limits.http_timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("ORCHESTRA_INPUT_WAIT_SECS") {
            if let Ok(n) = val.parse() {
                limits.input_wait_secs = n;
            }
        }

        if let Ok(val) = std::env::var("ORCHESTRA_MAX_STEPS") {
            if let Ok(n) = val.parse() {
                limits.max_steps = n;
            }
        }

        if let Ok(val) = std::env::var("ORCHESTRA_MAX_UPLOAD_BYTES") {
            if let Ok(n) = val.parse() {
                limits.max_upload_bytes = n;
            }
        }

        limits
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn input_wait(&self) -> Duration {
        Duration::from_secs(self.input_wait_secs)
    }

    /// Limites curtos para testes.
    pub fn strict() -> Self {
        Self {
            http_timeout_secs: 5,
            input_wait_secs: 2,
            max_steps: 20,
            max_upload_bytes: 1024,
        }
    }
}

/// Normaliza um tamanho de página pedido pelo cliente: ausência cai no
/// padrão, excesso é aparado no máximo, zero vira padrão.
pub fn clamp_page_size(requested: Option<usize>) -> usize {
    match requested {
        None => PAGE_SIZE_DEFAULT,
        Some(0) => PAGE_SIZE_DEFAULT,
        Some(n) => n.min(PAGE_SIZE_MAX),
    }
}

// ============================================================================
// TESTES
// ============================================================================
