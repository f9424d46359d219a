//! # Módulo de Cache de Respostas
//!
//! Memoização por run e por step, com TTL. Um step `cacheable` que
//! termina em `SUCCESS` guarda seu resultado aqui; pulls posteriores
//! dentro do MESMO run podem reaproveitá-lo sem nova chamada HTTP.
//!
//! Regras:
//! - `ttl = 0` vale o run inteiro; caso contrário `now - storedAt < ttl`.
//! - Um pull com `useCache = false` nem consulta nem atualiza o cache.
//! - O cache pertence ao run e evapora com ele. Nada atravessa runs.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::StepExecutionResult;

/// Entrada memoizada de um step.
#[derive(Debug, Clone)]
struct CacheEntry {
    stored_at: Instant,
    ttl_seconds: u64,
    result: StepExecutionResult,
}

/// Cache de respostas de um único run, chaveado por step id.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: HashMap<Uuid, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Guarda o resultado de um step cacheable.
    pub fn put(&mut self, step_id: Uuid, ttl_seconds: u64, result: StepExecutionResult) {
        self.entries.insert(
            step_id,
            CacheEntry {
                stored_at: Instant::now(),
                ttl_seconds,
                result,
            },
        );
    }

    /// Busca a entrada válida de um step, se houver.
    pub fn get(&self, step_id: Uuid) -> Option<StepExecutionResult> {
        self.get_at(step_id, Instant::now())
    }

    fn get_at(&self, step_id: Uuid, now: Instant) -> Option<StepExecutionResult> {
        let entry = self.entries.get(&step_id)?;
        if entry.ttl_seconds == 0
            || now.duration_since(entry.stored_at) < Duration::from_secs(entry.ttl_seconds)
        {
            Some(entry.result.clone())
        } else {
            None
        }
    }

    /// Remove a entrada de um step (invalidação explícita).
    pub fn invalidate(&mut self, step_id: Uuid) {
        self.entries.remove(&step_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
