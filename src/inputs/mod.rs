//! # Módulo de Input Manual - Suspensão e Retomada
//!
//! Quando um step usa `#{nome}` em um run disparado manualmente, o
//! coordenador emite `input-required` e fica parado esperando o
//! operador submeter os valores. Este módulo é o ponto de encontro:
//! o lado do run espera, o lado do control plane submete.
//!
//! Políticas:
//! - Submissão é idempotente por run: o primeiro valor de cada nome
//!   vale; re-submissões do mesmo nome não trocam o valor.
//! - Submissões atrasadas (depois do step terminar) entram no mapa mas
//!   não têm mais efeito sobre nada.
//! - Valores já submetidos viram `cachedValue` (dica para a UI) e, em
//!   arestas com `reuseManualInput`, são reutilizados em silêncio.
//! - A espera é cancelável e tem prazo; os dois casos viram erro
//!   classificado para o coordenador decidir o destino do step.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Desfechos de uma espera por input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputWaitError {
    /// O operador não submeteu dentro do prazo.
    #[error("timeout aguardando input manual")]
    TimedOut,
    /// O run foi cancelado durante a espera.
    #[error("espera de input cancelada")]
    Cancelled,
}

/// Ponto de encontro de inputs manuais de UM run.
#[derive(Debug, Default)]
pub struct InputBroker {
    values: Mutex<HashMap<String, String>>,
    notify: Notify,
}

impl InputBroker {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Submete valores. Nomes já submetidos neste run são mantidos
    /// (idempotência); devolve quantos nomes novos entraram.
    pub fn submit(&self, submitted: HashMap<String, String>) -> usize {
        let mut values = self.values.lock().expect("input map poisoned");
        let mut fresh = 0;
        for (name, value) in submitted {
            if !values.contains_key(&name) {
                values.insert(name, value);
                fresh += 1;
            }
        }
        drop(values);
        self.notify.notify_waiters();
        fresh
    }

    /// Valor já submetido neste run, se houver.
    pub fn cached(&self, name: &str) -> Option<String> {
        self.values
            .lock()
            .expect("input map poisoned")
            .get(name)
            .cloned()
    }

    /// Cópia de todos os valores disponíveis.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.lock().expect("input map poisoned").clone()
    }

    fn has_all(&self, names: &[String]) -> bool {
        let values = self.values.lock().expect("input map poisoned");
        names.iter().all(|n| values.contains_key(n))
    }

    /// Bloqueia até todos os nomes terem valor, o prazo estourar ou o
    /// run ser cancelado.
    pub async fn wait_for(
        &self,
        names: &[String],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, InputWaitError> {
        let timeout = tokio::time::sleep(deadline);
        tokio::pin!(timeout);

        loop {
            // Registrar o notified ANTES de checar evita perder um
            // submit que chegue entre a checagem e o await.
            let notified = self.notify.notified();
            if self.has_all(names) {
                return Ok(self.snapshot());
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(InputWaitError::Cancelled),
                _ = &mut timeout => return Err(InputWaitError::TimedOut),
            }
        }
    }
}
