//! # Módulo de Registro de Runs
//!
//! Mapa concorrente de processo inteiro: `runId → controle do run`.
//! É por aqui que os endpoints de controle alcançam um run em voo:
//! o stream de eventos, o token de cancelamento e o broker de inputs.
//!
//! Disciplina de escrita: só o driver dono do run escreve no seu
//! controle; leitores (cancel, submit de inputs) fazem operações
//! compare-and-submit. A entrada nasce antes do primeiro evento e é
//! lapidada (tombstone) na conclusão, de modo que cancelar um run já
//! terminado seja um no-op e não um erro.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::inputs::InputBroker;
use crate::protocol::RunEvent;

/// Controle de um run em voo.
#[derive(Debug)]
pub struct RunControl {
    pub run_id: Uuid,
    events: mpsc::UnboundedSender<RunEvent>,
    pub cancel: CancellationToken,
    pub inputs: Arc<InputBroker>,
}

impl RunControl {
    /// Emite um evento no stream do run. Receptor desligado (cliente
    /// SSE que caiu, run síncrono) não é erro: o evento é descartado.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Desfecho de um pedido de cancelamento.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// O sinal foi entregue ao run (ou repetido, que dá no mesmo).
    Signalled,
    /// O run já tinha terminado; nada a fazer.
    AlreadyCompleted,
    /// Nunca existiu run com esse id neste processo.
    Unknown,
}

/// Situação de um run aos olhos do registro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLookup {
    Active,
    Completed,
    Unknown,
}

#[derive(Debug, Default)]
struct RegistryInner {
    active: HashMap<Uuid, Arc<RunControl>>,
    tombstones: HashSet<Uuid>,
}

/// Registro de runs do processo.
#[derive(Debug, Default)]
pub struct RunRegistry {
    inner: Mutex<RegistryInner>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cria o controle de um run novo e devolve o lado consumidor do
    /// stream de eventos.
    pub fn register(&self, run_id: Uuid) -> (Arc<RunControl>, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(RunControl {
            run_id,
            events: tx,
            cancel: CancellationToken::new(),
            inputs: Arc::new(InputBroker::new()),
        });
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.active.insert(run_id, Arc::clone(&control));
        debug!(%run_id, "run registrado");
        (control, rx)
    }

    /// Situação do run: ativo, já concluído ou desconhecido.
    pub fn lookup(&self, run_id: Uuid) -> RunLookup {
        let inner = self.inner.lock().expect("registry poisoned");
        if inner.active.contains_key(&run_id) {
            RunLookup::Active
        } else if inner.tombstones.contains(&run_id) {
            RunLookup::Completed
        } else {
            RunLookup::Unknown
        }
    }

    pub fn get(&self, run_id: Uuid) -> Option<Arc<RunControl>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .active
            .get(&run_id)
            .cloned()
    }

    /// Cancela um run. Idempotente; depois da conclusão vira no-op.
    pub fn cancel(&self, run_id: Uuid) -> CancelOutcome {
        let inner = self.inner.lock().expect("registry poisoned");
        if let Some(control) = inner.active.get(&run_id) {
            control.cancel.cancel();
            return CancelOutcome::Signalled;
        }
        if inner.tombstones.contains(&run_id) {
            return CancelOutcome::AlreadyCompleted;
        }
        CancelOutcome::Unknown
    }

    /// Entrega inputs ao run. Devolve quantos nomes novos entraram.
    pub fn submit_inputs(
        &self,
        run_id: Uuid,
        values: std::collections::HashMap<String, String>,
    ) -> Option<usize> {
        let control = self.get(run_id)?;
        Some(control.inputs.submit(values))
    }

    /// Marca o run como concluído: sai do mapa ativo e deixa um
    /// tombstone para tornar cancel-depois-de-completo inofensivo.
    pub fn complete(&self, run_id: Uuid) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.active.remove(&run_id);
        inner.tombstones.insert(run_id);
        debug!(%run_id, "run concluído e lapidado");
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("registry poisoned").active.len()
    }
}
