//! # Módulo de Planejamento (DAG)
//!
//! Este módulo valida o grafo de dependências de uma suíte e produz a
//! ordem de execução de um run.
//!
//! ## Para todos entenderem:
//!
//! Imagine que você tem uma lista de tarefas com pré-requisitos:
//! - Login (não depende de nada)
//! - Criar pedido (depende de Login)
//! - Notificar (depende de Criar pedido)
//!
//! Um DAG (Directed Acyclic Graph - Grafo Direcionado Acíclico)
//! organiza essas tarefas para que cada uma só rode depois dos seus
//! pré-requisitos. Ciclos (A→B→A) são proibidos: ninguém conseguiria
//! começar.
//!
//! ## O que o planner entrega:
//!
//! 1. O conjunto `needed`: os alvos do run mais TODOS os predecessores
//!    transitivos deles. Steps `dependencyOnly` só entram se puxados.
//! 2. Uma ordem topológica imutável sobre `needed`, com desempate por
//!    `sortOrder` crescente entre steps equivalentes.
//! 3. Detecção de ciclo: se a ordenação não consome todo o conjunto,
//!    o run falha antes de executar qualquer step.
//!
//! O coordenador do run apenas itera a lista produzida. Um driver por
//! run: é disso que vêm as garantias de ordem dos eventos.

use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{Step, Suite};

// ============================================================================
// ERROS DE PLANEJAMENTO
// ============================================================================

/// Falhas que abortam o run antes do primeiro step.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Uma aresta aponta para um step que não existe na suíte.
    #[error("step '{step}' depende de um step inexistente ({missing})")]
    UnknownDependency { step: String, missing: Uuid },

    /// O alvo pedido (run de step único) não existe na suíte.
    #[error("step alvo inexistente: {target}")]
    UnknownTarget { target: Uuid },

    /// O grafo tem pelo menos um ciclo envolvendo os steps listados.
    #[error("ciclo de dependências detectado envolvendo: {steps:?}")]
    CycleDetected { steps: Vec<String> },
}

impl PlanError {
    /// Tag estável da taxonomia de erros do motor.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownDependency { .. } | Self::UnknownTarget { .. } => "VALIDATION",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
        }
    }
}

// ============================================================================
// PLANO DE EXECUÇÃO
// ============================================================================

/// Ordem de execução imutável de um run.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Ids de step em ordem topológica (desempate por `sortOrder`).
    pub ordered: Vec<Uuid>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Planeja um run de suíte: alvos são todos os steps que não forem
/// `dependencyOnly`.
pub fn plan_suite(suite: &Suite) -> Result<ExecutionPlan, PlanError> {
    let targets: Vec<Uuid> = suite
        .steps
        .iter()
        .filter(|s| !s.dependency_only)
        .map(|s| s.id)
        .collect();
    plan(suite, &targets)
}

/// Planeja um run de step único: o alvo e seus predecessores
/// transitivos.
pub fn plan_step(suite: &Suite, target: Uuid) -> Result<ExecutionPlan, PlanError> {
    if suite.step(target).is_none() {
        return Err(PlanError::UnknownTarget { target });
    }
    plan(suite, &[target])
}

/// Núcleo do planner: fecho transitivo + ordenação topológica.
fn plan(suite: &Suite, targets: &[Uuid]) -> Result<ExecutionPlan, PlanError> {
    let by_id: HashMap<Uuid, &Step> = suite.steps.iter().map(|s| (s.id, s)).collect();

    // Fecho transitivo dos alvos sobre as arestas de dependência.
    let mut needed: HashSet<Uuid> = HashSet::new();
    let mut stack: Vec<Uuid> = targets.to_vec();
    while let Some(id) = stack.pop() {
        if !needed.insert(id) {
            continue;
        }
        let step = by_id
            .get(&id)
            .ok_or(PlanError::UnknownTarget { target: id })?;
        for dep in &step.dependencies {
            if !by_id.contains_key(&dep.depends_on_step_id) {
                return Err(PlanError::UnknownDependency {
                    step: step.name.clone(),
                    missing: dep.depends_on_step_id,
                });
            }
            stack.push(dep.depends_on_step_id);
        }
    }

    // Kahn sobre o subgrafo `needed`. A lista de prontos é reordenada a
    // cada retirada: empate topológico sai por sortOrder crescente (e
    // por nome, para a ordem ser determinística).
    let mut indegree: HashMap<Uuid, usize> = HashMap::new();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for &id in &needed {
        let step = by_id[&id];
        let mut degree = 0;
        for dep in &step.dependencies {
            if needed.contains(&dep.depends_on_step_id) {
                degree += 1;
                dependents.entry(dep.depends_on_step_id).or_default().push(id);
            }
        }
        indegree.insert(id, degree);
    }

    let sort_key = |id: &Uuid| {
        let step = by_id[id];
        (step.sort_order, step.name.clone())
    };

    let mut ready: Vec<Uuid> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    ready.sort_by_key(sort_key);

    let mut ordered = Vec::with_capacity(needed.len());
    while !ready.is_empty() {
        let next = ready.remove(0);
        ordered.push(next);
        if let Some(children) = dependents.get(&next) {
            for &child in children {
                let degree = indegree.get_mut(&child).expect("child in needed set");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(child);
                }
            }
        }
        ready.sort_by_key(sort_key);
    }

    // Sobrou step não ordenável: há ciclo.
    if ordered.len() < needed.len() {
        let mut stuck: Vec<String> = needed
            .iter()
            .filter(|id| !ordered.contains(id))
            .map(|id| by_id[id].name.clone())
            .collect();
        stuck.sort();
        return Err(PlanError::CycleDetected { steps: stuck });
    }

    Ok(ExecutionPlan { ordered })
}

// ============================================================================
// TESTES
// ============================================================================
