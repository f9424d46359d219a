//! # Módulo de Agendamento - Cron de Suítes
//!
//! Suporta expressões cron padrão de 5 campos
//! (`min hora dia-do-mês mês dia-da-semana`, com domingo = 0) para
//! disparar runs com `TriggerType = SCHEDULED` e sem canal de operador.
//!
//! Duas peças:
//! - **Preview**: dado `cron`, os próximos instantes de disparo (para a
//!   UI conferir a expressão antes de salvar). A quantidade respeita a
//!   paginação padrão (10, máx. 100).
//! - **Dispatcher**: um loop por processo que dorme até o próximo
//!   disparo entre os agendamentos habilitados e invoca o motor.

use chrono::{DateTime, Utc};
use croner::Cron;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::limits;
use crate::protocol::Schedule;

// ============================================================================
// PARSE E PREVIEW
// ============================================================================

/// Parseia uma expressão cron de 5 campos.
pub fn parse_cron(expression: &str) -> Result<Cron, EngineError> {
    expression
        .parse::<Cron>()
        .map_err(|e| EngineError::Validation(format!("expressão cron inválida '{}': {}", expression, e)))
}

/// Próximos instantes de disparo de uma expressão, a partir de agora.
pub fn preview(expression: &str, count: Option<usize>) -> Result<Vec<DateTime<Utc>>, EngineError> {
    preview_from(expression, Utc::now(), count)
}

/// Versão determinística do preview, ancorada em um instante.
pub fn preview_from(
    expression: &str,
    from: DateTime<Utc>,
    count: Option<usize>,
) -> Result<Vec<DateTime<Utc>>, EngineError> {
    let cron = parse_cron(expression)?;
    let wanted = limits::clamp_page_size(count);

    let mut fires = Vec::with_capacity(wanted);
    let mut cursor = from;
    for _ in 0..wanted {
        match cron.find_next_occurrence(&cursor, false) {
            Ok(next) => {
                fires.push(next);
                cursor = next;
            }
            Err(e) => {
                return Err(EngineError::Validation(format!(
                    "sem próximo disparo para '{}': {}",
                    expression, e
                )))
            }
        }
    }
    Ok(fires)
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Dispara runs agendados: dorme até o próximo cron habilitado e
/// invoca o callback com o agendamento vencedor.
#[derive(Debug, Default)]
pub struct ScheduleDispatcher {
    schedules: Vec<Schedule>,
}

impl ScheduleDispatcher {
    pub fn new(schedules: Vec<Schedule>) -> Self {
        Self { schedules }
    }

    /// O próximo disparo entre os agendamentos vivos e habilitados.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<(Schedule, DateTime<Utc>)> {
        let mut winner: Option<(Schedule, DateTime<Utc>)> = None;
        for schedule in &self.schedules {
            if !schedule.enabled || schedule.deleted_at.is_some() {
                continue;
            }
            let Ok(cron) = parse_cron(&schedule.cron_expression) else {
                warn!(schedule = %schedule.id, cron = %schedule.cron_expression, "expressão cron inválida ignorada");
                continue;
            };
            let Ok(at) = cron.find_next_occurrence(&now, false) else {
                continue;
            };
            match &winner {
                Some((_, best)) if *best <= at => {}
                _ => winner = Some((schedule.clone(), at)),
            }
        }
        winner
    }

    /// Loop do dispatcher. Cada disparo invoca `trigger` com o
    /// agendamento; o callback é quem acorda o motor com
    /// `TriggerType = SCHEDULED`.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, trigger: F)
    where
        F: Fn(Schedule) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            let now = Utc::now();
            let Some((schedule, at)) = self.next_fire(now) else {
                // Nada habilitado: re-avalia daqui a pouco.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => continue,
                }
            };

            let wait = (at - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {
                    info!(schedule = %schedule.id, suite = %schedule.suite_id, "disparo agendado");
                    trigger(schedule).await;
                }
            }
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
