//! # Orchestra - Motor de Orquestração de Testes de API
//!
//! Este é o **ponto de entrada** do motor: o componente que executa
//! suítes de testes HTTP como DAGs de steps dependentes, com stream ao
//! vivo, input manual no meio do run, verificações de infraestrutura e
//! disparos agendados por cron.
//!
//! ## O que este arquivo faz?
//!
//! 1. **Processa a linha de comando** (CLI) com a biblioteca `clap`
//! 2. **Inicializa a telemetria** (tracing + OpenTelemetry opcional)
//! 3. **`serve`**: sobe o control plane HTTP (runs, SSE, inputs,
//!    cancel, preview de cron) sobre snapshots carregados do disco
//! 4. **`execute`**: roda uma suíte de um arquivo de snapshot uma vez
//!    e imprime/salva o registro do run
//!
//! ## Exemplos:
//!
//! ```bash
//! # Servidor com snapshots e agendamentos
//! orchestra serve --snapshots ./snapshots --schedules ./schedules.json
//!
//! # Run único, relatório em arquivo
//! orchestra execute --file suite.json --output resultado.json
//! ```
//!
//! ## Arquitetura:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        main.rs                            │
//! │        (CLI, telemetria, serve/execute)                   │
//! └───────────────────────────────────────────────────────────┘
//!        │                  │                    │
//!        ▼                  ▼                    ▼
//!   ┌─────────┐       ┌───────────┐       ┌──────────────┐
//!   │ server/ │       │ schedule/ │       │ coordinator/ │
//!   │ (HTTP,  │       │ (cron)    │       │ (runs, DAG,  │
//!   │  SSE)   │       │           │       │  eventos)    │
//!   └─────────┘       └───────────┘       └──────────────┘
//! ```

mod cache;
mod connectors;
mod coordinator;
mod errors;
mod executors;
mod extractors;
mod inputs;
mod jsonpath;
mod limits;
mod loader;
mod placeholder;
mod planner;
mod protocol;
mod registry;
mod schedule;
mod server;
mod telemetry;
mod validation;
mod verify;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use uuid::Uuid;

use connectors::ConnectorFactory;
use coordinator::{RunCoordinator, RunRequest};
use limits::ExecutionLimits;
use protocol::{RunStatus, Schedule, TriggerType};
use registry::RunRegistry;
use schedule::ScheduleDispatcher;
use server::AppState;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

// ============================================================================
// CLI
// ============================================================================

/// CLI do motor de orquestração.
#[derive(Parser)]
#[command(name = "orchestra")]
#[command(about = "Orchestra - motor de orquestração de testes de API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sobe o control plane HTTP (runs síncronos, SSE, inputs, cancel).
    Serve {
        /// Endereço de escuta.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Porta de escuta.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Diretório com os snapshots hidratados (*.json).
        #[arg(long)]
        snapshots: PathBuf,

        /// Arquivo JSON com a lista de agendamentos cron (opcional).
        #[arg(long)]
        schedules: Option<PathBuf>,

        /// Exporta traces para um coletor OpenTelemetry.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// Endpoint do coletor OTLP.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Só erros críticos no console.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Logs detalhados de debug.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },

    /// Executa uma suíte de um arquivo de snapshot, uma vez.
    Execute {
        /// Caminho do snapshot hidratado (JSON).
        #[arg(short, long)]
        file: PathBuf,

        /// Ambiente a usar (senão o padrão da suíte).
        #[arg(long)]
        environment: Option<Uuid>,

        /// Executa só este step (e seus predecessores).
        #[arg(long)]
        step: Option<Uuid>,

        /// Dispara como run agendado (defaults preenchem inputs).
        #[arg(long, default_value = "false")]
        scheduled: bool,

        /// Onde salvar o registro do run (senão imprime no console).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exporta traces para um coletor OpenTelemetry.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// Endpoint do coletor OTLP.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Só erros críticos no console.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Logs detalhados de debug.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            snapshots,
            schedules,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            setup_telemetry(otel, otel_endpoint, silent, verbose);
            serve(host, port, snapshots, schedules).await;
            shutdown_telemetry();
        }
        Commands::Execute {
            file,
            environment,
            step,
            scheduled,
            output,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            setup_telemetry(otel, otel_endpoint, silent, verbose);
            let exit = execute(file, environment, step, scheduled, output).await;
            shutdown_telemetry();
            std::process::exit(exit);
        }
    }
}

/// Telemetria conforme flags: silent/verbose controlam o nível,
/// `--otel` liga a exportação OTLP.
fn setup_telemetry(otel: bool, otel_endpoint: Option<String>, silent: bool, verbose: bool) {
    let mut config = TelemetryConfig::from_env();
    config.log_level = if silent {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    if otel {
        if let Some(endpoint) = otel_endpoint {
            config.otlp_endpoint = Some(endpoint);
        } else if config.otlp_endpoint.is_none() {
            config.otlp_endpoint = Some("http://localhost:4317".to_string());
        }
    } else {
        config.otlp_endpoint = None;
    }

    if let Err(e) = init_telemetry(config) {
        eprintln!("Warning: failed to initialize telemetry: {}", e);
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

// ============================================================================
// SERVE
// ============================================================================

async fn serve(host: String, port: u16, snapshots: PathBuf, schedules: Option<PathBuf>) {
    let limits = ExecutionLimits::from_env();

    let store = match loader::SnapshotStore::load_dir(&snapshots, &limits) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "falha ao carregar snapshots");
            std::process::exit(1);
        }
    };
    info!(suites = store.len(), "snapshots carregados");

    let state = Arc::new(AppState {
        store,
        registry: Arc::new(RunRegistry::new()),
        coordinator: Arc::new(RunCoordinator::new(limits, Arc::new(ConnectorFactory::new()))),
    });

    // Dispatcher de agendamentos, se houver arquivo.
    if let Some(path) = schedules {
        match load_schedules(&path) {
            Ok(list) => {
                info!(schedules = list.len(), "agendamentos carregados");
                let dispatcher = ScheduleDispatcher::new(list);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    dispatcher
                        .run(CancellationToken::new(), move |schedule| {
                            let state = Arc::clone(&state);
                            async move { run_scheduled(state, schedule).await }
                        })
                        .await;
                });
            }
            Err(e) => {
                error!(error = %e, "falha ao carregar agendamentos");
                std::process::exit(1);
            }
        }
    }

    let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "endereço de escuta inválido");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::serve(state, addr).await {
        error!(error = %e, "servidor encerrou com erro");
        std::process::exit(1);
    }
}

fn load_schedules(path: &PathBuf) -> anyhow::Result<Vec<Schedule>> {
    use anyhow::Context;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schedules '{}'", path.display()))?;
    let list: Vec<Schedule> =
        serde_json::from_str(&content).context("failed to parse schedules JSON")?;
    Ok(list)
}

/// Um disparo agendado: sem canal de operador, defaults preenchem os
/// inputs e os campos sem default ficam vazios com warning.
async fn run_scheduled(state: Arc<AppState>, schedule: Schedule) {
    let Some(snapshot) = state.store.get(schedule.suite_id).cloned() else {
        error!(suite = %schedule.suite_id, "agendamento aponta para suíte desconhecida");
        return;
    };

    let run_id = Uuid::new_v4();
    let (control, rx) = state.registry.register(run_id);
    drop(rx);

    let request = RunRequest {
        snapshot,
        environment_id: schedule.environment_id,
        trigger: TriggerType::Scheduled,
        target_step: None,
        schedule_id: Some(schedule.id),
    };
    let result = state.coordinator.execute(request, control).await;
    state.registry.complete(run_id);
    info!(%run_id, status = ?result.status, "run agendado terminado");
}

// ============================================================================
// EXECUTE
// ============================================================================

async fn execute(
    file: PathBuf,
    environment: Option<Uuid>,
    step: Option<Uuid>,
    scheduled: bool,
    output: Option<PathBuf>,
) -> i32 {
    let limits = ExecutionLimits::from_env();

    let snapshot = match loader::load_snapshot_from_file(&file, &limits) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "falha ao carregar o snapshot");
            return 1;
        }
    };
    info!(suite = %snapshot.suite.name, steps = snapshot.suite.steps.len(), "snapshot carregado");

    let registry = RunRegistry::new();
    let run_id = Uuid::new_v4();
    let (control, rx) = registry.register(run_id);
    drop(rx);

    let coordinator = RunCoordinator::new(limits, Arc::new(ConnectorFactory::new()));
    let request = RunRequest {
        snapshot,
        environment_id: environment,
        trigger: if scheduled {
            TriggerType::Scheduled
        } else {
            TriggerType::Manual
        },
        target_step: step,
        schedule_id: None,
    };

    let result = coordinator.execute(request.clone(), control).await;
    registry.complete(run_id);

    // O registro do run embute o resultado agregado completo.
    let record = coordinator::run_record(&request, &result);
    let json = match serde_json::to_string_pretty(&record) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "falha ao serializar o registro do run");
            return 1;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, json) {
                error!(path = %path.display(), error = %e, "falha ao salvar o registro");
                return 1;
            }
            info!(path = %path.display(), "registro do run salvo");
        }
        None => println!("{}", json),
    }

    if result.status == RunStatus::Success {
        0
    } else {
        1
    }
}
