//! # Módulo de Telemetria
//!
//! Logging estruturado via `tracing` com exportação opcional de spans
//! para OpenTelemetry (OTLP/gRPC).
//!
//! ## Para todos entenderem:
//!
//! Telemetria é a caixa-preta do motor: cada run, step e verificação
//! deixa rastros que podem ser vistos no console ou enviados para um
//! coletor (Jaeger, Grafana Tempo, etc). Sem endpoint OTLP configurado,
//! só o console loga.
//!
//! ## Configuração via variáveis de ambiente:
//!
//! - `OTEL_SERVICE_NAME`: nome do serviço nos traces
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: URL do coletor (ex: `http://localhost:4317`)
//! - `OTEL_TRACES_SAMPLER_ARG`: taxa de sampling (0.0 a 1.0)
//! - `RUST_LOG`: filtro de nível do console

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

/// Configuração do sistema de telemetria.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Nome do serviço nos traces.
    pub service_name: String,

    /// Endpoint OTLP (gRPC). `None` significa só console.
    pub otlp_endpoint: Option<String>,

    /// Taxa de sampling: 1.0 coleta tudo, 0.0 nada.
    pub sampling_ratio: f64,

    /// Logging no console além do OTLP.
    pub enable_console_logging: bool,

    /// Nível mínimo quando `RUST_LOG` não está definido.
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "orchestra-engine".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Configuração a partir das variáveis de ambiente padrão OTEL.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }

        config
    }
}

// ============================================================================
// INICIALIZAÇÃO
// ============================================================================

/// Inicializa o tracing do processo.
///
/// Com endpoint OTLP, monta a pipeline completa (exporter em lote via
/// gRPC + sampler + layer do tracing). Sem endpoint, só o fmt layer do
/// console.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(telemetry_layer);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "telemetria OTEL inicializada"
        );

        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        } else {
            subscriber.init();
        }

        Ok(None)
    }
}

/// Monta exporter OTLP em lote, sampler e TracerProvider global.
fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
    sampling_ratio: f64,
) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

/// Flush dos spans pendentes. Chamar antes de encerrar o processo,
/// senão o lote acumulado em memória se perde.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "orchestra-engine");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.enable_console_logging);
    }
}
