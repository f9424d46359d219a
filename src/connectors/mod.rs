//! # Módulo de Conectores - Contrato dos Drivers de Verificação
//!
//! Uma verificação consulta infraestrutura externa (banco, cache,
//! broker) através de um conector. O motor NÃO fala protocolo nativo
//! nenhum: ele entrega uma query em texto ao driver registrado para a
//! tecnologia e recebe de volta uma string JSON. Despacho por tag, sem
//! herança.
//!
//! ## Gramática de query por tecnologia (contrato literal):
//!
//! | Tipo | Query | Resultado |
//! |------|-------|-----------|
//! | MySQL/Postgres/Oracle/SQL Server | `SELECT ...` | `{ rows: [{col: val}...], rowCount }` |
//! | Redis | `GET k` / `HGET k f` / `HGETALL k` / `EXISTS k` / `LRANGE k a b` / `SISMEMBER k m` / `PING` | `{ value, type, exists }` ou `{ isMember }` |
//! | Elasticsearch | `METHOD /path [body]` | JSON cru da resposta HTTP |
//! | Kafka | `topic=T [key=K]` (separado por espaço/linha); vazio lista tópicos | `{ found, key, value, partition, offset, timestamp }` ou `{ found: false, timeout: true }` |
//! | RabbitMQ | `queue=Q [routingKey=R]` | `{ found, routingKey, body, headers }` ou `{ found: false, timeout: true }` |
//! | MongoDB | `colecao.{filtroJson}`; vazio lista coleções | `{ documents: [...], count }` |
//!
//! ## Pre-listen:
//!
//! Para brokers, o listener precisa estar armado ANTES da chamada HTTP
//! do step, senão a mensagem passa batida. O motor gera a identidade
//! isolada do assinante (grupo `orch-verify-<uuid>`) e entrega ao
//! driver via [`ListenerSetup`]. No Kafka o driver deve atribuir as
//! partições explicitamente e fazer `seekToEnd` antes de devolver; no
//! RabbitMQ, assinar com ack manual e re-enfileirar o que não casar com
//! a routing key.
//!
//! Drivers são stateless em relação a runs; cada verificação constrói
//! um cliente novo (pooling interno do driver é opaco para o motor).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{ConnectorRef, ConnectorType};

// ============================================================================
// ERROS
// ============================================================================

/// Falhas na camada de conectores.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("conector '{0}' não existe no ambiente")]
    UnknownConnector(String),

    #[error("nenhum driver registrado para o tipo {0:?}")]
    UnsupportedType(ConnectorType),

    #[error("query falhou: {0}")]
    QueryFailed(String),

    #[error("query excedeu o tempo limite de {0:?}")]
    Timeout(Duration),

    #[error("falha ao armar o listener: {0}")]
    ListenerFailed(String),
}

// ============================================================================
// CONTRATO DO DRIVER
// ============================================================================

/// Identidade que o motor fornece a um listener de pre-listen.
///
/// O grupo é isolado por verificação: dois runs simultâneos nunca
/// competem pelo mesmo offset.
#[derive(Debug, Clone)]
pub struct ListenerSetup {
    pub group_id: String,
}

impl ListenerSetup {
    /// Grupo de consumo novo e isolado: `orch-verify-<uuid>`.
    pub fn isolated() -> Self {
        Self {
            group_id: format!("orch-verify-{}", Uuid::new_v4()),
        }
    }
}

/// Contrato único de um driver de conector.
///
/// A capacidade `execute(config, query, timeout) -> json` é suficiente
/// para todas as tecnologias; o driver parseia a query no formato da
/// sua gramática e devolve o resultado serializado.
#[async_trait]
pub trait ConnectorDriver: Send + Sync {
    /// Tag de tecnologia que este driver atende.
    fn connector_type(&self) -> ConnectorType;

    /// Executa a query e devolve o resultado como string JSON.
    async fn execute(
        &self,
        config: &HashMap<String, String>,
        query: &str,
        timeout: Duration,
    ) -> Result<String, ConnectorError>;

    /// Arma o listener de pre-listen. Deve retornar só depois que a
    /// assinatura está posicionada (pronta para não perder o evento).
    /// Tecnologias sem noção de assinatura mantêm o no-op padrão.
    async fn start_listener(
        &self,
        _config: &HashMap<String, String>,
        _query: &str,
        _setup: &ListenerSetup,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Registro de drivers por tecnologia.
///
/// O processo registra um driver por tipo na subida; a verificação
/// resolve o conector do ambiente e despacha pela tag.
#[derive(Default)]
pub struct ConnectorFactory {
    drivers: HashMap<ConnectorType, Arc<dyn ConnectorDriver>>,
}

impl ConnectorFactory {
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registra (ou substitui) o driver de uma tecnologia.
    pub fn register(&mut self, driver: Arc<dyn ConnectorDriver>) {
        self.drivers.insert(driver.connector_type(), driver);
    }

    pub fn with_driver(mut self, driver: Arc<dyn ConnectorDriver>) -> Self {
        self.register(driver);
        self
    }

    /// Resolve o driver para um conector configurado.
    pub fn driver_for(
        &self,
        connector: &ConnectorRef,
    ) -> Result<Arc<dyn ConnectorDriver>, ConnectorError> {
        self.drivers
            .get(&connector.connector_type)
            .cloned()
            .ok_or(ConnectorError::UnsupportedType(connector.connector_type))
    }
}

impl std::fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorFactory")
            .field("types", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// DRIVER ROTEIRIZADO (SÓ TESTES)
// ============================================================================


// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedDriver;
    use super::*;

    fn connector(kind: ConnectorType) -> ConnectorRef {
        ConnectorRef {
            name: "infra".to_string(),
            connector_type: kind,
            config: HashMap::new(),
        }
    }

    #[test]
    fn test_isolated_group_id_shape() {
        let a = ListenerSetup::isolated();
        let b = ListenerSetup::isolated();
        assert!(a.group_id.starts_with("orch-verify-"));
        assert_ne!(a.group_id, b.group_id);
        let suffix = a.group_id.trim_start_matches("orch-verify-");
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[tokio::test]
    async fn test_factory_dispatch_by_tag() {
        let factory = ConnectorFactory::new().with_driver(Arc::new(ScriptedDriver::always(
            ConnectorType::Redis,
            r#"{"value":"1","type":"string","exists":true}"#,
        )));

        let driver = factory.driver_for(&connector(ConnectorType::Redis)).unwrap();
        let out = driver
            .execute(&HashMap::new(), "GET k", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.contains("exists"));

        let missing = factory.driver_for(&connector(ConnectorType::Kafka));
        assert!(matches!(
            missing,
            Err(ConnectorError::UnsupportedType(ConnectorType::Kafka))
        ));
    }

    #[tokio::test]
    async fn test_scripted_driver_sequences_responses() {
        let driver = ScriptedDriver::new(
            ConnectorType::Postgres,
            vec![
                Ok(r#"{"rows":[],"rowCount":0}"#.to_string()),
                Ok(r#"{"rows":[{"id":1}],"rowCount":1}"#.to_string()),
            ],
        );
        let first = driver
            .execute(&HashMap::new(), "SELECT 1", Duration::from_secs(1))
            .await
            .unwrap();
        let second = driver
            .execute(&HashMap::new(), "SELECT 1", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(first.contains("\"rowCount\":0"));
        assert!(second.contains("\"rowCount\":1"));
        assert_eq!(driver.calls.lock().unwrap().queries.len(), 2);
    }
}
