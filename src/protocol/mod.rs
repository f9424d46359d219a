//! # Módulo de Protocolo - Estruturas de Dados do Motor
//!
//! Este módulo define todas as **estruturas de dados** que o motor de
//! execução consome e produz: suítes, steps, ambientes, conectores,
//! resultados e eventos.
//!
//! ## Para todos entenderem:
//!
//! O motor recebe um "snapshot hidratado" de uma suíte: um JSON com a
//! suíte completa, seus steps e o ambiente (variáveis, headers padrão,
//! conectores, arquivos). Quem persiste e edita essas entidades é o
//! catálogo, que fica fora do motor. Aqui só definimos o formato.
//!
//! ## Hierarquia de Tipos:
//!
//! ```text
//! SuiteSnapshot
//! ├── Suite
//! │   └── Step[]
//! │       ├── StepDependency[]     (arestas do DAG)
//! │       ├── ResponseHandler[]    (ações por status)
//! │       ├── ExtractedVariable[]  (bindings pós-execução)
//! │       └── Verification[]       (queries + assertions)
//! └── Environment[]
//!     ├── EnvironmentVariable[]
//!     ├── DefaultHeader[]
//!     ├── ConnectorRef[]
//!     └── StoredFile[]
//! ```
//!
//! Resultados fluem no sentido contrário: cada step emite um
//! [`StepExecutionResult`], o run agrega tudo em um
//! [`SuiteExecutionResult`], e o stream ao vivo transporta [`RunEvent`]s.

use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ENUMS DE DOMÍNIO
// ============================================================================

/// Tipo de valor de uma variável de ambiente ou header padrão.
///
/// Controla COMO o valor é expandido na resolução de placeholders:
/// - `STATIC`: o texto literal armazenado.
/// - `VARIABLE`: o valor pode referenciar outra variável `${X}` (um nível).
/// - `UUID`: gera um UUID v4 novo a cada expansão.
/// - `ISO_TIMESTAMP`: o instante atual em UTC ISO-8601 com milissegundos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ValueKind {
    #[default]
    #[serde(rename = "STATIC")]
    Static,
    #[serde(rename = "VARIABLE")]
    Variable,
    #[serde(rename = "UUID")]
    Uuid,
    #[serde(rename = "ISO_TIMESTAMP")]
    IsoTimestamp,
}

/// Método HTTP suportado por um step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "DELETE")]
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Tipo de corpo da requisição.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BodyType {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "FORM_DATA")]
    FormData,
}

/// Tipo de um campo de form-data: texto simples ou arquivo.
///
/// Campos `file` carregam um token `${FILE:key}` no valor, que o executor
/// HTTP troca pelos bytes do arquivo armazenado no ambiente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormFieldType {
    #[default]
    Text,
    File,
}

/// Ação escolhida quando um response handler casa com o status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerAction {
    Success,
    Error,
    Retry,
    FireSideEffect,
}

/// Fonte de uma variável extraída após a execução do step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionSource {
    ResponseBody,
    ResponseHeader,
    StatusCode,
    RequestBody,
    RequestHeader,
    QueryParam,
    RequestUrl,
}

/// Operador de uma assertion de verificação.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssertionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Regex,
    Gt,
    Lt,
    Gte,
    Lte,
    Exists,
    NotExists,
}

/// Tecnologia de um conector de verificação.
///
/// O motor nunca fala o protocolo nativo: ele despacha a query em texto
/// para o driver registrado sob esta tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorType {
    #[serde(rename = "MYSQL")]
    MySql,
    #[serde(rename = "POSTGRES")]
    Postgres,
    #[serde(rename = "ORACLE")]
    Oracle,
    #[serde(rename = "SQLSERVER")]
    SqlServer,
    #[serde(rename = "REDIS")]
    Redis,
    #[serde(rename = "ELASTICSEARCH")]
    Elasticsearch,
    #[serde(rename = "KAFKA")]
    Kafka,
    #[serde(rename = "RABBITMQ")]
    RabbitMq,
    #[serde(rename = "MONGODB")]
    MongoDb,
}

/// Como o run foi disparado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Manual,
    Scheduled,
}

/// Status terminal (ou corrente) de um run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    PartialFailure,
    Failure,
    Cancelled,
}

/// Status terminal de um step dentro de um run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
    VerificationFailed,
}

// ============================================================================
// MATCH CODE (GRAMÁTICA DE STATUS)
// ============================================================================

/// Padrão de casamento de status HTTP de um response handler.
///
/// Duas formas são aceitas:
/// - código exato: `200`, `404`, `503`
/// - faixa: `2xx`, `3xx`, `4xx`, `5xx`
///
/// Regra especial: o status sintético `0` (falha de I/O, sem resposta)
/// só casa com a faixa `5xx`. Nenhum código exato o alcança.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCode {
    Exact(u16),
    Range(u8),
}

impl MatchCode {
    /// Verifica se este padrão casa com o status recebido.
    pub fn matches(&self, status: u16) -> bool {
        match self {
            Self::Exact(code) => *code == status,
            Self::Range(hundreds) => {
                if status == 0 {
                    // I/O sem resposta: tratado como falha de servidor.
                    *hundreds == 5
                } else {
                    status / 100 == u16::from(*hundreds)
                }
            }
        }
    }

    /// `true` para códigos exatos. Usado no desempate de prioridade:
    /// exato vence faixa quando ambos têm a mesma prioridade.
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

impl FromStr for MatchCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(prefix) = trimmed
            .strip_suffix("xx")
            .or_else(|| trimmed.strip_suffix("XX"))
        {
            let hundreds: u8 = prefix
                .parse()
                .map_err(|_| format!("matchCode inválido: '{}'", s))?;
            if (2..=5).contains(&hundreds) {
                return Ok(Self::Range(hundreds));
            }
            return Err(format!("faixa de matchCode fora de 2xx..5xx: '{}'", s));
        }
        let code: u16 = trimmed
            .parse()
            .map_err(|_| format!("matchCode inválido: '{}'", s))?;
        if (100..=599).contains(&code) {
            Ok(Self::Exact(code))
        } else {
            Err(format!("matchCode fora de 100..599: '{}'", s))
        }
    }
}

impl fmt::Display for MatchCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(code) => write!(f, "{}", code),
            Self::Range(hundreds) => write!(f, "{}xx", hundreds),
        }
    }
}

// No JSON o padrão viaja como string ("200", "5xx"), igual ao catálogo.
impl Serialize for MatchCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MatchCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

// ============================================================================
// AMBIENTE
// ============================================================================

/// Variável de um ambiente.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariable {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub value_type: ValueKind,
    /// Valores secretos são expandidos normalmente, mas mascarados
    /// quando a requisição resolvida é ecoada nos resultados.
    #[serde(default)]
    pub secret: bool,
}

/// Header padrão aplicado a toda requisição do ambiente.
///
/// Steps podem sobrescrever por chave (case-insensitive) ou suprimir
/// via `disabledDefaultHeaders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultHeader {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub value_type: ValueKind,
}

/// Conector configurado em um ambiente.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRef {
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    /// Configuração opaca por tecnologia (host, porta, credenciais...).
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Arquivo binário armazenado no ambiente, referenciável por
/// `${FILE:key}` em campos de form-data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_key: String,
    #[serde(default)]
    pub file_name: Option<String>,
    /// Conteúdo em base64 no snapshot hidratado.
    #[serde(default)]
    pub data: String,
}

impl StoredFile {
    /// Decodifica o conteúdo base64 para bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.decode(self.data.as_bytes())
    }
}

/// Ambiente: variáveis, headers padrão, conectores e arquivos.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub default_headers: Vec<DefaultHeader>,
    #[serde(default)]
    pub connectors: Vec<ConnectorRef>,
    #[serde(default)]
    pub files: Vec<StoredFile>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Environment {
    pub fn variable(&self, key: &str) -> Option<&EnvironmentVariable> {
        self.variables.iter().find(|v| v.key == key)
    }

    pub fn connector(&self, name: &str) -> Option<&ConnectorRef> {
        self.connectors.iter().find(|c| c.name == name)
    }

    pub fn file(&self, file_key: &str) -> Option<&StoredFile> {
        self.files.iter().find(|f| f.file_key == file_key)
    }

    /// Ambiente vazio, usado quando o run não declara ambiente.
    pub fn empty() -> Self {
        Self {
            id: Uuid::nil(),
            name: String::new(),
            variables: Vec::new(),
            default_headers: Vec::new(),
            connectors: Vec::new(),
            files: Vec::new(),
            deleted_at: None,
        }
    }
}

// ============================================================================
// SUITE E STEP
// ============================================================================

fn default_true() -> bool {
    true
}

/// Par chave/valor ordenado (headers e query params de um step).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Campo de form-data de um step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub key: String,
    #[serde(rename = "type", default)]
    pub field_type: FormFieldType,
    #[serde(default)]
    pub value: String,
}

/// Aresta de dependência entre steps.
///
/// `useCache` tem três estados. Não declarado, a aresta é neutra: o
/// dependente lê o resultado vivo que o produtor publicou neste run.
/// `true` serve a contribuição pelo cache compartilhado: um hit marca
/// `fromCache` no resultado do dependente e dispensa nova chamada HTTP.
/// `false` força uma re-execução fresca do produtor que NÃO atualiza o
/// cache. `reuseManualInput` permite reaproveitar em silêncio valores
/// `#{...}` já submetidos neste run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDependency {
    pub depends_on_step_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
    #[serde(default)]
    pub reuse_manual_input: bool,
}

impl StepDependency {
    /// Aresta que pede a contribuição do produtor via cache.
    pub fn wants_cache(&self) -> bool {
        self.use_cache == Some(true)
    }

    /// Aresta que exige re-execução fresca do produtor.
    pub fn forces_fresh(&self) -> bool {
        self.use_cache == Some(false)
    }
}

/// Handler de resposta: casa um padrão de status e escolhe a ação.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHandler {
    #[serde(default)]
    pub priority: i32,
    pub match_code: MatchCode,
    pub action: HandlerAction,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub side_effect_step_id: Option<Uuid>,
}

/// Regra de extração de variável pós-execução.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedVariable {
    pub variable_name: String,
    #[serde(default)]
    pub json_path: String,
    pub source: ExtractionSource,
}

/// Assertion de uma verificação de infraestrutura.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    #[serde(default)]
    pub json_path: String,
    pub operator: AssertionOperator,
    #[serde(default)]
    pub expected_value: String,
}

/// Verificação de infraestrutura anexada a um step.
///
/// `preListen = true` arma o listener (grupo de consumo, subscription)
/// ANTES da chamada HTTP, para que o evento não seja perdido.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub connector_name: String,
    #[serde(default)]
    pub query: String,
    /// Orçamento total da verificação, em segundos.
    #[serde(default = "default_verification_timeout")]
    pub timeout_seconds: u64,
    /// Teto da query no driver, em segundos.
    #[serde(default = "default_verification_timeout")]
    pub query_timeout_seconds: u64,
    #[serde(default)]
    pub pre_listen: bool,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

fn default_verification_timeout() -> u64 {
    10
}

/// Um step: uma chamada HTTP com dependências, handlers, extrações e
/// verificações.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub method: HttpMethod,
    /// Template de URL; aceita todos os placeholders.
    pub url: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub form_fields: Vec<FormField>,
    #[serde(default)]
    pub query_params: Vec<KeyValue>,
    /// Headers padrão do ambiente suprimidos neste step (por chave).
    #[serde(default)]
    pub disabled_default_headers: Vec<String>,
    #[serde(default)]
    pub cacheable: bool,
    /// 0 significa válido durante o run inteiro.
    #[serde(default)]
    pub cache_ttl_seconds: u64,
    /// Steps dependency-only não entram em runs de suíte; só executam
    /// quando puxados por um dependente.
    #[serde(default)]
    pub dependency_only: bool,
    /// Desempate de ordem entre steps topologicamente equivalentes.
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub dependencies: Vec<StepDependency>,
    #[serde(default)]
    pub response_handlers: Vec<ResponseHandler>,
    #[serde(default)]
    pub extracted_variables: Vec<ExtractedVariable>,
    #[serde(default)]
    pub verifications: Vec<Verification>,
}

/// Suíte: coleção ordenada de steps com ambiente padrão opcional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suite {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub environment_id: Option<Uuid>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Suite {
    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Snapshot hidratado que o motor recebe: a suíte e os ambientes
/// referenciados, tudo resolvido pelo catálogo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteSnapshot {
    pub suite: Suite,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

impl SuiteSnapshot {
    /// Resolve o ambiente do run: o id pedido, senão o padrão da suíte,
    /// senão um ambiente vazio.
    pub fn environment(&self, requested: Option<Uuid>) -> Environment {
        let wanted = requested.or(self.suite.environment_id);
        match wanted {
            Some(id) => self
                .environments
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .unwrap_or_else(Environment::empty),
            None => Environment::empty(),
        }
    }
}

// ============================================================================
// AGENDAMENTO
// ============================================================================

/// Agendamento cron de uma suíte (5 campos, dow 0 = domingo).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Uuid,
    pub suite_id: Uuid,
    #[serde(default)]
    pub environment_id: Option<Uuid>,
    pub cron_expression: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

// ============================================================================
// RUN E RESULTADOS
// ============================================================================

/// Registro de um run: criado `RUNNING`, transita uma única vez para um
/// estado terminal. Runs nunca são soft-deletados.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub suite_id: Uuid,
    #[serde(default)]
    pub environment_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub schedule_id: Option<Uuid>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub result_data: Option<Value>,
}

/// Resultado de uma assertion individual.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub json_path: String,
    pub operator: AssertionOperator,
    pub expected_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<String>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Resultado de uma verificação (query + assertions) de um step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub connector_name: String,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub assertion_results: Vec<AssertionResult>,
}

/// Resultado da execução de um step, emitido no evento `step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionResult {
    pub step_id: Uuid,
    pub step_name: String,
    pub status: StepStatus,
    /// 0 indica falha de I/O sem resposta.
    pub response_code: u16,
    #[serde(default)]
    pub response_body: String,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub extracted_variables: HashMap<String, String>,
    #[serde(default)]
    pub verification_results: Vec<VerificationResult>,
    #[serde(default)]
    pub request_url: String,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_query_params: HashMap<String, String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StepExecutionResult {
    /// Resultado sintético para um step pulado (dependência falhou ou
    /// run cancelado).
    pub fn skipped(step_id: Uuid, step_name: &str, reason: impl Into<String>) -> Self {
        Self {
            step_id,
            step_name: step_name.to_string(),
            status: StepStatus::Skipped,
            response_code: 0,
            response_body: String::new(),
            response_headers: HashMap::new(),
            duration_ms: 0,
            error_message: Some(reason.into()),
            from_cache: false,
            extracted_variables: HashMap::new(),
            verification_results: Vec::new(),
            request_url: String::new(),
            request_body: String::new(),
            request_headers: HashMap::new(),
            request_query_params: HashMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// Resultado agregado de um run, emitido no evento `complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteExecutionResult {
    pub run_id: Uuid,
    pub suite_id: Uuid,
    pub suite_name: String,
    pub trigger_type: TriggerType,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub steps: Vec<StepExecutionResult>,
}

// ============================================================================
// EVENTOS DO STREAM
// ============================================================================

/// Campo de input manual pedido ao operador.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputField {
    pub name: String,
    pub default_value: Option<String>,
    /// Valor já submetido neste run, oferecido como dica.
    pub cached_value: Option<String>,
}

/// Evento emitido no stream ao vivo de um run.
///
/// Garantias de ordem dentro de um run: `run-started` precede todos os
/// `step`; o `step` de B vem estritamente depois do `step` de cada
/// predecessor declarado de B; `complete`/`run-error` encerram o stream.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
    },
    Step(Box<StepExecutionResult>),
    InputRequired {
        run_id: Uuid,
        step_id: Uuid,
        step_name: String,
        fields: Vec<InputField>,
    },
    Complete(Box<SuiteExecutionResult>),
    RunError {
        message: String,
    },
}

impl RunEvent {
    /// Nome do evento SSE.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run-started",
            Self::Step(_) => "step",
            Self::InputRequired { .. } => "input-required",
            Self::Complete(_) => "complete",
            Self::RunError { .. } => "run-error",
        }
    }

    /// Payload JSON do evento.
    pub fn payload(&self) -> Value {
        match self {
            Self::RunStarted { run_id } => serde_json::json!({ "runId": run_id }),
            Self::Step(result) => serde_json::to_value(result).unwrap_or(Value::Null),
            Self::InputRequired {
                run_id,
                step_id,
                step_name,
                fields,
            } => serde_json::json!({
                "runId": run_id,
                "stepId": step_id,
                "stepName": step_name,
                "fields": fields,
            }),
            Self::Complete(result) => serde_json::to_value(result).unwrap_or(Value::Null),
            Self::RunError { message } => serde_json::json!({ "message": message }),
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
