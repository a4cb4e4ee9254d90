use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiftError {
    // Language model errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("LLM response does not match schema: {0}")]
    SchemaMismatch(String),

    // Pipeline errors
    #[error("Decomposition failed after {attempts} attempt(s): {message}")]
    Decomposition { attempts: usize, message: String },

    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Pending plan {plan_id} expired after {ttl_secs}s")]
    PlanExpired { plan_id: String, ttl_secs: u64 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run cancelled")]
    Cancelled,

    // Domain service errors
    #[error("Domain service error: {0}")]
    Domain(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SiftError {
    /// Short machine-readable name, surfaced in aborted run outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LlmRequest(_) => "llm_request",
            Self::UnsupportedProvider(_) => "unsupported_provider",
            Self::LlmParse(_) => "llm_parse",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::Decomposition { .. } => "decomposition_error",
            Self::GraphValidation(_) => "graph_validation_error",
            Self::Synthesis(_) => "synthesis_error",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::PlanExpired { .. } => "plan_expired",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Cancelled => "cancelled",
            Self::Domain(_) => "domain_error",
            Self::Config(_) => "config_error",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SiftError>;
