use thiserror::Error;

/// Errors surfaced by the deployment engine.
///
/// Pre-flight errors (`Validation`, `CyclicDefinition`, `DanglingReference`,
/// `VariantSelection`, `Template`) are always reported before any provider
/// call is made. Runtime errors are scoped to a single node and its
/// dependents; they show up in the per-node outcome list rather than as a
/// top-level error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameter '{parameter}': {reason}")]
    Validation { parameter: String, reason: String },

    #[error("cyclic definition involving '{name}'")]
    CyclicDefinition { name: String },

    #[error("'{referrer}' references unknown resource '{target}'")]
    DanglingReference { referrer: String, target: String },

    #[error("variant slot '{slot}' has {active} active members, expected exactly one")]
    VariantSelection { slot: String, active: usize },

    #[error("template error: {0}")]
    Template(String),

    #[error("provider call for '{name}' failed")]
    Provider {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("deployment cancelled")]
    Cancelled,

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub fn template(msg: impl Into<String>) -> Self {
        EngineError::Template(msg.into())
    }
}

/// Errors returned by resource providers.
///
/// Transient failures (timeouts, throttling, conflict-in-progress) are
/// retried with bounded exponential backoff; terminal failures fail the node
/// immediately.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("terminal provider failure: {0}")]
    Terminal(String),
}

impl ProviderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ProviderError::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        ProviderError::Terminal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
