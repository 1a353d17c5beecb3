use providers::ProviderError;

use crate::credentials::CredentialError;
use crate::webhook::SsrfRejected;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] ledger_db::DbError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Ssrf(#[from] SsrfRejected),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no adapter registered for provider {0:?}")]
    UnknownProvider(String),

    #[error("provider call exceeded its timeout")]
    Timeout,
}

impl EngineError {
    /// Whether another attempt within the same tick could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Provider(err) => err.is_retryable(),
            EngineError::Timeout => true,
            EngineError::Http(_) => true,
            _ => false,
        }
    }
}
