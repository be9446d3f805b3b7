#[derive(Debug, thiserror::Error)]
pub enum ChanError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller broke an input contract (empty batch, missing OP, ...)
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The durable local source failed to read or write
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ChanError {
    pub fn is_storage(&self) -> bool {
        matches!(self, ChanError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, ChanError>;
