use crate::TransactionIndex;

/// Opaque status code carried by a failed response.
pub type StatusCode = i32;

/// Status codes the store is known to emit. Anything else passes through
/// as [`KvError::Status`].
pub mod code {
    use super::StatusCode;

    // common
    pub const TIMEOUT: StatusCode = 100;
    pub const UNEXPECTED_ERROR: StatusCode = 101;
    pub const ILLEGAL_ARGUMENT: StatusCode = 102;

    // transaction
    pub const TR_ALREADY_COMPLETED: StatusCode = 201;
    pub const TR_INTERRUPTED: StatusCode = 202;
    pub const TR_NOT_FOUND: StatusCode = 203;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("request failed with status code {code}")]
    Status { code: StatusCode },
    #[error("request timed out")]
    Timeout,
    #[error("transaction {index} is already completed")]
    TransactionCompleted { index: TransactionIndex },
    #[error("transaction {index} not found")]
    TransactionNotFound { index: TransactionIndex },
    #[error("transaction {index} was interrupted")]
    TransactionInterrupted { index: TransactionIndex },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("client closed")]
    Closed,
    #[error("transport dropped the request without a response")]
    Disconnected,
}

impl KvError {
    /// Map a server status code onto the typed error. Transaction codes carry
    /// no index on the wire, so the caller supplies the one it sent.
    pub fn from_code(code: StatusCode, index: TransactionIndex) -> Self {
        match code {
            code::TIMEOUT => KvError::Timeout,
            code::TR_ALREADY_COMPLETED => KvError::TransactionCompleted { index },
            code::TR_INTERRUPTED => KvError::TransactionInterrupted { index },
            code::TR_NOT_FOUND => KvError::TransactionNotFound { index },
            code => KvError::Status { code },
        }
    }

    /// Status code equivalent, used when an error has to cross the wire.
    pub fn code(&self) -> StatusCode {
        match self {
            KvError::Status { code } => *code,
            KvError::Timeout => code::TIMEOUT,
            KvError::TransactionCompleted { .. } => code::TR_ALREADY_COMPLETED,
            KvError::TransactionInterrupted { .. } => code::TR_INTERRUPTED,
            KvError::TransactionNotFound { .. } => code::TR_NOT_FOUND,
            KvError::InvalidArgument(_) | KvError::Codec(_) => code::ILLEGAL_ARGUMENT,
            KvError::Transport(_) | KvError::Closed | KvError::Disconnected => {
                code::UNEXPECTED_ERROR
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, KvError::Timeout)
    }
}
