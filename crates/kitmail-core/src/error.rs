use thiserror::Error;

/// Local invariant violations. Always rejected synchronously with no partial
/// effect on the store or the folder catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("folder already exists: {0}")]
    DuplicateFolder(String),
    #[error("folder is protected: {0}")]
    ProtectedFolder(String),
    #[error("not a real folder: {0}")]
    NotARealFolder(String),
    #[error("unknown message: {0}")]
    UnknownMessage(String),
}
