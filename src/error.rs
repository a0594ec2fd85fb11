//! Error types shared by the harness and the store adapters.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure reported by a store adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),

    #[error("store error: {0}")]
    Backend(String),

    #[error("transaction error: {0}")]
    Transaction(String),
}

/// Errors that abort the setup or the whole run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("map {0} not found in registry")]
    UnknownStore(String),

    #[error("{kind} generator {name} not found in registry")]
    UnknownGenerator { kind: &'static str, name: String },

    #[error("interrupted while waiting for workers")]
    Interrupted,

    #[error("configuration parsing error: {0}")]
    Figment(#[from] figment::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
