//! Error taxonomy for the coordination substrate.
//!
//! Caller-triggered invariant violations (double transaction, commit without an
//! open transaction) surface as synchronous errors. Reads never error on
//! absence: a missing key or path is `None`, not an error variant.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("event persistence io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("transaction already in progress")]
    TransactionInProgress,
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("custom backend specified but no implementation provided")]
    MissingCustomBackend,
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("value encoding failed for key {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
    #[error("value decoding failed for key {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state path must not be empty")]
    EmptyPath,
    #[error("state value decoding failed at {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[error("broadcast failed: {0}")]
    Bus(#[from] BusError),
    #[error("state persistence failed: {0}")]
    Storage(#[from] StorageError),
}
