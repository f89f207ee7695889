//! Typed errors for the bus, the state store and payload decoding.
//!
//! None of these are fatal: the controller and the bus log them and carry
//! on. Startup code wraps them in `anyhow` with context instead.

use thiserror::Error;

/// Errors raised by the in-process message bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Bad or missing credentials. The connection is rejected.
    #[error("authentication failed for client '{client_id}'")]
    AuthFailure { client_id: String },

    /// The bus was shut down and no longer accepts messages.
    #[error("bus closed, cannot publish to '{topic}'")]
    Closed { topic: String },
}

/// A telemetry payload that could not be turned into a device report.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a json object")]
    NotAnObject,

    #[error("field '{0}' must be a number")]
    NotANumber(String),
}

/// Errors from the shared state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

// ===========================================================================
// Tests
// ===========================================================================
