//! Error types for the event and filter model

use thiserror::Error;

/// Errors produced while parsing events, keys and filters
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid length for {field}: expected {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

/// Errors returned by hook sinks and sources
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Sink failed: {0}")]
    Sink(String),

    #[error("Source failed: {0}")]
    Source(String),

    #[error("{} sink(s) failed", .0.len())]
    Multiple(Vec<HookError>),
}
