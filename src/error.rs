//! Error types for ChatRelay.
#![allow(dead_code)]

use thiserror::Error;

use crate::providers::ProviderError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}
