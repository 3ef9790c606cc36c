//! Error types for the client crate.

use mosaic_core::{ListingError, MosaicError, StorageError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Invalid header value for {name}")]
    InvalidHeader { name: &'static str },
    #[error("Telemetry setup failed: {0}")]
    Telemetry(String),
    #[error(transparent)]
    Mosaic(#[from] MosaicError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        Self::Mosaic(err.into())
    }
}

impl From<ListingError> for ClientError {
    fn from(err: ListingError) -> Self {
        Self::Mosaic(err.into())
    }
}

impl From<mosaic_core::ConfigError> for ClientError {
    fn from(err: mosaic_core::ConfigError) -> Self {
        Self::Config(err.into())
    }
}
