// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;
use thiserror::Error;

/// Failures of the disk-backed key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store writer stopped before the write completed")]
    WriterGone,
}

/// A request or event was rejected at the call site. Nothing was queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request is missing app_key")]
    MissingAppKey,
    #[error("request is missing device_id")]
    MissingDeviceId,
    #[error("event key must not be empty")]
    EmptyEventKey,
    #[error("raw request must carry at least one parameter")]
    EmptyRawRequest,
    #[error("device id must not be empty")]
    EmptyDeviceId,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("response rejected by {0} validation")]
    InvalidResponse(&'static str),
}

/// Errors returned to producers by [`crate::producer::Producer`] calls.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("owner channel closed: {0}")]
    ChannelClosed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Failures while starting the owner.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ValidationError::MissingAppKey.to_string(),
            "request is missing app_key"
        );
        assert_eq!(
            ConfigError::Missing("OUTBOX_APP_KEY").to_string(),
            "OUTBOX_APP_KEY environment variable is not set"
        );
        assert_eq!(
            TransportError::Status(StatusCode::NOT_FOUND).to_string(),
            "unexpected status 404 Not Found"
        );
    }

    #[test]
    fn test_producer_error_from_validation() {
        let err: ProducerError = ValidationError::EmptyEventKey.into();
        assert!(matches!(
            err,
            ProducerError::Validation(ValidationError::EmptyEventKey)
        ));
        assert_eq!(err.to_string(), "event key must not be empty");
    }
}
