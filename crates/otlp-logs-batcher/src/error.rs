// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors that can occur when starting or configuring the batch engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Failed to build transport: {0}")]
    Transport(String),
}

/// Reasons a record was not accepted by [`crate::engine::BatchEngine::try_enqueue`].
///
/// None of these ever propagate as a panic into the producer; `enqueue` folds them into `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("Record queue is full")]
    QueueOverflow,

    #[error("Engine is draining, no new records are accepted")]
    Draining,

    #[error("Engine is stopped")]
    Stopped,
}

/// Failure reported by a [`crate::exporter::LogsTransport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Network error, timeout or a status the collector may recover from. Retried.
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// Authentication rejection, malformed payload and other 4xx. Never retried.
    #[error("Permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to encode batch: {0}")]
pub struct EncodeError(pub String);
