// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # OTLP logs batcher
//!
//! Bounded, asynchronous batching and export of structured log records to a
//! telemetry collector.
//!
//! Producers call [`engine::BatchEngine::enqueue`], which never blocks and never
//! performs I/O. A background worker cuts the queued records into batches, on size or
//! on a periodic timer, and hands them one at a time to the [`exporter::Exporter`],
//! which retries transient failures with backoff. Shutdown drains everything pending,
//! bounded by a caller-supplied timeout.
//!
//! - [`queue`]: bounded record queue with reject or drop-oldest overflow
//! - [`accumulator`]: size-triggered and timer-triggered batch cutting
//! - [`scheduler`]: periodic flush timer
//! - [`exporter`]: retry loop and collaborator traits for encoding and transport
//! - [`transport`]: default JSON encoder and HTTP transport
//! - [`engine`]: the producer-facing facade and its lifecycle
//! - [`sink`]: level filtering and message rendering in front of the engine

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

pub mod accumulator;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod queue;
pub mod record;
pub mod scheduler;
pub mod sink;
pub mod transport;
mod worker;

pub use config::EngineConfig;
pub use engine::{BatchEngine, BatchEngineBuilder, EngineState, EngineStats};
pub use error::{EngineError, EnqueueError};
pub use record::{LogRecord, ResourceAttributes, Severity};
