// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod input;

use std::env;
use std::future::Future;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use otlp_logs_batcher::{sink::LogSink, EngineConfig, Severity};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LINE_LEVEL: Severity = Severity::Information;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("OTLP_LOGS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on logs relay startup: {e}");
            return;
        }
    };

    let endpoint = config.endpoint.clone();
    let sink = match LogSink::start(config) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Error starting the batch engine: {e}");
            return;
        }
    };

    info!("Relaying stdin to {endpoint}");

    let refused = relay(BufReader::new(io::stdin()), &sink, tokio::signal::ctrl_c()).await;

    if refused > 0 {
        debug!("{refused} records were filtered or refused");
    }

    let drained = sink.shutdown(SHUTDOWN_TIMEOUT).await;
    let stats = sink.engine().stats();
    if drained {
        info!(
            "Shut down: {} delivered, {} failed, {} dropped",
            stats.delivered_records, stats.failed_records, stats.dropped_records
        );
    } else {
        warn!(
            "Shutdown timed out after {}s: {} delivered, {} failed, {} dropped",
            SHUTDOWN_TIMEOUT.as_secs(),
            stats.delivered_records,
            stats.failed_records,
            stats.dropped_records
        );
    }
}

/// Emits every line of `reader` until end of input or until `shutdown` resolves.
/// Returns the number of records the sink filtered or refused.
async fn relay<R, F>(reader: R, sink: &LogSink, shutdown: F) -> u64
where
    R: AsyncBufRead + Unpin,
    F: Future,
{
    tokio::pin!(shutdown);
    let mut lines = reader.lines();
    let mut refused: u64 = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(record) = input::parse_line(&line, DEFAULT_LINE_LEVEL) else {
                        continue;
                    };
                    if !sink.emit(record) {
                        refused += 1;
                    }
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Received interrupt, shutting down");
                break;
            }
        }
    }
    refused
}
