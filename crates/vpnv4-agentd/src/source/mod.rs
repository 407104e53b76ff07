//! Change sources
//!
//! A source reports tenant changes as [`ChangeEvent`]s each time it is
//! polled. [`spawn_source`] drives one source on its interval, backing off
//! exponentially after failures, and forwards every non-empty batch to the
//! engine queue.

pub mod file;
pub mod ovsdb;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vpnv4_common::AgentResult;

use crate::config::WatcherConfig;
use crate::types::{ChangeEvent, SourceBatch};

pub use file::FileSource;
pub use ovsdb::OvsdbClient;
pub use registry::{PortRecord, RegistryClient, RegistrySource};

/// Upper bound on the delay between retries of a failing source
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Producer of tenant change events
#[async_trait]
pub trait ChangeSource: Send {
    /// Name used in logs and batches
    fn name(&self) -> &str;

    /// Delay between successful polls
    fn interval(&self) -> Duration;

    /// Read the source once and report what changed since the previous poll
    async fn poll(&mut self) -> AgentResult<Vec<ChangeEvent>>;
}

/// Retry policy applied after a failed poll
pub fn retry_policy(interval: Duration) -> ExponentialBackoff {
    let initial = interval.min(MAX_BACKOFF);
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        multiplier: 2.0,
        max_interval: MAX_BACKOFF,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Build the configured sources
pub fn from_config(watchers: &[WatcherConfig]) -> Vec<Box<dyn ChangeSource>> {
    watchers
        .iter()
        .map(|watcher| -> Box<dyn ChangeSource> {
            match watcher {
                WatcherConfig::File {
                    path, resync_every, ..
                } => Box::new(FileSource::new(path, watcher.interval(), *resync_every)),
                WatcherConfig::Ovn {
                    connection,
                    resync_every,
                    tenant_keys,
                    timeout_secs,
                    ..
                } => Box::new(RegistrySource::new(
                    watcher.name(),
                    OvsdbClient::new(connection.clone(), Duration::from_secs(*timeout_secs)),
                    watcher.interval(),
                    *resync_every,
                    tenant_keys.clone(),
                )),
            }
        })
        .collect()
}

/// Run a source on its own task until cancelled
pub fn spawn_source(
    source: Box<dyn ChangeSource>,
    tx: mpsc::Sender<SourceBatch>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_source(source, tx, cancel))
}

/// Poll loop behind [`spawn_source`]
pub async fn run_source(
    mut source: Box<dyn ChangeSource>,
    tx: mpsc::Sender<SourceBatch>,
    cancel: CancellationToken,
) {
    let name = source.name().to_string();
    let mut policy = retry_policy(source.interval());
    info!(source = %name, interval_secs = source.interval().as_secs_f64(), "Starting change source");

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = source.poll() => result,
        };

        let delay = match result {
            Ok(events) => {
                policy.reset();
                if !events.is_empty() {
                    debug!(source = %name, count = events.len(), "Queueing source batch");
                    let batch = SourceBatch {
                        source: name.clone(),
                        events,
                    };
                    if tx.send(batch).await.is_err() {
                        debug!(source = %name, "Engine queue closed");
                        break;
                    }
                }
                source.interval()
            }
            Err(e) => {
                let delay = policy.next_backoff().unwrap_or(MAX_BACKOFF);
                warn!(
                    source = %name,
                    error = %e,
                    transient = e.is_retryable(),
                    retry_in_secs = delay.as_secs_f64(),
                    "Change source poll failed, keeping last known state"
                );
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(source = %name, "Change source stopped");
}

/// Poll every source once, in order, keeping the batches that succeeded
pub async fn poll_all(sources: &mut [Box<dyn ChangeSource>]) -> Vec<SourceBatch> {
    let mut batches = Vec::new();
    for source in sources.iter_mut() {
        match source.poll().await {
            Ok(events) if !events.is_empty() => batches.push(SourceBatch {
                source: source.name().to_string(),
                events,
            }),
            Ok(_) => {}
            Err(e) => warn!(source = %source.name(), error = %e, "Change source poll failed"),
        }
    }
    batches
}
