//! Parallel batch writes with per-chunk retry
//!
//! Requests are split into chunks of [`BATCH_WRITE_LIMIT`] and dispatched
//! through `buffer_unordered(workers)`. Each chunk retries its unprocessed
//! remainder with capped exponential backoff. Chunk outcomes are folded into
//! [`WriteTotals`] by the coordinating loop only; workers never touch the
//! shared counters.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::codec::Item;
use crate::table::{TableService, WriteRequest, BATCH_WRITE_LIMIT};

pub const DEFAULT_WRITE_WORKERS: usize = 5;
pub const DEFAULT_DELETE_WORKERS: usize = 10;

/// Completed chunks between progress log lines
const PROGRESS_EVERY_CHUNKS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the zero-based `attempt` failed: `min(2^attempt, cap)` s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = 2u64.saturating_pow(attempt);
        Duration::from_secs(secs).min(self.max_backoff)
    }
}

/// Result of one chunk after its retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchWriteOutcome {
    pub items_submitted: usize,
    pub items_written: usize,
    pub items_failed: usize,
}

/// Aggregate over chunk outcomes; independent of completion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteTotals {
    pub items_processed: usize,
    pub items_written: usize,
    pub items_failed: usize,
    pub chunks: usize,
}

impl WriteTotals {
    pub fn absorb(&mut self, outcome: &BatchWriteOutcome) {
        self.items_processed += outcome.items_submitted;
        self.items_written += outcome.items_written;
        self.items_failed += outcome.items_failed;
        self.chunks += 1;
    }

    pub fn merge(&mut self, other: &WriteTotals) {
        self.items_processed += other.items_processed;
        self.items_written += other.items_written;
        self.items_failed += other.items_failed;
        self.chunks += other.chunks;
    }
}

#[derive(Clone)]
pub struct BatchWriter {
    tables: Arc<dyn TableService>,
    policy: RetryPolicy,
}

impl BatchWriter {
    pub fn new(tables: Arc<dyn TableService>) -> Self {
        Self::with_policy(tables, RetryPolicy::default())
    }

    pub fn with_policy(tables: Arc<dyn TableService>, policy: RetryPolicy) -> Self {
        Self { tables, policy }
    }

    /// Put every item into `table_name`. Existing items with the same key are
    /// overwritten.
    pub async fn write_all(&self, table_name: &str, items: Vec<Item>, workers: usize) -> WriteTotals {
        let total = items.len();
        info!(table = %table_name, items = total, workers, "Writing items");

        let totals = self
            .submit(table_name, items.into_iter().map(WriteRequest::Put).collect(), workers)
            .await;

        info!(
            table = %table_name,
            written = totals.items_written,
            total,
            "Batch write completed: {}",
            success_rate(totals.items_written, totals.items_processed)
        );
        if totals.items_failed > 0 {
            warn!(table = %table_name, failed = totals.items_failed, "Items failed to write");
        }
        totals
    }

    /// Delete the items identified by `keys`.
    pub async fn delete_all(&self, table_name: &str, keys: Vec<Item>, workers: usize) -> WriteTotals {
        self.submit(table_name, keys.into_iter().map(WriteRequest::Delete).collect(), workers)
            .await
    }

    async fn submit(&self, table_name: &str, requests: Vec<WriteRequest>, workers: usize) -> WriteTotals {
        let total = requests.len();
        let mut totals = WriteTotals::default();
        if requests.is_empty() {
            return totals;
        }

        let chunks: Vec<Vec<WriteRequest>> = requests
            .chunks(BATCH_WRITE_LIMIT)
            .map(<[WriteRequest]>::to_vec)
            .collect();

        let mut outcomes = stream::iter(chunks)
            .map(|chunk| self.write_chunk(table_name, chunk))
            .buffer_unordered(workers.max(1));

        while let Some(outcome) = outcomes.next().await {
            totals.absorb(&outcome);
            if totals.chunks % PROGRESS_EVERY_CHUNKS == 0 {
                info!(
                    table = %table_name,
                    "Progress: {}/{} items processed",
                    totals.items_written + totals.items_failed,
                    total
                );
            }
        }

        totals
    }

    async fn write_chunk(&self, table_name: &str, chunk: Vec<WriteRequest>) -> BatchWriteOutcome {
        let submitted = chunk.len();
        let mut pending = chunk;
        let mut written = 0;

        for attempt in 0..self.policy.max_attempts {
            let last_attempt = attempt + 1 >= self.policy.max_attempts;

            match self.tables.batch_write(table_name, &pending).await {
                Ok(unprocessed) => {
                    written += pending.len().saturating_sub(unprocessed.len());
                    if unprocessed.is_empty() {
                        return BatchWriteOutcome {
                            items_submitted: submitted,
                            items_written: written,
                            items_failed: 0,
                        };
                    }
                    if last_attempt {
                        warn!(
                            table = %table_name,
                            failed = unprocessed.len(),
                            attempts = self.policy.max_attempts,
                            "Unprocessed items remain after final attempt"
                        );
                        return BatchWriteOutcome {
                            items_submitted: submitted,
                            items_written: written,
                            items_failed: unprocessed.len(),
                        };
                    }
                    debug!(
                        table = %table_name,
                        unprocessed = unprocessed.len(),
                        attempt = attempt + 1,
                        "Retrying unprocessed items"
                    );
                    pending = unprocessed;
                },
                Err(e) => {
                    if last_attempt {
                        error!(table = %table_name, error = %e, "Batch write failed after all retries");
                        return BatchWriteOutcome {
                            items_submitted: submitted,
                            items_written: 0,
                            items_failed: submitted,
                        };
                    }
                    warn!(
                        table = %table_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Batch write attempt failed, retrying"
                    );
                },
            }

            sleep(self.policy.backoff(attempt)).await;
        }

        // Only reachable with max_attempts == 0.
        BatchWriteOutcome {
            items_submitted: submitted,
            items_written: written,
            items_failed: submitted - written,
        }
    }
}

/// `written / processed` as a percentage with two decimals.
pub fn success_rate(written: usize, processed: usize) -> String {
    let rate = if processed > 0 {
        written as f64 / processed as f64 * 100.0
    } else {
        0.0
    };
    format!("{:.2}%", rate)
}
