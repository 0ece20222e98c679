//! The batching writer: one task per destination table.
//!
//! Rows accumulate in memory and are flushed when the batch reaches
//! the size threshold or the flush interval elapses, whichever comes
//! first. A failed flush is retried with backoff; once the retry
//! budget is spent the batch is dropped with a logged loss. Channel
//! close drains whatever is buffered and exits.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use widesky_common::retry::RetryPolicy;

use crate::storage::FlushSink;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub flush_timeout: Duration,
}

/// Owns one table's batch for the life of the pipeline.
pub async fn run_writer<T, S>(
    table: &'static str,
    mut rx: mpsc::Receiver<T>,
    sink: S,
    config: WriterConfig,
) where
    S: FlushSink<T>,
{
    let mut batch: Vec<T> = Vec::with_capacity(config.batch_size);
    let mut deadline = Instant::now() + config.flush_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if !batch.is_empty() {
                    flush_batch(table, &mut batch, &sink, &config).await;
                }
                deadline = Instant::now() + config.flush_interval;
            }
            received = rx.recv() => {
                match received {
                    Some(row) => {
                        batch.push(row);
                        if batch.len() >= config.batch_size {
                            flush_batch(table, &mut batch, &sink, &config).await;
                            deadline = Instant::now() + config.flush_interval;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    // Upstream is gone; push out whatever is left, once.
    if !batch.is_empty() {
        let result =
            tokio::time::timeout(config.flush_timeout, sink.flush(&batch)).await;
        match result {
            Ok(Ok(())) => tracing::info!(table, rows = batch.len(), "final flush complete"),
            Ok(Err(err)) => {
                tracing::error!(table, rows = batch.len(), error = %err, "final flush failed, rows lost");
            }
            Err(_) => {
                tracing::error!(table, rows = batch.len(), "final flush timed out, rows lost");
            }
        }
    }
    tracing::debug!(table, "writer exited");
}

async fn flush_batch<T, S>(table: &'static str, batch: &mut Vec<T>, sink: &S, config: &WriterConfig)
where
    S: FlushSink<T>,
{
    let mut backoff = config.retry.backoff();
    loop {
        let result = tokio::time::timeout(config.flush_timeout, sink.flush(batch)).await;
        let error = match result {
            Ok(Ok(())) => {
                tracing::debug!(table, rows = batch.len(), "flushed batch");
                batch.clear();
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => "flush timed out".to_owned(),
        };
        match backoff.next_delay() {
            Some(delay) => {
                tracing::warn!(table, rows = batch.len(), error, ?delay, "flush failed, retrying");
                tokio::time::sleep(delay).await;
            }
            None => {
                tracing::error!(table, rows = batch.len(), error, "flush retries exhausted, batch dropped");
                batch.clear();
                return;
            }
        }
    }
}
