//! Batched, partially failing appends of attributed rows to the warehouse.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use persister_common::event::AttributedEvent;
use tracing::{error, warn};

use crate::error::{SinkError, WriterError};
use crate::metrics_consts::{WAREHOUSE_APPEND_DURATION_HISTOGRAM, WAREHOUSE_ROWS_COUNTER};

pub mod clickhouse;
pub mod jsonl;
pub mod postgres;

/// A warehouse table accepting batches of encoded rows.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Append every chunk, returning the indices of the chunks that failed. An `Err` means
    /// nothing can be assumed about any chunk.
    async fn append_rows(&self, chunks: Vec<Vec<Vec<u8>>>) -> Result<Vec<usize>, SinkError>;

    async fn close(&self);
}

/// Writes attributed rows to one table, in chunks of at most `batch_size` rows.
pub struct Writer {
    table: String,
    sink: Arc<dyn Sink>,
    batch_size: usize,
}

impl Writer {
    pub fn new(table: &str, sink: Arc<dyn Sink>, batch_size: usize) -> Self {
        Self {
            table: table.to_owned(),
            sink,
            batch_size: batch_size.max(1),
        }
    }

    /// Append `rows`, returning the event ids that were not written mapped to whether writing
    /// them again may succeed. Ids absent from the result were written.
    pub async fn append_rows(
        &self,
        rows: &[AttributedEvent],
    ) -> Result<HashMap<String, bool>, WriterError> {
        let mut failures = HashMap::new();
        if rows.is_empty() {
            return Ok(failures);
        }

        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::to_vec(row) {
                Ok(bytes) => encoded.push((row.id.as_str(), bytes)),
                Err(e) => {
                    error!(table = %self.table, event_id = %row.id, "failed to encode row: {}", e);
                    failures.entry(row.id.clone()).or_insert(false);
                }
            }
        }

        let mut chunk_ids: Vec<Vec<&str>> = Vec::new();
        let mut chunks: Vec<Vec<Vec<u8>>> = Vec::new();
        for batch in encoded.chunks(self.batch_size) {
            chunk_ids.push(batch.iter().map(|(id, _)| *id).collect());
            chunks.push(batch.iter().map(|(_, bytes)| bytes.clone()).collect());
        }
        let total = encoded.len();

        let started = tokio::time::Instant::now();
        let result = self.sink.append_rows(chunks).await;
        histogram!(WAREHOUSE_APPEND_DURATION_HISTOGRAM, "table" => self.table.clone())
            .record(started.elapsed().as_secs_f64());

        let failed_chunks = match result {
            Ok(failed_chunks) => failed_chunks,
            Err(e) => {
                counter!(WAREHOUSE_ROWS_COUNTER, "table" => self.table.clone(), "status" => "retriable")
                    .increment(total as u64);
                return Err(e.into());
            }
        };

        let mut retriable_rows = 0;
        for index in failed_chunks {
            let Some(ids) = chunk_ids.get(index) else {
                warn!(table = %self.table, index, "sink reported an unknown chunk");
                continue;
            };
            retriable_rows += ids.len();
            for id in ids {
                failures.insert((*id).to_owned(), true);
            }
        }

        counter!(WAREHOUSE_ROWS_COUNTER, "table" => self.table.clone(), "status" => "written")
            .increment((total - retriable_rows) as u64);
        counter!(WAREHOUSE_ROWS_COUNTER, "table" => self.table.clone(), "status" => "retriable")
            .increment(retriable_rows as u64);
        counter!(WAREHOUSE_ROWS_COUNTER, "table" => self.table.clone(), "status" => "non_retriable")
            .increment((rows.len() - total) as u64);

        Ok(failures)
    }

    pub async fn close(&self) {
        self.sink.close().await
    }
}

#[cfg(test)]
mod tests {
    use persister_common::event::AttributedEvent;

    use super::*;
    use crate::test_utils::{evaluation_event, MemorySink};

    fn rows(count: usize) -> Vec<AttributedEvent> {
        (0..count)
            .map(|i| {
                let event = evaluation_event("f1", 1, "u1", "vA", 1500);
                AttributedEvent::from_evaluation(&format!("m{i}"), "env", &event)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_chunk_failure_maps_to_event_ids() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_chunks([1]);
        let writer = Writer::new("evaluation_events", sink.clone(), 10);

        let failures = writer.append_rows(&rows(15)).await.expect("append failed");

        let mut failed: Vec<&String> = failures.keys().collect();
        failed.sort_by_key(|id| id[1..].parse::<usize>().unwrap());
        assert_eq!(failed, vec!["m10", "m11", "m12", "m13", "m14"]);
        assert!(failures.values().all(|retriable| *retriable));
        assert_eq!(sink.rows().len(), 10);
    }

    #[tokio::test]
    async fn test_rows_are_chunked_by_batch_size() {
        let sink = Arc::new(MemorySink::new());
        let writer = Writer::new("evaluation_events", sink.clone(), 4);

        let failures = writer.append_rows(&rows(9)).await.expect("append failed");

        assert!(failures.is_empty());
        assert_eq!(sink.chunk_sizes(), vec![4, 4, 1]);
        assert_eq!(sink.rows(), rows(9));
    }

    #[tokio::test]
    async fn test_sink_error_is_returned() {
        let sink = Arc::new(MemorySink::new());
        sink.set_failing(true);
        let writer = Writer::new("evaluation_events", sink, 10);

        assert!(matches!(
            writer.append_rows(&rows(3)).await,
            Err(WriterError::Sink(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_append_skips_sink() {
        let sink = Arc::new(MemorySink::new());
        sink.set_failing(true);
        let writer = Writer::new("evaluation_events", sink, 10);

        assert!(writer.append_rows(&[]).await.expect("append failed").is_empty());
    }
}
