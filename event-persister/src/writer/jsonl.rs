use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::Sink;
use crate::config::TableName;
use crate::error::SinkError;

/// File holding the rows of `table` under `dir`, one JSON object per line.
pub fn table_path(dir: &Path, table: &TableName) -> PathBuf {
    dir.join(format!("{}.jsonl", table.as_str()))
}

/// Append-only row store: every row is appended as a line to a per-table JSON lines file.
pub struct JsonLinesSink {
    path: PathBuf,
    table: TableName,
    // Serializes appends so that concurrent chunks never interleave within a line.
    file: Mutex<Option<File>>,
}

impl JsonLinesSink {
    pub fn new(dir: &Path, table: TableName) -> Self {
        let path = table_path(dir, &table);
        info!("appending {} rows to {}", table.as_str(), path.display());

        Self {
            path,
            table,
            file: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<File, SinkError> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?)
    }
}

fn encode_chunk(chunk: Vec<Vec<u8>>) -> Vec<u8> {
    let mut data = Vec::with_capacity(chunk.iter().map(|row| row.len() + 1).sum());
    for row in chunk {
        data.extend_from_slice(&row);
        data.push(b'\n');
    }
    data
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn append_rows(&self, chunks: Vec<Vec<Vec<u8>>>) -> Result<Vec<usize>, SinkError> {
        let mut guard = self.file.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open().await?,
        };

        let mut failed = Vec::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let data = encode_chunk(chunk);
            let written = match file.write_all(&data).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                error!(table = %self.table.as_str(), index, "failed to append chunk: {}", e);
                failed.push(index);
            }
        }

        // Reopened on the next append after a failure, in case the file was moved away.
        if failed.is_empty() {
            *guard = Some(file);
        }

        Ok(failed)
    }

    async fn close(&self) {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            if let Err(e) = file.sync_all().await {
                error!(table = %self.table.as_str(), "failed to sync rows: {}", e);
            }
        }
    }
}
