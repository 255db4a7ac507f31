use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::error;

use super::Sink;
use crate::config::TableName;
use crate::error::SinkError;

/// Appends chunks to a Postgres table, one statement per chunk.
///
/// Rows are sent as a single JSON array and expanded server side, the table's columns are
/// named after the row fields.
pub struct PostgresSink {
    pool: PgPool,
    table: TableName,
    query: String,
}

impl PostgresSink {
    pub fn new(pool: PgPool, table: TableName) -> Self {
        let query = format!(
            "INSERT INTO {0} SELECT * FROM jsonb_populate_recordset(NULL::{0}, $1::jsonb)",
            table.as_str()
        );

        Self { pool, table, query }
    }
}

fn json_array(rows: &[Vec<u8>]) -> String {
    let mut payload = Vec::with_capacity(rows.iter().map(|r| r.len() + 1).sum::<usize>() + 1);
    payload.push(b'[');
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            payload.push(b',');
        }
        payload.extend_from_slice(row);
    }
    payload.push(b']');

    String::from_utf8_lossy(&payload).into_owned()
}

#[async_trait]
impl Sink for PostgresSink {
    async fn append_rows(&self, chunks: Vec<Vec<Vec<u8>>>) -> Result<Vec<usize>, SinkError> {
        let mut failed = Vec::new();

        for (index, chunk) in chunks.iter().enumerate() {
            let result = sqlx::query(&self.query)
                .bind(json_array(chunk))
                .execute(&self.pool)
                .await;

            if let Err(e) = result {
                error!(table = %self.table.as_str(), index, "failed to insert chunk: {}", e);
                failed.push(index);
            }
        }

        Ok(failed)
    }

    async fn close(&self) {
        self.pool.close().await
    }
}
