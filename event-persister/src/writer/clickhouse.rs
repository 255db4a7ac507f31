use async_trait::async_trait;
use tracing::error;
use url::Url;

use super::Sink;
use crate::config::TableName;
use crate::error::SinkError;

/// Appends chunks to a ClickHouse table through the HTTP interface, one `INSERT` per chunk.
pub struct ClickHouseSink {
    client: reqwest::Client,
    url: Url,
    table: TableName,
    query: String,
}

impl ClickHouseSink {
    pub fn new(client: reqwest::Client, url: Url, table: TableName) -> Self {
        let query = format!("INSERT INTO {} FORMAT JSONEachRow", table.as_str());

        Self {
            client,
            url,
            table,
            query,
        }
    }

    async fn insert(&self, chunk: Vec<Vec<u8>>) -> Result<(), SinkError> {
        self.client
            .post(self.url.clone())
            .query(&[("query", self.query.as_str())])
            .body(chunk.join(&b'\n'))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn append_rows(&self, chunks: Vec<Vec<Vec<u8>>>) -> Result<Vec<usize>, SinkError> {
        let mut failed = Vec::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            if let Err(e) = self.insert(chunk).await {
                error!(table = %self.table.as_str(), index, "failed to insert chunk: {}", e);
                failed.push(index);
            }
        }

        Ok(failed)
    }

    async fn close(&self) {}
}
