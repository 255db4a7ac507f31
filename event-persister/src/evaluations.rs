//! Lookups of the evaluation a user was served, read back from the warehouse's own evaluation
//! table so that goal rows agree with the evaluation rows next to them.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use persister_common::event::{AttributedEvent, UserEvaluation};
use serde::Deserialize;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use url::Url;

use crate::config::TableName;
use crate::error::EvaluationError;
use crate::writer::jsonl::table_path;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Find the first evaluation of a feature version served to a user inside a window.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationQuery<'a> {
    pub environment_id: &'a str,
    pub user_id: &'a str,
    pub feature_id: &'a str,
    pub feature_version: i32,
    /// Unix seconds, inclusive.
    pub window_start: i64,
    /// Unix seconds, inclusive.
    pub window_end: i64,
}

#[async_trait]
pub trait EvaluationSource: Send + Sync {
    /// Returns `EvaluationError::NotFound` when the user has no evaluation in the window yet.
    async fn query_user_evaluation(
        &self,
        query: &EvaluationQuery<'_>,
    ) -> Result<UserEvaluation, EvaluationError>;
}

pub struct PostgresEvaluationSource {
    pool: PgPool,
    query: String,
}

impl PostgresEvaluationSource {
    pub fn new(pool: PgPool, table: &TableName) -> Self {
        let query = format!(
            r#"
SELECT feature_id, feature_version, variation_id, reason, "timestamp"
FROM {0}
WHERE environment_id = $1
  AND user_id = $2
  AND feature_id = $3
  AND feature_version = $4
  AND "timestamp" BETWEEN $5 AND $6
ORDER BY "timestamp" ASC
LIMIT 1
            "#,
            table.as_str()
        );

        Self { pool, query }
    }
}

#[async_trait]
impl EvaluationSource for PostgresEvaluationSource {
    async fn query_user_evaluation(
        &self,
        query: &EvaluationQuery<'_>,
    ) -> Result<UserEvaluation, EvaluationError> {
        let row = sqlx::query(&self.query)
            .bind(query.environment_id)
            .bind(query.user_id)
            .bind(query.feature_id)
            .bind(query.feature_version)
            .bind(query.window_start.saturating_mul(MICROS_PER_SECOND))
            .bind(query.window_end.saturating_mul(MICROS_PER_SECOND))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EvaluationError::NotFound)?;

        Ok(UserEvaluation {
            feature_id: row.try_get("feature_id")?,
            feature_version: row.try_get("feature_version")?,
            variation_id: row.try_get("variation_id")?,
            reason: row.try_get("reason")?,
            timestamp: row.try_get::<i64, _>("timestamp")? / MICROS_PER_SECOND,
        })
    }
}

#[derive(Deserialize)]
struct ClickHouseEvaluationRow {
    feature_id: String,
    feature_version: i32,
    variation_id: String,
    reason: String,
    timestamp: i64,
}

impl From<ClickHouseEvaluationRow> for UserEvaluation {
    fn from(row: ClickHouseEvaluationRow) -> Self {
        UserEvaluation {
            feature_id: row.feature_id,
            feature_version: row.feature_version,
            variation_id: row.variation_id,
            reason: row.reason,
            timestamp: row.timestamp / MICROS_PER_SECOND,
        }
    }
}

/// Queries ClickHouse over its HTTP interface, with values passed as query parameters.
pub struct ClickHouseEvaluationSource {
    client: reqwest::Client,
    url: Url,
    query: String,
}

impl ClickHouseEvaluationSource {
    pub fn new(client: reqwest::Client, url: Url, table: &TableName) -> Self {
        let query = format!(
            "SELECT feature_id, feature_version, variation_id, reason, timestamp \
             FROM {0} \
             WHERE environment_id = {{environment_id:String}} \
               AND user_id = {{user_id:String}} \
               AND feature_id = {{feature_id:String}} \
               AND feature_version = {{feature_version:Int32}} \
               AND timestamp BETWEEN {{window_start:Int64}} AND {{window_end:Int64}} \
             ORDER BY timestamp ASC \
             LIMIT 1 \
             FORMAT JSONEachRow",
            table.as_str()
        );

        Self { client, url, query }
    }
}

#[async_trait]
impl EvaluationSource for ClickHouseEvaluationSource {
    async fn query_user_evaluation(
        &self,
        query: &EvaluationQuery<'_>,
    ) -> Result<UserEvaluation, EvaluationError> {
        let params = [
            ("param_environment_id", query.environment_id.to_owned()),
            ("param_user_id", query.user_id.to_owned()),
            ("param_feature_id", query.feature_id.to_owned()),
            ("param_feature_version", query.feature_version.to_string()),
            (
                "param_window_start",
                query.window_start.saturating_mul(MICROS_PER_SECOND).to_string(),
            ),
            (
                "param_window_end",
                query.window_end.saturating_mul(MICROS_PER_SECOND).to_string(),
            ),
        ];

        let body = self
            .client
            .post(self.url.clone())
            .query(&params)
            .body(self.query.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_first_row(&body)
    }
}

fn parse_first_row(body: &str) -> Result<UserEvaluation, EvaluationError> {
    let line = body
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or(EvaluationError::NotFound)?;
    let row: ClickHouseEvaluationRow = serde_json::from_str(line)?;

    Ok(row.into())
}

/// Scans the JSON lines file the row store appends evaluation rows to.
pub struct JsonLinesEvaluationSource {
    path: PathBuf,
}

impl JsonLinesEvaluationSource {
    pub fn new(dir: &Path, table: &TableName) -> Self {
        Self {
            path: table_path(dir, table),
        }
    }
}

impl EvaluationQuery<'_> {
    fn matches(&self, row: &AttributedEvent) -> bool {
        row.goal_id.is_none()
            && row.environment_id == self.environment_id
            && row.user_id == self.user_id
            && row.feature_id == self.feature_id
            && row.feature_version == self.feature_version
            && row.timestamp >= self.window_start.saturating_mul(MICROS_PER_SECOND)
            && row.timestamp <= self.window_end.saturating_mul(MICROS_PER_SECOND)
    }
}

#[async_trait]
impl EvaluationSource for JsonLinesEvaluationSource {
    async fn query_user_evaluation(
        &self,
        query: &EvaluationQuery<'_>,
    ) -> Result<UserEvaluation, EvaluationError> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            // Nothing was written yet.
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(EvaluationError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let mut earliest: Option<AttributedEvent> = None;
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let row: AttributedEvent = match serde_json::from_str(&line) {
                Ok(row) => row,
                Err(e) => {
                    // Torn by a failed append, the chunk was retried.
                    warn!(path = %self.path.display(), "skipping undecodable row: {}", e);
                    continue;
                }
            };
            if query.matches(&row)
                && earliest
                    .as_ref()
                    .map_or(true, |current| row.timestamp < current.timestamp)
            {
                earliest = Some(row);
            }
        }

        let row = earliest.ok_or(EvaluationError::NotFound)?;
        Ok(UserEvaluation {
            feature_id: row.feature_id,
            feature_version: row.feature_version,
            variation_id: row.variation_id,
            reason: row.reason,
            timestamp: row.timestamp / MICROS_PER_SECOND,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{
        evaluation_event, experiment, goal_event, random_string, user_evaluation,
    };
    use crate::writer::jsonl::JsonLinesSink;
    use crate::writer::Writer;

    fn query<'a>(user_id: &'a str) -> EvaluationQuery<'a> {
        EvaluationQuery {
            environment_id: "env",
            user_id,
            feature_id: "f1",
            feature_version: 1,
            window_start: 1000,
            window_end: 2000,
        }
    }

    fn evaluation_row(
        id: &str,
        version: i32,
        user_id: &str,
        variation: &str,
        at: i64,
    ) -> AttributedEvent {
        let event = evaluation_event("f1", version, user_id, variation, at);
        AttributedEvent::from_evaluation(id, "env", &event)
    }

    #[tokio::test]
    async fn test_row_store_returns_earliest_evaluation_in_window() {
        let dir = std::env::temp_dir().join(random_string("event-persister-", 12));
        std::fs::create_dir_all(&dir).unwrap();
        let table: TableName = "evaluation_events".parse().unwrap();
        let source = JsonLinesEvaluationSource::new(&dir, &table);

        assert!(matches!(
            source.query_user_evaluation(&query("u1")).await,
            Err(EvaluationError::NotFound)
        ));

        let writer = Writer::new(
            table.as_str(),
            Arc::new(JsonLinesSink::new(&dir, table.clone())),
            2,
        );
        // The goal row is the earliest match but is not an evaluation.
        let goal = AttributedEvent::from_goal(
            "m6",
            "env",
            &goal_event("g1", "u1", 1100),
            &experiment("e1", "f1", 1, &["g1"], 0, 5000),
            &user_evaluation("f1", 1, "vA", 1100),
        );
        let rows = vec![
            evaluation_row("m1", 1, "u1", "vC", 900),
            evaluation_row("m2", 1, "u1", "vB", 1500),
            evaluation_row("m3", 1, "u1", "vA", 1200),
            evaluation_row("m4", 2, "u1", "vD", 1050),
            evaluation_row("m5", 1, "u2", "vD", 1050),
            goal,
        ];
        assert!(writer.append_rows(&rows).await.unwrap().is_empty());
        writer.close().await;

        let evaluation = source.query_user_evaluation(&query("u1")).await.unwrap();
        assert_eq!(evaluation.variation_id, "vA");
        assert_eq!(evaluation.timestamp, 1200);

        assert!(matches!(
            source.query_user_evaluation(&query("u3")).await,
            Err(EvaluationError::NotFound)
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_parse_first_row() {
        let body = "{\"feature_id\":\"f1\",\"feature_version\":1,\"variation_id\":\"vB\",\"reason\":\"RULE\",\"timestamp\":1200000000}\n";
        let evaluation = parse_first_row(body).expect("failed to parse row");

        assert_eq!(evaluation.variation_id, "vB");
        assert_eq!(evaluation.timestamp, 1200);
    }

    #[test]
    fn test_empty_result_is_not_found() {
        assert!(matches!(parse_first_row(""), Err(EvaluationError::NotFound)));
        assert!(matches!(parse_first_row("\n"), Err(EvaluationError::NotFound)));
    }
}
