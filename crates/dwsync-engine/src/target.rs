//! ClickHouse target client
//!
//! Talks to the columnar store over its HTTP interface. Column sets are
//! dynamic per dataset, so batches travel as `JSONEachRow` payloads rather
//! than through a statically typed row client. The engine expects
//! ReplacingMergeTree-style tables: duplicate elimination happens on an
//! explicit `OPTIMIZE ... FINAL`, not automatically on write.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Errors from the target store.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("target rejected query (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("unexpected target response: {0}")]
    Response(String),
}

/// Connection settings for the target store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: None,
        }
    }
}

impl ClickHouseConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            url: std::env::var("DWSYNC_CLICKHOUSE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),
            database: std::env::var("DWSYNC_CLICKHOUSE_DATABASE")
                .unwrap_or_else(|_| "default".to_string()),
            user: std::env::var("DWSYNC_CLICKHOUSE_USER")
                .unwrap_or_else(|_| "default".to_string()),
            password: std::env::var("DWSYNC_CLICKHOUSE_PASSWORD").ok(),
        };

        if config.url.is_empty() {
            anyhow::bail!("DWSYNC_CLICKHOUSE_URL cannot be empty");
        }
        Ok(config)
    }
}

/// One provisioned column as reported by `DESCRIBE TABLE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// HTTP client for the columnar store.
#[derive(Clone)]
pub struct ClickHouseClient {
    http: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    pub fn new(config: ClickHouseConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Run a statement where the SQL itself is the whole payload.
    pub async fn execute(&self, sql: &str) -> Result<String, TargetError> {
        self.request(None, sql.to_string()).await
    }

    /// Run a statement with a separate data body (`INSERT ... FORMAT ...`).
    async fn execute_with_body(
        &self,
        query: &str,
        body: String,
    ) -> Result<String, TargetError> {
        self.request(Some(query), body).await
    }

    async fn request(
        &self,
        query_param: Option<&str>,
        body: String,
    ) -> Result<String, TargetError> {
        let mut request = self
            .http
            .post(&self.config.url)
            .query(&[("database", self.config.database.as_str())])
            .header("X-ClickHouse-User", &self.config.user);

        if let Some(password) = &self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        if let Some(query) = query_param {
            request = request.query(&[("query", query)]);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(TargetError::Server {
                status: status.as_u16(),
                message: text.trim().to_string(),
            });
        }
        Ok(text)
    }

    /// Flush one batch as a single `JSONEachRow` insert. Column order is the
    /// dataset mapping's; rows are already keyed by target column name.
    pub async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Map<String, Value>],
    ) -> Result<(), TargetError> {
        if rows.is_empty() {
            return Ok(());
        }

        let column_list = columns.join(", ");
        let query = format!("INSERT INTO {table} ({column_list}) FORMAT JSONEachRow");

        let mut body = String::with_capacity(rows.len() * 64);
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| TargetError::Response(format!("unserializable row: {e}")))?;
            body.push_str(&line);
            body.push('\n');
        }

        debug!(table, rows = rows.len(), "Flushing batch insert");
        self.execute_with_body(&query, body).await?;
        Ok(())
    }

    /// Current row count of a table.
    pub async fn count(&self, table: &str) -> Result<u64, TargetError> {
        let text = self.execute(&format!("SELECT count() FROM {table}")).await?;
        text.trim()
            .parse::<u64>()
            .map_err(|_| TargetError::Response(format!("non-numeric count: {text:?}")))
    }

    /// Row count for one partition-column date, as a diagnostic probe.
    pub async fn count_for_date(
        &self,
        table: &str,
        partition_column: &str,
        date: chrono::NaiveDate,
    ) -> Result<u64, TargetError> {
        let sql = format!(
            "SELECT count() FROM {table} WHERE toDate({partition_column}) = '{date}'",
            date = date.format("%Y-%m-%d")
        );
        let text = self.execute(&sql).await?;
        text.trim()
            .parse::<u64>()
            .map_err(|_| TargetError::Response(format!("non-numeric count: {text:?}")))
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, TargetError> {
        let text = self.execute(&format!("EXISTS TABLE {table}")).await?;
        Ok(text.trim() == "1")
    }

    /// Provisioned columns of a table.
    pub async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>, TargetError> {
        let text = self
            .execute(&format!("DESCRIBE TABLE {table} FORMAT JSONEachRow"))
            .await?;

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<ColumnInfo>(line)
                    .map_err(|e| TargetError::Response(format!("bad describe row: {e}")))
            })
            .collect()
    }

    /// Request the merge-on-demand compaction that collapses duplicate keys.
    pub async fn optimize(&self, table: &str) -> Result<(), TargetError> {
        self.execute(&format!("OPTIMIZE TABLE {table} FINAL")).await?;
        Ok(())
    }

    /// Destructive clear, used by full refreshes before reloading.
    pub async fn truncate(&self, table: &str) -> Result<(), TargetError> {
        self.execute(&format!("TRUNCATE TABLE {table}")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_info_parses_describe_row() {
        let line = r#"{"name":"amount","type":"Nullable(Float64)","default_type":"","default_expression":""}"#;
        let info: ColumnInfo = serde_json::from_str(line).unwrap();
        assert_eq!(info.name, "amount");
        assert_eq!(info.column_type, "Nullable(Float64)");
    }

    #[test]
    fn test_config_default() {
        let config = ClickHouseConfig::default();
        assert_eq!(config.url, "http://localhost:8123");
        assert_eq!(config.database, "default");
        assert!(config.password.is_none());
    }
}
