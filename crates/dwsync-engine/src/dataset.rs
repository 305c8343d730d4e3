//! Dataset catalog
//!
//! Read-only view of dataset definitions owned by the external catalog: where
//! rows come from, where they land, and how columns map between the two. The
//! column mapping is resolved into a typed structure once at load time; the
//! engine never probes loose field names at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use dwsync_common::SyncError;

/// One source-to-target column, with its source SQL type and an optional
/// explicit target type overriding the derived mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source_column: String,
    pub target_column: String,
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type_override: Option<String>,
}

/// A named source-to-target data flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    /// Connection URL of the source relational database.
    pub source_url: String,
    /// Source table (or subquery) rows are extracted from.
    pub source_table: String,
    /// Target table in the columnar store.
    pub target_table: String,
    /// Column bounding incremental scans, when the dataset supports them.
    pub partition_column: Option<String>,
    /// Default primary-key column for range-based scans.
    pub primary_key_column: String,
    pub columns: Vec<ColumnMapping>,
}

#[derive(sqlx::FromRow)]
struct DatasetRow {
    id: String,
    name: String,
    source_url: String,
    source_table: String,
    target_table: String,
    partition_column: Option<String>,
    primary_key_column: String,
    column_mapping: serde_json::Value,
}

/// Read-only access to the catalog's `datasets` table.
#[derive(Clone)]
pub struct DatasetCatalog {
    pool: PgPool,
}

impl DatasetCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load a dataset by id, resolving its column mapping.
    pub async fn load(&self, dataset_id: &str) -> Result<Dataset> {
        let row = sqlx::query_as::<_, DatasetRow>(
            r#"
            SELECT id, name, source_url, source_table, target_table,
                   partition_column, primary_key_column, column_mapping
            FROM datasets
            WHERE id = $1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query dataset catalog")?
        .ok_or_else(|| SyncError::DatasetNotFound(dataset_id.to_string()))?;

        let columns: Vec<ColumnMapping> = serde_json::from_value(row.column_mapping)
            .with_context(|| format!("Malformed column mapping for dataset {dataset_id}"))?;

        Ok(Dataset {
            id: row.id,
            name: row.name,
            source_url: row.source_url,
            source_table: row.source_table,
            target_table: row.target_table,
            partition_column: row.partition_column,
            primary_key_column: row.primary_key_column,
            columns,
        })
    }

    /// List known dataset ids, for the CLI.
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM datasets ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list datasets")?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_dataset() -> Dataset {
        Dataset {
            id: "sales".to_string(),
            name: "Sales facts".to_string(),
            source_url: "postgres://localhost/shop".to_string(),
            source_table: "public.sales".to_string(),
            target_table: "analytics.sales".to_string(),
            partition_column: Some("sold_at".to_string()),
            primary_key_column: "id".to_string(),
            columns: vec![
                ColumnMapping {
                    source_column: "id".into(),
                    target_column: "id".into(),
                    source_type: "bigint".into(),
                    target_type_override: None,
                },
                ColumnMapping {
                    source_column: "store_code".into(),
                    target_column: "store".into(),
                    source_type: "varchar(16)".into(),
                    target_type_override: None,
                },
                ColumnMapping {
                    source_column: "amount".into(),
                    target_column: "amount".into(),
                    source_type: "numeric(12,2)".into(),
                    target_type_override: Some("Float64".into()),
                },
            ],
        }
    }

    #[test]
    fn test_sample_mapping_is_ordered() {
        let dataset = sample_dataset();
        let sources: Vec<_> = dataset.columns.iter().map(|c| c.source_column.as_str()).collect();
        assert_eq!(sources, vec!["id", "store_code", "amount"]);
    }

    #[test]
    fn test_column_mapping_deserializes_without_override() {
        let json = serde_json::json!([
            {"source_column": "id", "target_column": "id", "source_type": "bigint"}
        ]);
        let columns: Vec<ColumnMapping> = serde_json::from_value(json).unwrap();
        assert_eq!(columns.len(), 1);
        assert!(columns[0].target_type_override.is_none());
    }
}
