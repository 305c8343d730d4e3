//! Post-load consistency validation
//!
//! Best-effort audit run after every load: trigger the target's duplicate
//! merge, then reconcile the post-merge row count against what the pipeline
//! extracted, under a 1% tolerance band. This never gates a job, since
//! concurrent source writes make small divergence normal, and infrastructure failures
//! degrade to an explanatory result instead of an error.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::target::ClickHouseClient;

/// Outcome of row-count reconciliation, attached to the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataValidationResult {
    pub source_count: u64,
    pub target_count: u64,
    pub is_consistent: bool,
    pub duplicate_count: u64,
    pub message: String,
}

/// Whether target and source counts agree within the 1% band:
/// `|target − source| ≤ ceil(source · 0.01)`.
pub fn within_tolerance(source_count: u64, target_count: u64) -> bool {
    let tolerance = ((source_count as f64) * 0.01).ceil() as u64;
    target_count.abs_diff(source_count) <= tolerance
}

/// Runs the post-load audit against the target store.
#[derive(Clone)]
pub struct ConsistencyValidator {
    target: ClickHouseClient,
}

impl ConsistencyValidator {
    pub fn new(target: ClickHouseClient) -> Self {
        Self { target }
    }

    /// Reconcile the target table against the extracted row count.
    ///
    /// Never returns an error: a target store that cannot be counted yields
    /// `is_consistent = false` with the cause in the message.
    pub async fn reconcile(
        &self,
        dataset: &Dataset,
        expected_rows: u64,
    ) -> DataValidationResult {
        let table = &dataset.target_table;

        let before = match self.target.count(table).await {
            Ok(count) => count,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not count target table");
                return DataValidationResult {
                    source_count: expected_rows,
                    target_count: 0,
                    is_consistent: false,
                    duplicate_count: 0,
                    message: format!("could not read target row count: {e}"),
                };
            }
        };

        let (duplicate_count, target_count) = self.merge_and_recount(table, before).await;

        let is_consistent = within_tolerance(expected_rows, target_count);
        let message = if is_consistent {
            format!(
                "target has {target_count} rows for {expected_rows} extracted \
                 ({duplicate_count} duplicates merged); within 1% tolerance"
            )
        } else {
            format!(
                "target has {target_count} rows but {expected_rows} were extracted \
                 ({duplicate_count} duplicates merged); outside 1% tolerance"
            )
        };

        info!(
            dataset_id = %dataset.id,
            expected_rows,
            target_count,
            duplicate_count,
            is_consistent,
            "Reconciliation finished"
        );

        DataValidationResult {
            source_count: expected_rows,
            target_count,
            is_consistent,
            duplicate_count,
            message,
        }
    }

    /// Request a duplicate merge and report how many rows it removed.
    /// A merge failure is non-critical: logged, reported as 0 removed.
    pub async fn merge_duplicates(&self, table: &str) -> u64 {
        let before = match self.target.count(table).await {
            Ok(count) => count,
            Err(e) => {
                warn!(table, error = %e, "Could not count table before merge");
                return 0;
            }
        };
        self.merge_and_recount(table, before).await.0
    }

    async fn merge_and_recount(&self, table: &str, before: u64) -> (u64, u64) {
        if let Err(e) = self.target.optimize(table).await {
            warn!(table, error = %e, "Duplicate merge failed; continuing without it");
            return (0, before);
        }

        match self.target.count(table).await {
            Ok(after) => (before.saturating_sub(after), after),
            Err(e) => {
                warn!(table, error = %e, "Could not count table after merge");
                (0, before)
            }
        }
    }

    /// Diagnostic probe: how many rows landed for one partition-column date.
    /// Used by operators to spot repeated same-day loads; returns 0 on any
    /// failure rather than propagating.
    pub async fn count_for_partition_date(
        &self,
        table: &str,
        partition_column: &str,
        date: NaiveDate,
    ) -> u64 {
        match self
            .target
            .count_for_date(table, partition_column, date)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(table, partition_column, %date, error = %e, "Partition probe failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_boundary() {
        // ceil(1000 * 0.01) = 10
        assert!(within_tolerance(1000, 1009));
        assert!(within_tolerance(1000, 1010));
        assert!(!within_tolerance(1000, 1011));
        assert!(within_tolerance(1000, 990));
        assert!(!within_tolerance(1000, 989));
    }

    #[test]
    fn test_tolerance_exact_match() {
        assert!(within_tolerance(0, 0));
        assert!(within_tolerance(1, 1));
        assert!(within_tolerance(1_000_000, 1_000_000));
    }

    #[test]
    fn test_tolerance_small_counts() {
        // ceil(1 * 0.01) = 1: a single-row dataset tolerates one row of drift.
        assert!(within_tolerance(1, 0));
        assert!(within_tolerance(1, 2));
        assert!(!within_tolerance(1, 3));
        // Zero expected rows tolerates nothing.
        assert!(!within_tolerance(0, 1));
    }

    #[test]
    fn test_tolerance_is_symmetric_around_source() {
        assert!(within_tolerance(200, 198));
        assert!(within_tolerance(200, 202));
        assert!(!within_tolerance(200, 197));
        assert!(!within_tolerance(200, 203));
    }
}
