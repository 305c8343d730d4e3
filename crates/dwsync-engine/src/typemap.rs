//! Source-to-target type reconciliation
//!
//! Maps relational source column types to ClickHouse column types and judges
//! whether an expected type is compatible with what the target table actually
//! provisions. Mapping is total: anything unrecognized falls back to `String`,
//! which ClickHouse can always receive.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dataset::Dataset;
use crate::target::ClickHouseClient;

/// An incompatible column pair. Compatible columns are not reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeMismatch {
    pub column: String,
    pub source_type: String,
    pub expected_type: String,
    pub actual_type: String,
}

/// Outcome of pre-flight schema validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaValidation {
    pub valid: bool,
    pub mismatches: Vec<TypeMismatch>,
    /// Set when validation could not run (missing table, missing mapping,
    /// transient describe failure) and was skipped rather than failed.
    pub warning: Option<String>,
}

impl SchemaValidation {
    fn passed() -> Self {
        Self {
            valid: true,
            mismatches: Vec::new(),
            warning: None,
        }
    }

    fn skipped(warning: impl Into<String>) -> Self {
        Self {
            valid: true,
            mismatches: Vec::new(),
            warning: Some(warning.into()),
        }
    }

    /// Human-readable `column(expected→actual)` summary for failed validations.
    pub fn summary(&self) -> String {
        self.mismatches
            .iter()
            .map(|m| format!("{}({}→{})", m.column, m.expected_type, m.actual_type))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Map a source SQL type name to its ClickHouse column type.
///
/// Total over all inputs: case-insensitive, ignores precision/size suffixes
/// like `varchar(255)` or `numeric(12,2)`, and falls back to `String` for
/// anything unrecognized.
pub fn map_source_type(source_type: &str) -> &'static str {
    let normalized = normalize(source_type);

    match normalized.as_str() {
        "tinyint" | "smallint" | "int2" | "smallserial" => "Int16",
        "int" | "integer" | "int4" | "mediumint" | "serial" => "Int32",
        "bigint" | "int8" | "bigserial" | "serial8" => "Int64",
        "float" | "float4" | "float8" | "real" | "double" | "double precision" | "decimal"
        | "numeric" | "money" | "smallmoney" => "Float64",
        "text" | "varchar" | "char" | "character" | "character varying" | "bpchar" | "citext"
        | "uuid" | "enum" | "longtext" | "mediumtext" | "tinytext" => "String",
        "date" => "Date",
        "timestamp" | "timestamptz" | "timestamp with time zone"
        | "timestamp without time zone" | "datetime" | "smalldatetime" => "DateTime",
        "boolean" | "bool" | "bit" => "UInt8",
        _ => "String",
    }
}

fn normalize(source_type: &str) -> String {
    let lower = source_type.trim().to_lowercase();
    let without_precision = match lower.find('(') {
        Some(open) => {
            let close = lower[open..].find(')').map(|i| open + i + 1);
            match close {
                Some(close) => format!("{}{}", &lower[..open], &lower[close..]),
                None => lower[..open].to_string(),
            }
        }
        None => lower,
    };
    without_precision
        .trim_end_matches(" unsigned")
        .trim()
        .to_string()
}

const INTEGER_FAMILY: &[&str] = &[
    "Int8", "Int16", "Int32", "Int64", "UInt8", "UInt16", "UInt32", "UInt64",
];
const FLOAT_FAMILY: &[&str] = &["Float32", "Float64"];

/// Whether an expected target type is compatible with the actually provisioned
/// one. Exact matches and same-family width differences are compatible; an
/// actual of `String` accepts anything. Numeric families never bridge: an
/// integer expectation against a float column (or vice versa) is a mismatch.
pub fn types_compatible(expected: &str, actual: &str) -> bool {
    let actual = unwrap_modifiers(actual);
    let expected = unwrap_modifiers(expected);

    if expected == actual {
        return true;
    }
    if actual == "String" {
        return true;
    }
    if INTEGER_FAMILY.contains(&expected) && INTEGER_FAMILY.contains(&actual) {
        return true;
    }
    if FLOAT_FAMILY.contains(&expected) && FLOAT_FAMILY.contains(&actual) {
        return true;
    }
    false
}

/// Strip `Nullable(...)` and `LowCardinality(...)` wrappers from a ClickHouse
/// type name.
fn unwrap_modifiers(ch_type: &str) -> &str {
    let mut t = ch_type.trim();
    loop {
        let stripped = t
            .strip_prefix("Nullable(")
            .or_else(|| t.strip_prefix("LowCardinality("))
            .and_then(|inner| inner.strip_suffix(')'));
        match stripped {
            Some(inner) => t = inner.trim(),
            None => return t,
        }
    }
}

/// Pre-flight schema validator: compares each mapped column's expected target
/// type against the provisioned target table.
pub struct SchemaChecker {
    target: ClickHouseClient,
}

impl SchemaChecker {
    pub fn new(target: ClickHouseClient) -> Self {
        Self { target }
    }

    /// Validate the dataset's column mapping against the target table.
    ///
    /// A genuine mismatch is fatal to the job and reported with `valid =
    /// false`. A missing table, an absent mapping, or a transient failure to
    /// read the target schema only produce a warning: validation is a safety
    /// net, not a gate that may itself take down healthy pipelines.
    pub async fn validate(&self, dataset: &Dataset) -> SchemaValidation {
        if dataset.columns.is_empty() {
            return SchemaValidation::skipped(format!(
                "dataset {} has no column mapping; schema validation skipped",
                dataset.id
            ));
        }

        match self.target.table_exists(&dataset.target_table).await {
            Ok(false) => {
                return SchemaValidation::skipped(format!(
                    "target table {} does not exist yet; schema validation skipped",
                    dataset.target_table
                ));
            }
            Err(e) => {
                warn!(
                    table = %dataset.target_table,
                    error = %e,
                    "Could not probe target table existence; skipping schema validation"
                );
                return SchemaValidation::skipped(format!(
                    "could not reach target store: {e}"
                ));
            }
            Ok(true) => {}
        }

        let provisioned = match self.target.describe_table(&dataset.target_table).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!(
                    table = %dataset.target_table,
                    error = %e,
                    "Could not describe target table; skipping schema validation"
                );
                return SchemaValidation::skipped(format!(
                    "could not describe target table: {e}"
                ));
            }
        };

        let mut mismatches = Vec::new();
        for mapping in &dataset.columns {
            let expected = mapping
                .target_type_override
                .clone()
                .unwrap_or_else(|| map_source_type(&mapping.source_type).to_string());

            let actual = provisioned
                .iter()
                .find(|c| c.name == mapping.target_column)
                .map(|c| c.column_type.clone());

            match actual {
                Some(actual) if types_compatible(&expected, &actual) => {}
                Some(actual) => mismatches.push(TypeMismatch {
                    column: mapping.target_column.clone(),
                    source_type: mapping.source_type.clone(),
                    expected_type: expected,
                    actual_type: actual,
                }),
                None => mismatches.push(TypeMismatch {
                    column: mapping.target_column.clone(),
                    source_type: mapping.source_type.clone(),
                    expected_type: expected,
                    actual_type: "(absent)".to_string(),
                }),
            }
        }

        if mismatches.is_empty() {
            SchemaValidation::passed()
        } else {
            SchemaValidation {
                valid: false,
                mismatches,
                warning: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths() {
        assert_eq!(map_source_type("smallint"), "Int16");
        assert_eq!(map_source_type("int2"), "Int16");
        assert_eq!(map_source_type("integer"), "Int32");
        assert_eq!(map_source_type("int4"), "Int32");
        assert_eq!(map_source_type("serial"), "Int32");
        assert_eq!(map_source_type("bigint"), "Int64");
        assert_eq!(map_source_type("int8"), "Int64");
    }

    #[test]
    fn test_floating_and_decimal_families() {
        assert_eq!(map_source_type("real"), "Float64");
        assert_eq!(map_source_type("double precision"), "Float64");
        assert_eq!(map_source_type("numeric(12,2)"), "Float64");
        assert_eq!(map_source_type("decimal"), "Float64");
        assert_eq!(map_source_type("money"), "Float64");
    }

    #[test]
    fn test_text_and_temporal() {
        assert_eq!(map_source_type("varchar(255)"), "String");
        assert_eq!(map_source_type("character varying(64)"), "String");
        assert_eq!(map_source_type("uuid"), "String");
        assert_eq!(map_source_type("date"), "Date");
        assert_eq!(map_source_type("timestamp with time zone"), "DateTime");
        assert_eq!(map_source_type("timestamptz"), "DateTime");
        assert_eq!(map_source_type("datetime"), "DateTime");
        assert_eq!(map_source_type("boolean"), "UInt8");
        assert_eq!(map_source_type("bit(1)"), "UInt8");
    }

    #[test]
    fn test_mapping_is_total() {
        // Unknown and degenerate inputs fall back to String, never panic.
        assert_eq!(map_source_type(""), "String");
        assert_eq!(map_source_type("   "), "String");
        assert_eq!(map_source_type("geometry"), "String");
        assert_eq!(map_source_type("VARCHAR(10) CHARACTER SET utf8"), "String");
        assert_eq!(map_source_type("tsvector"), "String");
    }

    #[test]
    fn test_case_and_precision_insensitive() {
        assert_eq!(map_source_type("BIGINT"), "Int64");
        assert_eq!(map_source_type("Numeric(10)"), "Float64");
        assert_eq!(map_source_type("int unsigned"), "Int32");
    }

    #[test]
    fn test_exact_match_compatible() {
        for t in ["Int32", "Float64", "String", "Date", "DateTime", "UInt8"] {
            assert!(types_compatible(t, t), "{t} must be self-compatible");
        }
    }

    #[test]
    fn test_string_is_universal_receiver() {
        assert!(types_compatible("Int64", "String"));
        assert!(types_compatible("DateTime", "String"));
        assert!(types_compatible("Float64", "String"));
        // but not the other way around
        assert!(!types_compatible("String", "Int64"));
    }

    #[test]
    fn test_integer_widening_both_directions() {
        assert!(types_compatible("Int32", "Int64"));
        assert!(types_compatible("Int64", "Int32"));
        assert!(types_compatible("Int16", "UInt8"));
        assert!(types_compatible("UInt8", "Int64"));
    }

    #[test]
    fn test_families_do_not_bridge() {
        assert!(!types_compatible("Int32", "Float64"));
        assert!(!types_compatible("Float64", "Int64"));
        assert!(!types_compatible("Date", "DateTime"));
        assert!(!types_compatible("DateTime", "UInt8"));
    }

    #[test]
    fn test_nullable_actual_is_unwrapped() {
        assert!(types_compatible("Int32", "Nullable(Int64)"));
        assert!(types_compatible("String", "LowCardinality(String)"));
        assert!(types_compatible("Float64", "Nullable(Float32)"));
        assert!(!types_compatible("Int32", "Nullable(Float64)"));
    }

    #[test]
    fn test_summary_format() {
        let validation = SchemaValidation {
            valid: false,
            mismatches: vec![
                TypeMismatch {
                    column: "amount".into(),
                    source_type: "numeric".into(),
                    expected_type: "Float64".into(),
                    actual_type: "Int32".into(),
                },
                TypeMismatch {
                    column: "sold_at".into(),
                    source_type: "timestamptz".into(),
                    expected_type: "DateTime".into(),
                    actual_type: "Date".into(),
                },
            ],
            warning: None,
        };

        assert_eq!(
            validation.summary(),
            "amount(Float64→Int32), sold_at(DateTime→Date)"
        );
    }
}
