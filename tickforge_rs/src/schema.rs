//! Physical table schema description.
//!
//! The store is deliberately ignorant of what the columns mean; it only
//! needs names, SQL types, and which columns form the logical key. The
//! feature catalog upstream builds one of these from its column list.

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Varchar,
    Bigint,
    Double,
    Boolean,
}

impl SqlType {
    pub fn as_sql(self) -> &'static str {
        match self {
            SqlType::Varchar => "VARCHAR",
            SqlType::Bigint => "BIGINT",
            SqlType::Double => "DOUBLE",
            SqlType::Boolean => "BOOLEAN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub not_null: bool,
    /// Part of the logical row identity (symbol, ts).
    pub key: bool,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub version: u32,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn key_columns(&self) -> Vec<&'static str> {
        self.columns.iter().filter(|c| c.key).map(|c| c.name).collect()
    }

    pub fn non_key_columns(&self) -> Vec<&'static str> {
        self.columns.iter().filter(|c| !c.key).map(|c| c.name).collect()
    }

    pub fn create_table_sql(&self, table: &str) -> String {
        let body: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.not_null { " NOT NULL" } else { "" };
                format!("{} {}{null}", c.name, c.sql_type.as_sql())
            })
            .collect();
        format!("CREATE TABLE IF NOT EXISTS {table} ({})", body.join(", "))
    }

    /// Compares against the columns actually present in the database
    /// and reports drift. Extra columns in the table are tolerated;
    /// missing ones are not.
    pub fn check_against(&self, table: &str, existing: &[String]) -> Result<(), PipelineError> {
        let missing: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !existing.iter().any(|e| e == c.name))
            .map(|c| c.name.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::SchemaDrift {
                table: table.to_string(),
                missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableSchema {
        TableSchema {
            version: 1,
            columns: vec![
                ColumnDef {
                    name: "symbol",
                    sql_type: SqlType::Varchar,
                    not_null: true,
                    key: true,
                },
                ColumnDef {
                    name: "ts",
                    sql_type: SqlType::Bigint,
                    not_null: true,
                    key: true,
                },
                ColumnDef {
                    name: "close",
                    sql_type: SqlType::Double,
                    not_null: false,
                    key: false,
                },
            ],
        }
    }

    #[test]
    fn create_sql_marks_keys_not_null() {
        let sql = sample().create_table_sql("features");
        assert!(sql.contains("symbol VARCHAR NOT NULL"));
        assert!(sql.contains("ts BIGINT NOT NULL"));
        assert!(sql.contains("close DOUBLE"));
    }

    #[test]
    fn drift_reports_missing_columns_only() {
        let schema = sample();
        let ok = schema.check_against(
            "features",
            &["symbol".into(), "ts".into(), "close".into(), "extra".into()],
        );
        assert!(ok.is_ok());

        let err = schema
            .check_against("features", &["symbol".into(), "ts".into()])
            .unwrap_err();
        match err {
            PipelineError::SchemaDrift { missing, .. } => {
                assert_eq!(missing, vec!["close".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn key_and_non_key_partition_cleanly() {
        let schema = sample();
        assert_eq!(schema.key_columns(), vec!["symbol", "ts"]);
        assert_eq!(schema.non_key_columns(), vec!["close"]);
    }
}
