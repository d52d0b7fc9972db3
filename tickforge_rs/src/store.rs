//! DuckDB-backed analytical feature store.
//!
//! Writes go through a staging-then-merge protocol so that re-running a
//! batch is idempotent: the incoming frame is spilled to Parquet,
//! loaded into a uniquely-named staging table, matched rows in the
//! target are superseded wholesale, and only rows with unseen
//! (symbol, ts) keys are inserted. The staging table is dropped on
//! every exit path by a guard.
//!
//! One store instance owns one connection. Merges for the same symbol
//! must be serialized by the caller; the batch orchestrator applies all
//! merges sequentially.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use duckdb::{params, Connection};
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::PipelineError;
use crate::schema::TableSchema;

/// Row counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Existing rows superseded in place.
    pub updated: usize,
    /// Rows with previously unseen (symbol, ts) keys.
    pub inserted: usize,
}

impl MergeOutcome {
    pub fn rows_written(&self) -> usize {
        self.updated + self.inserted
    }
}

#[derive(Debug)]
pub struct FeatureStore {
    conn: Connection,
    config: StoreConfig,
    schema: TableSchema,
    staging_seq: AtomicU64,
}

/// Drops the staging table when the merge scope exits, success or not.
struct StagingGuard<'a> {
    conn: &'a Connection,
    table: String,
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        let sql = format!("DROP TABLE IF EXISTS {}", self.table);
        if let Err(err) = self.conn.execute(&sql, []) {
            warn!(table = %self.table, error = %err, "failed to drop staging table");
        }
    }
}

impl FeatureStore {
    /// Opens (or creates) the database, materializes the features table
    /// from the schema if absent, and verifies no column has drifted
    /// away. Drift is fatal: nothing may be written to a table that no
    /// longer matches the compiled-in catalog.
    pub fn open(config: StoreConfig, schema: TableSchema) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&config.db_path).with_context(|| {
            format!("failed to open feature store at {}", config.db_path.display())
        })?;

        conn.execute_batch(&format!(
            "{};\n\
             CREATE INDEX IF NOT EXISTS idx_{}_key ON {} (symbol, ts);\n\
             CREATE TABLE IF NOT EXISTS merge_log (\n\
                 symbol VARCHAR NOT NULL,\n\
                 source_hash VARCHAR NOT NULL,\n\
                 rows_written BIGINT NOT NULL,\n\
                 merged_at BIGINT NOT NULL,\n\
                 PRIMARY KEY (symbol, source_hash)\n\
             );",
            schema.create_table_sql(&config.table_name),
            config.table_name,
            config.table_name,
        ))
        .context("failed to initialize feature store tables")?;

        let store = FeatureStore {
            conn,
            config,
            schema,
            staging_seq: AtomicU64::new(0),
        };
        store.verify_schema()?;
        info!(
            db = %store.config.db_path.display(),
            table = %store.config.table_name,
            schema_version = store.schema.version,
            "feature store opened"
        );
        Ok(store)
    }

    fn verify_schema(&self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT name FROM pragma_table_info('{}')",
                self.config.table_name
            ))
            .context("failed to inspect table schema")?;
        let existing: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        self.schema
            .check_against(&self.config.table_name, &existing)
            .map_err(|e| anyhow!(e))
    }

    /// Merges one composed frame. Re-merging an identical frame leaves
    /// the table contents unchanged apart from superseded copies of the
    /// same rows.
    pub fn merge_frame(&self, df: &mut DataFrame, symbol: &str) -> Result<MergeOutcome> {
        if df.height() == 0 {
            debug!(symbol, "empty frame, nothing to merge");
            return Ok(MergeOutcome::default());
        }
        self.check_frame_columns(df, symbol)?;

        let spill = tempfile::Builder::new()
            .prefix("tickforge-stage-")
            .suffix(".parquet")
            .tempfile()
            .context("failed to create staging spill file")?;
        ParquetWriter::new(spill.as_file())
            .with_compression(ParquetCompression::Zstd(None))
            .finish(df)
            .context("failed to spill frame to parquet")?;

        let staging = format!(
            "stage_{}_{}_{}",
            sanitize_identifier(symbol),
            std::process::id(),
            self.staging_seq.fetch_add(1, Ordering::Relaxed)
        );
        if self.table_exists(&staging)? {
            return Err(anyhow!(PipelineError::MergeConflict {
                symbol: symbol.to_string(),
                reason: format!("staging table {staging} already exists"),
            }));
        }

        let spill_path = escape_sql_literal(&spill.path().to_string_lossy());
        // Duplicate keys inside a single batch collapse to the freshest
        // computed_at before touching the target.
        self.conn
            .execute(
                &format!(
                    "CREATE TABLE {staging} AS \
                     SELECT * FROM read_parquet('{spill_path}') \
                     QUALIFY row_number() OVER (\
                         PARTITION BY symbol, ts ORDER BY computed_at DESC\
                     ) = 1"
                ),
                [],
            )
            .with_context(|| format!("failed to load staging table {staging}"))?;
        let guard = StagingGuard {
            conn: &self.conn,
            table: staging.clone(),
        };

        let target = &self.config.table_name;
        let set_clause: Vec<String> = self
            .schema
            .non_key_columns()
            .iter()
            .map(|c| format!("{c} = s.{c}"))
            .collect();
        let updated = self
            .conn
            .execute(
                &format!(
                    "UPDATE {target} SET {} FROM {staging} s \
                     WHERE {target}.symbol = s.symbol AND {target}.ts = s.ts",
                    set_clause.join(", ")
                ),
                [],
            )
            .with_context(|| format!("failed to supersede rows for {symbol}"))?;

        let columns = self.schema.column_names();
        let select_cols: Vec<String> = columns.iter().map(|c| format!("s.{c}")).collect();
        let order_by = self.insert_order_clause();
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO {target} ({}) \
                     SELECT {} FROM {staging} s \
                     ANTI JOIN {target} t ON s.symbol = t.symbol AND s.ts = t.ts \
                     ORDER BY {order_by}",
                    columns.join(", "),
                    select_cols.join(", "),
                ),
                [],
            )
            .with_context(|| format!("failed to insert new rows for {symbol}"))?;

        drop(guard);
        info!(symbol, updated, inserted, "merged frame into feature store");
        Ok(MergeOutcome { updated, inserted })
    }

    /// Records that a source file (identified by content hash) was
    /// merged, so unchanged inputs can be recognized across runs.
    pub fn record_merge(&self, symbol: &str, source_hash: &str, rows: usize) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO merge_log (symbol, source_hash, rows_written, merged_at) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT (symbol, source_hash) DO UPDATE SET \
                     rows_written = excluded.rows_written, \
                     merged_at = excluded.merged_at",
                params![
                    symbol,
                    source_hash,
                    rows as i64,
                    Utc::now().timestamp_millis()
                ],
            )
            .context("failed to record merge")?;
        Ok(())
    }

    /// Collapses duplicate (symbol, ts) rows left behind by older
    /// writers, keeping the row with the greatest computed_at. Returns
    /// the number of rows removed.
    pub fn dedup_legacy(&self) -> Result<usize> {
        let target = &self.config.table_name;
        let before = self.row_count()?;
        let order_by = self.insert_order_clause_bare();
        self.conn
            .execute_batch(&format!(
                "CREATE TEMP TABLE dedup_keep AS \
                     SELECT * FROM {target} \
                     QUALIFY row_number() OVER (\
                         PARTITION BY symbol, ts ORDER BY computed_at DESC\
                     ) = 1;\n\
                 DELETE FROM {target};\n\
                 INSERT INTO {target} SELECT * FROM dedup_keep ORDER BY {order_by};\n\
                 DROP TABLE dedup_keep;"
            ))
            .context("failed to deduplicate legacy rows")?;
        let after = self.row_count()?;
        let removed = before.saturating_sub(after);
        if removed > 0 {
            info!(removed, "removed duplicate legacy rows");
        }
        Ok(removed)
    }

    /// Distinct calendar dates present for a symbol, ascending. This is
    /// the coverage ledger the gap planner diffs against.
    pub fn coverage_dates(&self, symbol: &str) -> Result<Vec<NaiveDate>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT strftime(epoch_ms(ts), '%Y-%m-%d') AS day \
             FROM {} WHERE symbol = ? ORDER BY day",
            self.config.table_name
        ))?;
        let days: Vec<String> = stmt
            .query_map(params![symbol], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        days.iter()
            .map(|d| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .with_context(|| format!("bad coverage date '{d}'"))
            })
            .collect()
    }

    pub fn row_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {}", self.config.table_name),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn distinct_key_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT count(*) FROM (SELECT DISTINCT symbol, ts FROM {})",
                self.config.table_name
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// One float column for one symbol, ordered by ts. Test probe.
    pub fn select_floats(&self, column: &str, symbol: &str) -> Result<Vec<Option<f64>>> {
        if !self.schema.column_names().contains(&column) {
            return Err(anyhow!("unknown column '{column}'"));
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {column} FROM {} WHERE symbol = ? ORDER BY ts",
            self.config.table_name
        ))?;
        let values: Vec<Option<f64>> = stmt
            .query_map(params![symbol], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(values)
    }

    fn check_frame_columns(&self, df: &DataFrame, symbol: &str) -> Result<()> {
        let frame_cols = df.get_column_names();
        let missing: Vec<&str> = self
            .schema
            .column_names()
            .into_iter()
            .filter(|c| !frame_cols.contains(c))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(PipelineError::Computation {
                symbol: symbol.to_string(),
                reason: format!("frame missing columns {missing:?}"),
            }))
        }
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn insert_order_clause(&self) -> String {
        let mut cols = vec![self.config.partition_column.clone()];
        cols.extend(self.config.cluster_columns.iter().cloned());
        cols.iter()
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn insert_order_clause_bare(&self) -> String {
        let mut cols = vec![self.config.partition_column.clone()];
        cols.extend(self.config.cluster_columns.iter().cloned());
        cols.join(", ")
    }
}

fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn escape_sql_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}

/// Streaming sha256 of a source file, prefixed so hashes of different
/// inputs can never collide with hashes of other byte streams.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"bars:");
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} for fingerprinting", path.display()))?;
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read {} for fingerprinting", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, SqlType};

    fn tiny_schema() -> TableSchema {
        TableSchema {
            version: 1,
            columns: vec![
                ColumnDef { name: "symbol", sql_type: SqlType::Varchar, not_null: true, key: true },
                ColumnDef { name: "ts", sql_type: SqlType::Bigint, not_null: true, key: true },
                ColumnDef { name: "month_bucket", sql_type: SqlType::Varchar, not_null: true, key: false },
                ColumnDef { name: "computed_at", sql_type: SqlType::Bigint, not_null: true, key: false },
                ColumnDef { name: "close", sql_type: SqlType::Double, not_null: false, key: false },
            ],
        }
    }

    fn frame(symbol: &str, ts: &[i64], close: &[f64], computed_at: i64) -> DataFrame {
        let buckets: Vec<String> = ts.iter().map(|_| "2024-01".to_string()).collect();
        DataFrame::new(vec![
            Series::new("symbol", vec![symbol; ts.len()]),
            Series::new("ts", ts.to_vec()),
            Series::new("month_bucket", buckets),
            Series::new("computed_at", vec![computed_at; ts.len()]),
            Series::new("close", close.to_vec()),
        ])
        .unwrap()
    }

    fn open_store(dir: &tempfile::TempDir) -> FeatureStore {
        let config = StoreConfig::new(dir.path().join("store.duckdb"));
        FeatureStore::open(config, tiny_schema()).unwrap()
    }

    #[test]
    fn merge_inserts_then_supersedes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut first = frame("AAPL", &[1000, 2000], &[10.0, 11.0], 1);
        let outcome = store.merge_frame(&mut first, "AAPL").unwrap();
        assert_eq!(outcome, MergeOutcome { updated: 0, inserted: 2 });

        // Overlapping batch: one key already present, one new.
        let mut second = frame("AAPL", &[2000, 3000], &[99.0, 12.0], 2);
        let outcome = store.merge_frame(&mut second, "AAPL").unwrap();
        assert_eq!(outcome, MergeOutcome { updated: 1, inserted: 1 });

        assert_eq!(store.row_count().unwrap(), 3);
        assert_eq!(store.distinct_key_count().unwrap(), 3);
        // The overlapping row carries the superseding value.
        let closes = store.select_floats("close", "AAPL").unwrap();
        assert_eq!(closes, vec![Some(10.0), Some(99.0), Some(12.0)]);
    }

    #[test]
    fn remerging_the_same_batch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut batch = frame("MSFT", &[1000, 2000, 3000], &[1.0, 2.0, 3.0], 7);
        store.merge_frame(&mut batch.clone(), "MSFT").unwrap();
        let outcome = store.merge_frame(&mut batch, "MSFT").unwrap();

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 3);
        assert_eq!(store.row_count().unwrap(), 3);
        assert_eq!(
            store.select_floats("close", "MSFT").unwrap(),
            vec![Some(1.0), Some(2.0), Some(3.0)]
        );
    }

    #[test]
    fn duplicate_keys_within_a_batch_collapse_to_freshest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut df = DataFrame::new(vec![
            Series::new("symbol", vec!["NVDA", "NVDA"]),
            Series::new("ts", vec![1000i64, 1000]),
            Series::new("month_bucket", vec!["2024-01", "2024-01"]),
            Series::new("computed_at", vec![1i64, 2]),
            Series::new("close", vec![5.0, 6.0]),
        ])
        .unwrap();
        let outcome = store.merge_frame(&mut df, "NVDA").unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(
            store.select_floats("close", "NVDA").unwrap(),
            vec![Some(6.0)]
        );
    }

    #[test]
    fn empty_frame_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut df = frame("AAPL", &[], &[], 1);
        let outcome = store.merge_frame(&mut df, "AAPL").unwrap();
        assert_eq!(outcome, MergeOutcome::default());
    }

    #[test]
    fn dedup_legacy_keeps_freshest_computed_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // Simulate an older writer that appended without dedup.
        store
            .conn
            .execute_batch(
                "INSERT INTO features VALUES ('AAPL', 1000, '2024-01', 1, 10.0);\n\
                 INSERT INTO features VALUES ('AAPL', 1000, '2024-01', 2, 20.0);\n\
                 INSERT INTO features VALUES ('AAPL', 2000, '2024-01', 1, 30.0);",
            )
            .unwrap();

        let removed = store.dedup_legacy().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.row_count().unwrap(), 2);
        assert_eq!(
            store.select_floats("close", "AAPL").unwrap(),
            vec![Some(20.0), Some(30.0)]
        );
    }

    #[test]
    fn coverage_dates_are_distinct_days() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // Two bars on Jan 2 (different times), one on Jan 3.
        let jan2_morning = 1_704_186_000_000i64;
        let jan2_noon = 1_704_196_800_000i64;
        let jan3 = 1_704_272_400_000i64;
        let mut df = frame("AAPL", &[jan2_morning, jan2_noon, jan3], &[1.0, 2.0, 3.0], 1);
        store.merge_frame(&mut df, "AAPL").unwrap();

        let dates = store.coverage_dates("AAPL").unwrap();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()
            ]
        );
    }

    #[test]
    fn drift_is_detected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("store.duckdb"));
        {
            let store = FeatureStore::open(config.clone(), tiny_schema()).unwrap();
            drop(store);
        }
        // Grow the schema: the existing table is now missing a column.
        let mut grown = tiny_schema();
        grown.columns.push(ColumnDef {
            name: "rsi_14",
            sql_type: SqlType::Double,
            not_null: false,
            key: false,
        });
        let err = FeatureStore::open(config, grown).unwrap_err();
        let drift = err.downcast_ref::<PipelineError>().unwrap();
        assert!(drift.is_fatal());
    }

    #[test]
    fn merge_log_upserts_on_repeat_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.record_merge("AAPL", "abc123", 10).unwrap();
        store.record_merge("AAPL", "abc123", 12).unwrap();
        let rows: i64 = store
            .conn
            .query_row("SELECT count(*) FROM merge_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "one").unwrap();
        std::fs::write(&b, "two").unwrap();
        assert_eq!(fingerprint_file(&a).unwrap(), fingerprint_file(&a).unwrap());
        assert_ne!(fingerprint_file(&a).unwrap(), fingerprint_file(&b).unwrap());
    }
}
