//! Command-line surface.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tickforge_rs::config::{PipelineConfig, StoreConfig, SymbolSpec};

#[derive(Debug, Parser)]
#[command(name = "tickforge", version, about = "OHLCV feature pipeline")]
pub struct Cli {
    /// Disable the log file next to the database.
    #[arg(long, global = true)]
    pub no_file_log: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compute features for the universe and merge them into the store.
    Run(RunArgs),
    /// Report coverage gaps without writing anything.
    Gaps(RunArgs),
    /// Collapse duplicate (symbol, ts) rows left by older writers.
    Dedup(DedupArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Directory of per-symbol CSV files, <SYMBOL>.csv.
    #[arg(long)]
    pub input_dir: PathBuf,

    /// DuckDB database file.
    #[arg(long)]
    pub db: PathBuf,

    /// Universe CSV: symbol,asset_class[,sector[,exchange]].
    #[arg(long)]
    pub universe: PathBuf,

    /// Parallel compute workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Inclusive start of the bar window, YYYY-MM-DD.
    #[arg(long)]
    pub date_start: Option<String>,

    /// Inclusive end of the bar window, YYYY-MM-DD.
    #[arg(long)]
    pub date_end: Option<String>,

    /// Forward displacement of the Ichimoku cloud, in bars.
    #[arg(long, default_value_t = 26)]
    pub ichimoku_shift: usize,

    /// Bars on each side a pivot must dominate.
    #[arg(long, default_value_t = 5)]
    pub pivot_window: usize,

    /// Extra exchange holiday, YYYY-MM-DD. Repeatable.
    #[arg(long = "holiday")]
    pub holidays: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DedupArgs {
    /// DuckDB database file.
    #[arg(long)]
    pub db: PathBuf,
}

impl RunArgs {
    pub fn into_config(self) -> Result<PipelineConfig> {
        let date_start = parse_optional_date(self.date_start.as_deref())?;
        let date_end = parse_optional_date(self.date_end.as_deref())?;
        if let (Some(start), Some(end)) = (date_start, date_end) {
            if start > end {
                bail!("--date-start {start} is after --date-end {end}");
            }
        }
        if self.pivot_window == 0 {
            bail!("--pivot-window must be at least 1");
        }

        let mut config = PipelineConfig::new(self.input_dir, StoreConfig::new(self.db));
        config.universe = load_universe(&self.universe)?;
        if config.universe.is_empty() {
            bail!("universe file {} lists no symbols", self.universe.display());
        }
        if let Some(workers) = self.workers {
            config.n_workers = workers.max(1);
        }
        config.date_start = date_start;
        config.date_end = date_end;
        config.ichimoku_shift = self.ichimoku_shift;
        config.pivot_window = self.pivot_window;
        config.extra_holidays = self
            .holidays
            .iter()
            .map(|raw| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .with_context(|| format!("bad --holiday '{raw}'"))
            })
            .collect::<Result<_>>()?;
        Ok(config)
    }
}

fn parse_optional_date(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("bad date '{s}', expected YYYY-MM-DD"))
    })
    .transpose()
}

/// Universe CSV: one symbol per line, `symbol,asset_class` with
/// optional sector and exchange. A header line is tolerated.
fn load_universe(path: &std::path::Path) -> Result<Vec<SymbolSpec>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read universe file {}", path.display()))?;
    let mut specs = Vec::new();
    for (lineno, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (lineno == 0 && line.to_ascii_lowercase().starts_with("symbol")) {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            bail!("universe line {} needs symbol,asset_class: '{line}'", lineno + 1);
        }
        let spec = SymbolSpec {
            symbol: fields[0].to_string(),
            asset_class: fields[1]
                .parse()
                .map_err(|e| anyhow!("universe line {}: {e}", lineno + 1))?,
            sector: fields.get(2).filter(|s| !s.is_empty()).map(|s| s.to_string()),
            exchange: fields.get(3).filter(|s| !s.is_empty()).map(|s| s.to_string()),
        };
        specs.push(spec);
    }
    Ok(specs)
}
