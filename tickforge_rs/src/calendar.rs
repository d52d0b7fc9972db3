//! Trading calendars and gap planning.
//!
//! A calendar answers one question: is this date an expected session
//! for the instrument? Session-bound classes (equities, ETFs, ...)
//! trade Monday through Friday minus exchange holidays; crypto trades
//! every day. The gap planner diffs expected sessions against what the
//! source delivered and what the store already holds, producing a
//! backfill plan per symbol.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Etf,
    Crypto,
    Forex,
    Index,
    Commodity,
}

impl AssetClass {
    /// Crypto venues have no closing bell; everything else follows an
    /// exchange session schedule.
    pub fn trades_continuously(self) -> bool {
        matches!(self, AssetClass::Crypto)
    }
}

impl std::str::FromStr for AssetClass {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "equity" | "stock" => Ok(AssetClass::Equity),
            "etf" => Ok(AssetClass::Etf),
            "crypto" => Ok(AssetClass::Crypto),
            "forex" | "fx" => Ok(AssetClass::Forex),
            "index" => Ok(AssetClass::Index),
            "commodity" => Ok(AssetClass::Commodity),
            other => Err(anyhow::anyhow!("unknown asset class '{other}'")),
        }
    }
}

/// Expected-session calendar for one instrument.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    continuous: bool,
    holidays: BTreeSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn for_asset_class(class: AssetClass, extra_holidays: &[NaiveDate]) -> Self {
        let mut holidays = BTreeSet::new();
        if !class.trades_continuously() {
            holidays.extend(builtin_us_holidays());
            holidays.extend(extra_holidays.iter().copied());
        }
        MarketCalendar {
            continuous: class.trades_continuously(),
            holidays,
        }
    }

    pub fn is_session(&self, date: NaiveDate) -> bool {
        if self.continuous {
            return true;
        }
        let weekday = date.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return false;
        }
        !self.holidays.contains(&date)
    }

    /// All expected sessions in the closed range `[start, end]`.
    pub fn sessions_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut sessions = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            if self.is_session(cursor) {
                sessions.push(cursor);
            }
            match cursor.checked_add_days(Days::new(1)) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        sessions
    }
}

/// Fixed-date US exchange holidays for the years the pipeline is
/// expected to see. Floating holidays (Thanksgiving, Easter) come in
/// through the per-run extra_holidays list.
fn builtin_us_holidays() -> Vec<NaiveDate> {
    let mut days = Vec::new();
    for year in 2015..=2035 {
        for (month, day) in [(1u32, 1u32), (7, 4), (12, 25)] {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                if date.weekday() != Weekday::Sat && date.weekday() != Weekday::Sun {
                    days.push(date);
                }
            }
        }
    }
    days
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerState {
    Idle,
    Scanning,
    Planning,
    Dispatched,
}

/// Backfill plan for one symbol.
#[derive(Debug, Clone)]
pub struct GapReport {
    pub symbol: String,
    /// Dates the source delivered but the store does not hold yet.
    pub missing_from_store: Vec<NaiveDate>,
    /// Expected sessions inside the source's own date range that the
    /// source never delivered. These need an upstream re-fetch, not a
    /// recompute.
    pub missing_from_source: Vec<NaiveDate>,
}

impl GapReport {
    pub fn is_clean(&self) -> bool {
        self.missing_from_store.is_empty() && self.missing_from_source.is_empty()
    }
}

/// Walks Idle -> Scanning -> Planning -> Dispatched for each symbol it
/// plans, returning to Idle when the report is handed off.
#[derive(Debug)]
pub struct GapPlanner {
    state: PlannerState,
}

impl Default for GapPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl GapPlanner {
    pub fn new() -> Self {
        GapPlanner {
            state: PlannerState::Idle,
        }
    }

    pub fn state(&self) -> PlannerState {
        self.state
    }

    /// `window_start`/`window_end` bound the sessions the source is
    /// expected to cover; either side defaults to the source's own
    /// first/last date. Passing an explicit end past the last delivered
    /// bar is what makes a stalled feed visible: every expected session
    /// after the final bar is reported as missing from the source.
    pub fn plan(
        &mut self,
        symbol: &str,
        calendar: &MarketCalendar,
        source_dates: &[NaiveDate],
        store_dates: &[NaiveDate],
        window_start: Option<NaiveDate>,
        window_end: Option<NaiveDate>,
    ) -> GapReport {
        self.state = PlannerState::Scanning;

        let source: BTreeSet<NaiveDate> = source_dates.iter().copied().collect();
        let stored: BTreeSet<NaiveDate> = store_dates.iter().copied().collect();

        self.state = PlannerState::Planning;

        let missing_from_store: Vec<NaiveDate> =
            source.difference(&stored).copied().collect();

        let start = window_start.or_else(|| source.first().copied());
        let end = window_end.or_else(|| source.last().copied());
        let missing_from_source = match (start, end) {
            (Some(first), Some(last)) => calendar
                .sessions_between(first, last)
                .into_iter()
                .filter(|d| !source.contains(d))
                .collect(),
            _ => {
                warn!(symbol, "no source dates and no expected window, skipping session scan");
                Vec::new()
            }
        };

        self.state = PlannerState::Dispatched;
        let report = GapReport {
            symbol: symbol.to_string(),
            missing_from_store,
            missing_from_source,
        };
        self.state = PlannerState::Idle;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn equities_skip_weekends_and_holidays() {
        let cal = MarketCalendar::for_asset_class(AssetClass::Equity, &[]);
        // 2024-01-05 is a Friday, 2024-01-06 a Saturday.
        assert!(cal.is_session(d(2024, 1, 5)));
        assert!(!cal.is_session(d(2024, 1, 6)));
        assert!(!cal.is_session(d(2024, 1, 7)));
        // New Year's Day 2024 falls on a Monday.
        assert!(!cal.is_session(d(2024, 1, 1)));
    }

    #[test]
    fn crypto_trades_every_day() {
        let cal = MarketCalendar::for_asset_class(AssetClass::Crypto, &[]);
        assert!(cal.is_session(d(2024, 1, 6)));
        assert!(cal.is_session(d(2024, 12, 25)));
    }

    #[test]
    fn extra_holidays_are_respected() {
        let good_friday = d(2024, 3, 29);
        let cal = MarketCalendar::for_asset_class(AssetClass::Equity, &[good_friday]);
        assert!(!cal.is_session(good_friday));
    }

    #[test]
    fn planner_flags_both_gap_kinds() {
        // Mon/Tue/Thu delivered by the source, Mon/Tue already stored.
        // Wednesday is a session the source never produced; Thursday is
        // delivered but not yet merged.
        let mon = d(2024, 1, 8);
        let tue = d(2024, 1, 9);
        let wed = d(2024, 1, 10);
        let thu = d(2024, 1, 11);

        let cal = MarketCalendar::for_asset_class(AssetClass::Equity, &[]);
        let mut planner = GapPlanner::new();
        let report = planner.plan("AAPL", &cal, &[mon, tue, thu], &[mon, tue], None, None);

        assert_eq!(report.missing_from_store, vec![thu]);
        assert_eq!(report.missing_from_source, vec![wed]);
        assert_eq!(planner.state(), PlannerState::Idle);
    }

    #[test]
    fn planner_reports_trailing_sessions_up_to_the_window_end() {
        // Five expected weekday sessions but the feed delivered only
        // Mon, Tue and Thu, then went quiet. The interior gap and the
        // trailing gap must both be reported.
        let mon = d(2024, 1, 8);
        let tue = d(2024, 1, 9);
        let wed = d(2024, 1, 10);
        let thu = d(2024, 1, 11);
        let fri = d(2024, 1, 12);

        let cal = MarketCalendar::for_asset_class(AssetClass::Equity, &[]);
        let mut planner = GapPlanner::new();
        let report = planner.plan("AAPL", &cal, &[mon, tue, thu], &[], None, Some(fri));

        assert_eq!(report.missing_from_source, vec![wed, fri]);
        assert_eq!(report.missing_from_store, vec![mon, tue, thu]);
    }

    #[test]
    fn planner_with_empty_source_scans_an_explicit_window() {
        let cal = MarketCalendar::for_asset_class(AssetClass::Equity, &[]);
        let mut planner = GapPlanner::new();

        let report = planner.plan("EMPTY", &cal, &[], &[], None, None);
        assert!(report.is_clean());

        // With an expected window, an empty source is all gap.
        let report = planner.plan(
            "EMPTY",
            &cal,
            &[],
            &[],
            Some(d(2024, 1, 8)),
            Some(d(2024, 1, 9)),
        );
        assert_eq!(
            report.missing_from_source,
            vec![d(2024, 1, 8), d(2024, 1, 9)]
        );
    }

    #[test]
    fn sessions_between_is_inclusive() {
        let cal = MarketCalendar::for_asset_class(AssetClass::Crypto, &[]);
        let days = cal.sessions_between(d(2024, 2, 1), d(2024, 2, 3));
        assert_eq!(days.len(), 3);
    }
}
