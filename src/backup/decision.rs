//! The backup decision engine.
//!
//! Pure date arithmetic deciding, per target, whether a full backup, an
//! incremental backup, or nothing is due. Deterministic for identical
//! inputs; no clock access, no shared state.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use derive_more::Display;

/// What kind of backup the external tool should be asked for. Displays as
/// the tool's subcommand name.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum BackupKind {
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
}

/// Outcome of the decision rules for one target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupDecision {
    Full,
    Incremental,
    Skip,
}

impl BackupDecision {
    pub fn kind(&self) -> Option<BackupKind> {
        match self {
            BackupDecision::Full => Some(BackupKind::Full),
            BackupDecision::Incremental => Some(BackupKind::Incremental),
            BackupDecision::Skip => None,
        }
    }
}

/// Stand-in for "never backed up": far enough in the past that any
/// configured interval has long expired.
fn far_past() -> NaiveDate {
    NaiveDate::from_ymd_opt(1950, 1, 1).unwrap()
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Case-insensitive prefix match against the full weekday name, so "sat",
/// "Sat" and "saturday" all select Saturday. Empty patterns match nothing.
pub fn weekday_prefix_matches(day: Weekday, pattern: &str) -> bool {
    !pattern.is_empty() && weekday_name(day).starts_with(pattern.to_ascii_lowercase().as_str())
}

/// True when the pattern selects at least one weekday.
pub fn weekday_prefix_is_valid(pattern: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    !pattern.is_empty()
        && [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .iter()
        .any(|d| weekday_name(*d).starts_with(pattern.as_str()))
}

/// Decide what is due for one target, evaluated at date-only granularity.
///
/// A full is due once `full_interval` weeks have passed since the last full
/// (or always, when there is none), but it only runs on the configured
/// weekday; `full_interval == 0` forces a full on every invocation. An
/// incremental is due once `diff_interval` days have passed since the last
/// incremental, and never when no prior full exists.
pub fn decide(
    today: NaiveDate,
    full_interval_weeks: i64,
    diff_interval_days: i64,
    full_bak_day: &str,
    last_full: Option<NaiveDate>,
    last_diff: Option<NaiveDate>,
) -> BackupDecision {
    let full_due = last_full.unwrap_or_else(far_past) + Duration::weeks(full_interval_weeks);
    let diff_due = last_diff.unwrap_or_else(far_past) + Duration::days(diff_interval_days);

    if today >= full_due {
        if weekday_prefix_matches(today.weekday(), full_bak_day) {
            BackupDecision::Full
        } else if full_interval_weeks == 0 {
            BackupDecision::Full
        } else if today >= diff_due && last_full.is_some() {
            BackupDecision::Incremental
        } else {
            BackupDecision::Skip
        }
    } else if today >= diff_due && last_full.is_some() {
        BackupDecision::Incremental
    } else {
        BackupDecision::Skip
    }
}
