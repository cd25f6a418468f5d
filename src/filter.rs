//! ZIP-code and time-range selection over the loaded snapshot.

use crate::db::models::HourlyReading;
use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::BTreeSet;

/// First and last calendar date of a month, or `None` for an invalid month.
pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
    Some((first, last))
}

/// Parse `YYYY-MM` into a (year, month) pair.
pub fn parse_year_month(s: &str) -> Result<(i32, u32), String> {
    let invalid = || format!("expected YYYY-MM, got {:?}", s);
    let (y, m) = s.trim().split_once('-').ok_or_else(invalid)?;
    let year = y.parse::<i32>().map_err(|_| invalid())?;
    let month = m.parse::<u32>().map_err(|_| invalid())?;
    if month_bounds(year, month).is_none() {
        return Err(invalid());
    }
    Ok((year, month))
}

/// Sorted distinct ZIP codes present in `rows`.
pub fn zip_codes(rows: &[HourlyReading]) -> Vec<String> {
    rows.iter()
        .map(|r| r.zip_code.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Sorted distinct (year, month) pairs present in `rows`.
pub fn available_months(rows: &[HourlyReading]) -> Vec<(i32, u32)> {
    rows.iter()
        .map(|r| (r.hour_timestamp.year(), r.hour_timestamp.month()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    /// `None` keeps every ZIP code.
    pub zip_codes: Option<BTreeSet<String>>,
    /// Inclusive lower bound.
    pub start: Option<NaiveDateTime>,
    /// Inclusive upper bound.
    pub end: Option<NaiveDateTime>,
}

impl ReadingFilter {
    /// Range covering whole months: from the first instant of `from` up to
    /// midnight of the last day of `to`.
    ///
    /// Readings later on that last day fall outside the range.
    pub fn for_months(
        zip_codes: Option<BTreeSet<String>>,
        from: (i32, u32),
        to: (i32, u32),
    ) -> Result<Self, String> {
        let (start, _) = month_bounds(from.0, from.1).ok_or_else(|| format!("invalid month {:?}", from))?;
        let (_, end) = month_bounds(to.0, to.1).ok_or_else(|| format!("invalid month {:?}", to))?;
        if end < start {
            return Err(format!(
                "end month {:04}-{:02} is before start month {:04}-{:02}",
                to.0, to.1, from.0, from.1
            ));
        }
        Ok(ReadingFilter {
            zip_codes,
            start: Some(start.and_time(NaiveTime::MIN)),
            end: Some(end.and_time(NaiveTime::MIN)),
        })
    }

    pub fn matches(&self, row: &HourlyReading) -> bool {
        if let Some(zips) = &self.zip_codes
            && !zips.contains(&row.zip_code)
        {
            return false;
        }
        if let Some(start) = self.start
            && row.hour_timestamp < start
        {
            return false;
        }
        if let Some(end) = self.end
            && row.hour_timestamp > end
        {
            return false;
        }
        true
    }

    pub fn apply(&self, rows: &[HourlyReading]) -> Vec<HourlyReading> {
        rows.iter().filter(|r| self.matches(r)).cloned().collect()
    }
}
