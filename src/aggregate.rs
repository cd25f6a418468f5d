//! Derived views over a filtered set of hourly readings.
//!
//! Every function here is pure: the same rows always produce the same view, and
//! nothing is cached between calls. Rows are assumed to be pre-filtered by ZIP
//! code and time range (see `crate::filter`).

use crate::db::models::HourlyReading;
use crate::filter::month_bounds;
use chrono::NaiveDate;
use core::fmt;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::hash::Hash;

/// Daily mean at or below this is a "good" day.
pub const GOOD_DAY_MAX_AQI: f64 = 50.0;
/// Daily mean at or above this is an "unhealthy" day.
pub const UNHEALTHY_DAY_MIN_AQI: f64 = 101.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateError {
    /// A summary was requested over zero rows.
    EmptyInput,
}

impl Display for AggregateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AggregateError::EmptyInput => write!(f, "no data"),
        }
    }
}

impl Error for AggregateError {}

/// EPA AQI bands. Declaration order is the display order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthySensitive,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    pub const ALL: [AqiCategory; 6] = [
        AqiCategory::Good,
        AqiCategory::Moderate,
        AqiCategory::UnhealthySensitive,
        AqiCategory::Unhealthy,
        AqiCategory::VeryUnhealthy,
        AqiCategory::Hazardous,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::UnhealthySensitive => "Unhealthy (Sensitive)",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
        }
    }

    /// Standard EPA colour for the band.
    pub fn color(self) -> &'static str {
        match self {
            AqiCategory::Good => "#00e400",
            AqiCategory::Moderate => "#ffff00",
            AqiCategory::UnhealthySensitive => "#ff7e00",
            AqiCategory::Unhealthy => "#ff0000",
            AqiCategory::VeryUnhealthy => "#8f3f97",
            AqiCategory::Hazardous => "#7e0023",
        }
    }

    /// Human readable AQI range, e.g. "51-100".
    pub fn range(self) -> &'static str {
        match self {
            AqiCategory::Good => "0-50",
            AqiCategory::Moderate => "51-100",
            AqiCategory::UnhealthySensitive => "101-150",
            AqiCategory::Unhealthy => "151-200",
            AqiCategory::VeryUnhealthy => "201-300",
            AqiCategory::Hazardous => "301+",
        }
    }
}

impl Display for AqiCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Map an AQI value to its band; each band includes its upper bound.
pub fn categorize(aqi: f64) -> AqiCategory {
    if aqi <= 50.0 {
        AqiCategory::Good
    } else if aqi <= 100.0 {
        AqiCategory::Moderate
    } else if aqi <= 150.0 {
        AqiCategory::UnhealthySensitive
    } else if aqi <= 200.0 {
        AqiCategory::Unhealthy
    } else if aqi <= 300.0 {
        AqiCategory::VeryUnhealthy
    } else {
        AqiCategory::Hazardous
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub category: AqiCategory,
    pub count: usize,
    /// Share of all rows, 0-100. Zero when there are no rows.
    pub percent: f64,
}

/// Count rows per AQI band. Always returns all six bands in display order.
pub fn category_distribution(rows: &[HourlyReading]) -> Vec<CategoryCount> {
    let mut counts = [0usize; AqiCategory::ALL.len()];
    for row in rows {
        counts[categorize(row.avg_aqi) as usize] += 1;
    }

    AqiCategory::ALL
        .iter()
        .zip(counts)
        .map(|(category, count)| CategoryCount {
            category: *category,
            count,
            percent: percent(count, rows.len()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMean {
    pub date: NaiveDate,
    pub avg_aqi: f64,
}

/// Mean AQI per calendar date, ascending by date.
pub fn daily_means(rows: &[HourlyReading]) -> Vec<DailyMean> {
    means_by_date(rows.iter())
}

fn means_by_date<'a>(rows: impl Iterator<Item = &'a HourlyReading>) -> Vec<DailyMean> {
    let mut by_date: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for row in rows {
        let acc = by_date.entry(row.date()).or_insert((0.0, 0));
        acc.0 += row.avg_aqi;
        acc.1 += 1;
    }

    by_date
        .into_iter()
        .map(|(date, (sum, n))| DailyMean {
            date,
            avg_aqi: sum / n as f64,
        })
        .collect()
}

/// Daily means for the rows dated within the given calendar month.
///
/// Empty when no rows fall in the month, or when `month` is not 1-12.
pub fn monthly_daily_series(rows: &[HourlyReading], year: i32, month: u32) -> Vec<DailyMean> {
    let Some((first, last)) = month_bounds(year, month) else {
        return Vec::new();
    };

    means_by_date(rows.iter().filter(|r| (first..=last).contains(&r.date())))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthExtremes {
    pub highest: DailyMean,
    pub lowest: DailyMean,
}

/// Highest and lowest day of a daily series; the earliest day wins ties.
pub fn month_extremes(series: &[DailyMean]) -> Option<MonthExtremes> {
    let first = series.first()?;
    let mut highest = first;
    let mut lowest = first;
    for day in &series[1..] {
        if day.avg_aqi > highest.avg_aqi {
            highest = day;
        }
        if day.avg_aqi < lowest.avg_aqi {
            lowest = day;
        }
    }
    Some(MonthExtremes {
        highest: highest.clone(),
        lowest: lowest.clone(),
    })
}

/// Reduce each group to its row with the greatest timestamp.
///
/// Groups are returned in order of first appearance. When several rows of a
/// group share the greatest timestamp, the first one encountered is kept.
fn latest_by<'a, K, F>(rows: &'a [HourlyReading], key: F) -> Vec<&'a HourlyReading>
where
    K: Eq + Hash,
    F: Fn(&'a HourlyReading) -> K,
{
    let mut slots: HashMap<K, usize> = HashMap::new();
    let mut latest: Vec<&'a HourlyReading> = Vec::new();

    for row in rows {
        match slots.entry(key(row)) {
            Entry::Occupied(slot) => {
                let current = &mut latest[*slot.get()];
                if row.hour_timestamp > current.hour_timestamp {
                    *current = row;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(latest.len());
                latest.push(row);
            }
        }
    }

    latest
}

/// Most recent reading of every sensor; these are the current map positions.
pub fn latest_per_sensor(rows: &[HourlyReading]) -> Vec<&HourlyReading> {
    latest_by(rows, |r| r.sensor_id.as_str())
}

pub fn latest_per_zip(rows: &[HourlyReading]) -> Vec<&HourlyReading> {
    latest_by(rows, |r| r.zip_code.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZipReading {
    pub zip_code: String,
    pub avg_aqi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryMetrics {
    /// Mean over all hourly rows, rounded to one decimal.
    pub avg_aqi: f64,
    /// ZIP whose latest reading has the lowest AQI.
    pub best_zip: ZipReading,
    /// ZIP whose latest reading has the highest AQI.
    pub worst_zip: ZipReading,
    pub total_days: usize,
    pub good_days: usize,
    pub unhealthy_days: usize,
    pub good_day_pct: f64,
    pub unhealthy_day_pct: f64,
    /// Hourly row count.
    pub total_readings: usize,
}

/// Headline numbers for the filtered rows. Fails with `EmptyInput` on zero rows.
pub fn summary_metrics(rows: &[HourlyReading]) -> Result<SummaryMetrics, AggregateError> {
    if rows.is_empty() {
        return Err(AggregateError::EmptyInput);
    }

    let mean = rows.iter().map(|r| r.avg_aqi).sum::<f64>() / rows.len() as f64;

    let latest = latest_per_zip(rows);
    let mut best = latest[0];
    let mut worst = latest[0];
    for row in &latest[1..] {
        if row.avg_aqi < best.avg_aqi {
            best = row;
        }
        if row.avg_aqi > worst.avg_aqi {
            worst = row;
        }
    }

    let days = daily_means(rows);
    let good_days = days.iter().filter(|d| d.avg_aqi <= GOOD_DAY_MAX_AQI).count();
    let unhealthy_days = days.iter().filter(|d| d.avg_aqi >= UNHEALTHY_DAY_MIN_AQI).count();

    Ok(SummaryMetrics {
        avg_aqi: round1(mean),
        best_zip: ZipReading {
            zip_code: best.zip_code.clone(),
            avg_aqi: best.avg_aqi,
        },
        worst_zip: ZipReading {
            zip_code: worst.zip_code.clone(),
            avg_aqi: worst.avg_aqi,
        },
        total_days: days.len(),
        good_days,
        unhealthy_days,
        good_day_pct: percent(good_days, days.len()),
        unhealthy_day_pct: percent(unhealthy_days, days.len()),
        total_readings: rows.len(),
    })
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
