//! Assembles the derived views for one filter selection and renders them.

use crate::aggregate::{
    self, round1, AggregateError, CategoryCount, DailyMean, MonthExtremes, SummaryMetrics,
};
use crate::db::models::HourlyReading;
use crate::filter::{self, ReadingFilter};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt::Write;

pub const NO_DATA_NOTICE: &str = "No data available for selected filters.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionInfo {
    /// ZIP codes the selection was restricted to; empty means all.
    pub zip_codes: Vec<String>,
    /// Every ZIP code in the snapshot, selectable with `--zip`.
    pub available_zip_codes: Vec<String>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub matching_readings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyTrend {
    pub year: i32,
    pub month: u32,
    pub series: Vec<DailyMean>,
    pub extremes: Option<MonthExtremes>,
}

/// A sensor's current position and reading, as plotted on the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorPoint {
    pub sensor_id: String,
    pub zip_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub avg_aqi: f64,
    pub avg_pm2_5: f64,
    pub observed_at: NaiveDateTime,
}

impl From<&HourlyReading> for SensorPoint {
    fn from(r: &HourlyReading) -> Self {
        SensorPoint {
            sensor_id: r.sensor_id.clone(),
            zip_code: r.zip_code.clone(),
            latitude: r.latitude,
            longitude: r.longitude,
            avg_aqi: r.avg_aqi,
            avg_pm2_5: r.avg_pm2_5,
            observed_at: r.hour_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub selection: SelectionInfo,
    /// `None` when the selection is empty.
    pub summary: Option<SummaryMetrics>,
    pub categories: Vec<CategoryCount>,
    pub monthly: Option<MonthlyTrend>,
    pub sensors: Vec<SensorPoint>,
}

/// Filter `rows` and compute every view.
///
/// `month` picks the monthly trend; by default the latest month in the selection.
pub fn build(rows: &[HourlyReading], selection: &ReadingFilter, month: Option<(i32, u32)>) -> Dashboard {
    let filtered = selection.apply(rows);

    let summary = match aggregate::summary_metrics(&filtered) {
        Ok(s) => Some(s),
        Err(AggregateError::EmptyInput) => None,
    };

    let month = month.or_else(|| filter::available_months(&filtered).last().copied());
    let monthly = month.map(|(year, month)| {
        let series = aggregate::monthly_daily_series(&filtered, year, month);
        let extremes = aggregate::month_extremes(&series);
        MonthlyTrend {
            year,
            month,
            series,
            extremes,
        }
    });

    Dashboard {
        selection: SelectionInfo {
            zip_codes: selection
                .zip_codes
                .as_ref()
                .map(|z| z.iter().cloned().collect())
                .unwrap_or_default(),
            available_zip_codes: filter::zip_codes(rows),
            start: selection.start,
            end: selection.end,
            matching_readings: filtered.len(),
        },
        summary,
        categories: aggregate::category_distribution(&filtered),
        monthly,
        sensors: aggregate::latest_per_sensor(&filtered)
            .into_iter()
            .map(SensorPoint::from)
            .collect(),
    }
}

pub fn to_json(dashboard: &Dashboard) -> Result<String, String> {
    serde_json::to_string_pretty(dashboard).map_err(|e| format!("serializing dashboard failed: {}", e))
}

pub fn to_text(dashboard: &Dashboard) -> Result<String, String> {
    let mut out = String::new();
    write_text(&mut out, dashboard).map_err(|e| format!("rendering dashboard failed: {}", e))?;
    Ok(out)
}

fn write_text(out: &mut String, d: &Dashboard) -> std::fmt::Result {
    writeln!(out, "Air Quality Dashboard")?;
    let zips = if d.selection.zip_codes.is_empty() {
        "all".to_string()
    } else {
        d.selection.zip_codes.join(", ")
    };
    let fmt_ts = |ts: Option<NaiveDateTime>| ts.map(|t| t.format("%b %Y").to_string()).unwrap_or_else(|| "-".into());
    writeln!(
        out,
        "ZIP codes: {} | Time period: {} - {}",
        zips,
        fmt_ts(d.selection.start),
        fmt_ts(d.selection.end)
    )?;
    writeln!(out, "Available ZIP codes: {}", d.selection.available_zip_codes.join(", "))?;
    writeln!(out)?;

    let Some(summary) = &d.summary else {
        writeln!(out, "{}", NO_DATA_NOTICE)?;
        return Ok(());
    };

    writeln!(out, "== Summary")?;
    writeln!(out, "  Avg AQI:         {:.1}", summary.avg_aqi)?;
    writeln!(
        out,
        "  Best ZIP:        {} ({:.1})",
        summary.best_zip.zip_code, summary.best_zip.avg_aqi
    )?;
    writeln!(
        out,
        "  Worst ZIP:       {} ({:.1})",
        summary.worst_zip.zip_code, summary.worst_zip.avg_aqi
    )?;
    writeln!(
        out,
        "  Good days:       {} ({:.1}%) of {}",
        summary.good_days,
        round1(summary.good_day_pct),
        summary.total_days
    )?;
    writeln!(
        out,
        "  Unhealthy days:  {} ({:.1}%)",
        summary.unhealthy_days,
        round1(summary.unhealthy_day_pct)
    )?;
    writeln!(out, "  Hourly readings: {}", summary.total_readings)?;
    writeln!(out)?;

    writeln!(out, "== AQI categories")?;
    for c in &d.categories {
        writeln!(
            out,
            "  {:<22} {:>8}  {:>5.1}%  ({}, {})",
            c.category.label(),
            c.count,
            c.percent,
            c.category.range(),
            c.category.color()
        )?;
    }
    writeln!(out)?;

    if let Some(m) = &d.monthly {
        writeln!(out, "== Daily average AQI, {:04}-{:02}", m.year, m.month)?;
        if m.series.is_empty() {
            writeln!(out, "  No data available for this month.")?;
        }
        for day in &m.series {
            writeln!(out, "  {}  {:>6.1}", day.date, day.avg_aqi)?;
        }
        if let Some(x) = &m.extremes {
            writeln!(
                out,
                "  Highest: {:.1} ({})  Lowest: {:.1} ({})",
                x.highest.avg_aqi,
                x.highest.date.format("%m/%d/%Y"),
                x.lowest.avg_aqi,
                x.lowest.date.format("%m/%d/%Y")
            )?;
        }
        writeln!(out)?;
    }

    writeln!(out, "== Sensors (latest reading)")?;
    for s in &d.sensors {
        writeln!(
            out,
            "  {:<10} {:<6} {:>10.6} {:>11.6}  AQI {:>5.1}  PM2.5 {:>5.1}  at {}",
            s.sensor_id,
            s.zip_code,
            s.latitude,
            s.longitude,
            s.avg_aqi,
            s.avg_pm2_5,
            s.observed_at.format("%Y-%m-%d %H:%M")
        )?;
    }
    Ok(())
}
