//! Synthetic snapshot generator.
//!
//! Produces a Fresno-area sensor network with seasonal PM2.5 and temperature
//! patterns. Raw samples are drawn every 10 minutes, converted to AQI with the
//! EPA PM2.5 breakpoints and averaged per sensor and hour before insertion.

use crate::db::models::HourlyReading;
use crate::db::store;
use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use diesel::prelude::*;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

pub const DEFAULT_SENSORS: usize = 30;
pub const DEFAULT_DAYS: u32 = 730;
pub const DEFAULT_SEED: u64 = 0x0A1F_2E5C_93A7_0000;
const SAMPLES_PER_HOUR: u32 = 6;
const POSITION_JITTER_DEG: f64 = 0.005;

const ZIP_LOCATIONS: [(&str, f64, f64); 15] = [
    ("93701", 36.745, -119.785),
    ("93702", 36.752, -119.754),
    ("93703", 36.767, -119.750),
    ("93704", 36.790, -119.800),
    ("93705", 36.775, -119.823),
    ("93706", 36.707, -119.799),
    ("93710", 36.813, -119.771),
    ("93711", 36.840, -119.851),
    ("93720", 36.860, -119.760),
    ("93722", 36.800, -119.880),
    ("93723", 36.820, -119.960),
    ("93725", 36.680, -119.776),
    ("93726", 36.793, -119.760),
    ("93727", 36.750, -119.700),
    ("93728", 36.757, -119.815),
];

/// Monthly (low, high) temperature in °F, January first.
const MONTHLY_TEMP_F: [(f64, f64); 12] = [
    (40.0, 65.0),
    (42.0, 65.0),
    (50.0, 75.0),
    (55.0, 85.0),
    (65.0, 98.0),
    (70.0, 105.0),
    (75.0, 110.0),
    (75.0, 110.0),
    (70.0, 100.0),
    (60.0, 90.0),
    (50.0, 70.0),
    (40.0, 60.0),
];

/// Monthly (low, high) PM2.5 in µg/m³; summer wildfire season runs hot.
const MONTHLY_PM25: [(f64, f64); 12] = [
    (5.0, 25.0),
    (5.0, 25.0),
    (5.0, 25.0),
    (8.0, 30.0),
    (10.0, 35.0),
    (15.0, 40.0),
    (20.0, 120.0),
    (25.0, 120.0),
    (20.0, 100.0),
    (15.0, 60.0),
    (10.0, 30.0),
    (8.0, 25.0),
];

/// EPA PM2.5 breakpoints: (conc low, conc high, index low, index high).
const PM25_BREAKPOINTS: [(f64, f64, f64, f64); 7] = [
    (0.0, 12.0, 0.0, 50.0),
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 350.4, 301.0, 400.0),
    (350.5, 500.4, 401.0, 500.0),
];
const AQI_CAP: f64 = 500.0;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub out: PathBuf,
    pub days: u32,
    pub sensors: usize,
    pub seed: u64,
    /// Exclusive end of the generated range, truncated to the hour.
    ///
    /// The hour starting at `end` is deliberately left out: it would only have
    /// its first 10-minute sample, so every generated hour averages all six.
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
struct Sensor {
    id: String,
    zip_code: &'static str,
    latitude: f64,
    longitude: f64,
}

/// Write a new snapshot file. Refuses to overwrite an existing one.
pub fn run(opts: &GenerateOptions) -> Result<usize, String> {
    if opts.out.exists() {
        return Err(format!("{} already exists; remove it first", opts.out.display()));
    }
    if opts.days == 0 || opts.sensors == 0 {
        return Err("generator needs at least one day and one sensor".to_string());
    }

    let end = truncate_to_hour(opts.end);
    let start = end - Duration::days(i64::from(opts.days));
    let mut rng = SmallRng::seed_from_u64(opts.seed);
    let sensors = place_sensors(opts.sensors, &mut rng);

    info!(
        "Generator: {} sensor(s) across {} ZIP code(s), {} to {} -> {}",
        sensors.len(),
        sensors.len().min(ZIP_LOCATIONS.len()),
        start,
        end,
        opts.out.display()
    );

    let mut conn = store::create(&opts.out).map_err(|e| e.to_string())?;
    let mut inserted = 0;

    for sensor in &sensors {
        let rows = sensor_history(sensor, start, end, &mut rng);
        inserted += conn
            .transaction(|conn| store::insert_readings(conn, &rows))
            .map_err(|e| format!("insert readings for {} failed: {}", sensor.id, e))?;
        info!("Generator: {} done ({} hourly rows)", sensor.id, rows.len());
    }

    info!("Generator: complete ({} rows)", inserted);
    Ok(inserted)
}

fn truncate_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date().and_hms_opt(ts.hour(), 0, 0).unwrap_or(ts)
}

fn place_sensors(count: usize, rng: &mut SmallRng) -> Vec<Sensor> {
    (0..count)
        .map(|i| {
            let (zip_code, lat, lon) = ZIP_LOCATIONS[i % ZIP_LOCATIONS.len()];
            Sensor {
                id: format!("sensor_{:02}", i + 1),
                zip_code,
                latitude: round_to(lat + rng.random_range(-POSITION_JITTER_DEG..=POSITION_JITTER_DEG), 6),
                longitude: round_to(lon + rng.random_range(-POSITION_JITTER_DEG..=POSITION_JITTER_DEG), 6),
            }
        })
        .collect()
}

fn sensor_history(sensor: &Sensor, start: NaiveDateTime, end: NaiveDateTime, rng: &mut SmallRng) -> Vec<HourlyReading> {
    let hours = (end - start).num_hours().max(0) as usize;
    let mut rows = Vec::with_capacity(hours);
    let mut hour = start;

    while hour < end {
        let month_index = hour.month0() as usize;
        let (temp_lo, temp_hi) = MONTHLY_TEMP_F[month_index];
        let (pm_lo, pm_hi) = MONTHLY_PM25[month_index];

        let mut temp_sum = 0.0;
        let mut pm_sum = 0.0;
        let mut aqi_sum = 0.0;
        let mut cig_sum = 0.0;
        for _ in 0..SAMPLES_PER_HOUR {
            let temp = round_to(triangular(rng, temp_lo, (temp_lo + temp_hi) / 2.0, temp_hi), 1);
            let pm = round_to(triangular(rng, pm_lo, (pm_lo + pm_hi) / 2.0, pm_hi), 1);
            let aqi = pm25_to_aqi(pm);
            temp_sum += temp;
            pm_sum += pm;
            aqi_sum += aqi;
            cig_sum += round_to(aqi / 22.0, 2);
        }

        let n = f64::from(SAMPLES_PER_HOUR);
        rows.push(HourlyReading {
            sensor_id: sensor.id.clone(),
            zip_code: sensor.zip_code.to_string(),
            longitude: sensor.longitude,
            latitude: sensor.latitude,
            hour_timestamp: hour,
            avg_temp: temp_sum / n,
            avg_pm2_5: pm_sum / n,
            avg_aqi: aqi_sum / n,
            avg_cig_apx: cig_sum / n,
        });
        hour += Duration::hours(1);
    }

    rows
}

/// EPA linear interpolation within the matching breakpoint, rounded to an
/// integer. Concentrations past the table, or in the gaps between bands, cap
/// at 500.
pub fn pm25_to_aqi(pm: f64) -> f64 {
    PM25_BREAKPOINTS
        .iter()
        .find(|(c_lo, c_hi, _, _)| (*c_lo..=*c_hi).contains(&pm))
        .map(|(c_lo, c_hi, i_lo, i_hi)| ((i_hi - i_lo) / (c_hi - c_lo) * (pm - c_lo) + i_lo).round())
        .unwrap_or(AQI_CAP)
}

/// Triangular distribution sample by inverse CDF.
fn triangular(rng: &mut SmallRng, low: f64, mode: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    let u: f64 = rng.random_range(0.0..1.0);
    let split = (mode - low) / (high - low);
    if u < split {
        low + (u * (high - low) * (mode - low)).sqrt()
    } else {
        high - ((1.0 - u) * (high - low) * (high - mode)).sqrt()
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
