//! Diesel model structs for the hourly snapshot table.
//!
//! Snapshot files are replaced wholesale, never updated in place, so there is
//! a single row type used both for loading and for writing generated files.

use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

/// One row per sensor per hour. `(sensor_id, hour_timestamp)` is the primary key.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::air_quality_hourly)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct HourlyReading {
    pub sensor_id: String,
    pub zip_code: String,
    pub longitude: f64,
    pub latitude: f64,
    /// Truncated to the hour, local time of the sensor network.
    pub hour_timestamp: NaiveDateTime,
    /// Degrees Fahrenheit.
    pub avg_temp: f64,
    pub avg_pm2_5: f64,
    pub avg_aqi: f64,
    /// Approximate cigarettes-per-day equivalent (AQI / 22).
    pub avg_cig_apx: f64,
}

impl HourlyReading {
    pub fn date(&self) -> NaiveDate {
        self.hour_timestamp.date()
    }
}
