//! Access to snapshot files: a single SQLite file holding `air_quality_hourly`.

use crate::db::models::HourlyReading;
use crate::schema::air_quality_hourly;
use core::fmt;
use diesel::prelude::*;
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

// Keeps a batch insert well below SQLite's bound-parameter limit (9 columns per row).
const INSERT_CHUNK_ROWS: usize = 500;

#[derive(Debug)]
pub enum StoreError {
    /// The snapshot file does not exist.
    Missing(PathBuf),
    /// The path cannot be handed to SQLite as a UTF-8 string.
    InvalidPath(PathBuf),
    Connection(ConnectionError),
    Query(diesel::result::Error),
    Migration(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Missing(p) => write!(f, "snapshot file {} does not exist", p.display()),
            StoreError::InvalidPath(p) => write!(f, "snapshot path {} is not valid UTF-8", p.display()),
            StoreError::Connection(e) => write!(f, "opening snapshot failed: {}", e),
            StoreError::Query(e) => write!(f, "snapshot query failed: {}", e),
            StoreError::Migration(e) => write!(f, "creating snapshot schema failed: {}", e),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Connection(e) => Some(e),
            StoreError::Query(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for StoreError {
    fn from(value: ConnectionError) -> Self {
        StoreError::Connection(value)
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Query(value)
    }
}

fn connect(path: &Path) -> Result<SqliteConnection, StoreError> {
    let url = path.to_str().ok_or_else(|| StoreError::InvalidPath(path.to_path_buf()))?;
    Ok(SqliteConnection::establish(url)?)
}

/// Open an existing snapshot file. Never creates one.
pub fn open(path: &Path) -> Result<SqliteConnection, StoreError> {
    if !path.is_file() {
        return Err(StoreError::Missing(path.to_path_buf()));
    }
    connect(path)
}

/// Load every row of the hourly table, ordered by time then sensor.
pub fn load_readings(path: &Path) -> Result<Vec<HourlyReading>, StoreError> {
    use air_quality_hourly::dsl as A;

    let mut conn = open(path)?;
    let rows = A::air_quality_hourly
        .select(HourlyReading::as_select())
        .order((A::hour_timestamp.asc(), A::sensor_id.asc()))
        .load(&mut conn)?;
    Ok(rows)
}

/// Create a new snapshot file (or bring an existing one up to date) with the hourly table.
pub fn create(path: &Path) -> Result<SqliteConnection, StoreError> {
    let mut conn = connect(path)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    if !applied.is_empty() {
        info!("Snapshot {}: applied {} migration(s)", path.display(), applied.len());
    }
    Ok(conn)
}

pub fn insert_readings(conn: &mut SqliteConnection, rows: &[HourlyReading]) -> Result<usize, StoreError> {
    if rows.is_empty() {
        return Ok(0);
    }

    use air_quality_hourly::dsl as A;

    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        inserted += diesel::insert_into(A::air_quality_hourly).values(chunk).execute(conn)?;
    }
    Ok(inserted)
}
