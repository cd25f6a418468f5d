//! Runtime configuration collected once at startup.
//!
//! Dropbox credentials and the object path have no defaults. Every missing or
//! malformed variable is reported in one error instead of failing on the first.

use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_DIR: &str = "/tmp";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
pub const CACHE_FILE_NAME: &str = "air_quality.sqlite";
pub const REVISION_FILE_NAME: &str = "air_quality.rev";

const REQUIRED: [&str; 4] = [
    "DROPBOX_APP_KEY",
    "DROPBOX_APP_SECRET",
    "DROPBOX_REFRESH_TOKEN",
    "DROPBOX_UPLOAD_PATH",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub missing: Vec<&'static str>,
    pub invalid: Vec<String>,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing required variable(s): {}", self.missing.join(", ")));
        }
        if !self.invalid.is_empty() {
            parts.push(format!("invalid variable(s): {}", self.invalid.join("; ")));
        }
        write!(f, "configuration error: {}", parts.join("; "))
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    /// Dropbox app key, used as the OAuth client id.
    pub dropbox_app_key: String,
    pub dropbox_app_secret: String,
    /// Long-lived refresh token, exchanged for short-lived access tokens.
    pub dropbox_refresh_token: String,
    /// Path of the snapshot object inside the Dropbox app folder.
    pub dropbox_path: String,
    /// Directory holding the cached snapshot and its revision marker.
    pub cache_dir: PathBuf,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let missing: Vec<&'static str> = REQUIRED.into_iter().filter(|k| get(*k).is_none()).collect();
        let mut invalid = Vec::new();

        let cache_dir = get("AQ_CACHE_DIR").unwrap_or_else(|| DEFAULT_CACHE_DIR.to_string());

        let http_timeout_secs = match get("AQ_HTTP_TIMEOUT_SECS") {
            None => DEFAULT_HTTP_TIMEOUT_SECS,
            Some(s) => match s.parse::<u64>() {
                Ok(v) if v > 0 => v,
                _ => {
                    invalid.push(format!("AQ_HTTP_TIMEOUT_SECS must be a positive integer, got {:?}", s));
                    DEFAULT_HTTP_TIMEOUT_SECS
                }
            },
        };

        if let Some(path) = get("DROPBOX_UPLOAD_PATH")
            && !path.starts_with('/')
        {
            invalid.push(format!("DROPBOX_UPLOAD_PATH must start with '/', got {:?}", path));
        }

        if !missing.is_empty() || !invalid.is_empty() {
            return Err(ConfigError { missing, invalid });
        }

        let require = |key: &str| get(key).unwrap_or_default();
        Ok(Config {
            dropbox_app_key: require("DROPBOX_APP_KEY"),
            dropbox_app_secret: require("DROPBOX_APP_SECRET"),
            dropbox_refresh_token: require("DROPBOX_REFRESH_TOKEN"),
            dropbox_path: require("DROPBOX_UPLOAD_PATH"),
            cache_dir: PathBuf::from(cache_dir),
            http_timeout: Duration::from_secs(http_timeout_secs),
        })
    }

    pub fn cache_file(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE_NAME)
    }

    pub fn revision_file(&self) -> PathBuf {
        self.cache_dir.join(REVISION_FILE_NAME)
    }
}
