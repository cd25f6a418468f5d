//! Dropbox API v2 payloads used by the snapshot sync (subset).
//!
//! Only the fields the cache needs are modeled; unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Argument of `files/get_metadata` and `files/download`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathArg<'a> {
    pub path: &'a str,
}

/// Response of the OAuth2 token endpoint for a `refresh_token` grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub id: String,
    /// Revision identifier; changes on every upload of the file.
    pub rev: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub server_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FolderMetadata {
    pub name: String,
    #[serde(default)]
    pub path_display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeletedMetadata {
    pub name: String,
    #[serde(default)]
    pub path_display: Option<String>,
}

/// Error body returned with 4xx responses from RPC endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error_summary: String,
}
