//! Blocking HTTP client for the Dropbox API v2 (metadata and download only).
//!
//! - Blocking client using `ureq` (no async), with an explicit global timeout.
//! - Payloads live in `crate::models::dropbox`.
//!
//! Authentication
//! - Exchanges the long-lived refresh token for short-lived access tokens on
//!   first use, refreshing shortly before expiry and once more when a request
//!   gets a 401. Construction does no I/O, so an unreachable API surfaces as a
//!   request error the snapshot cache can fall back from.

use http::{Response, StatusCode};
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::io::Read;
use std::time::{Duration, Instant};
use ureq::Body;

use crate::models::dropbox::*;
use crate::snapshot::{RemoteObject, RemoteStorage};

const OAUTH_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const GET_METADATA_URL: &str = "https://api.dropboxapi.com/2/files/get_metadata";
const DOWNLOAD_URL: &str = "https://content.dropboxapi.com/2/files/download";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const API_RESULT_HEADER: &str = "Dropbox-API-Result";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum DropboxClientError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
    Auth(String),
    /// The path resolved to a folder or a deleted entry.
    NotAFile(String),
    /// A download response arrived without its metadata header.
    MissingResultHeader,
}

impl core::fmt::Display for DropboxClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DropboxClientError::Transport(s) => write!(f, "transport error: {}", s),
            DropboxClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            DropboxClientError::Json(e) => write!(f, "json error: {}", e),
            DropboxClientError::Auth(e) => write!(f, "auth error: {}", e),
            DropboxClientError::NotAFile(p) => write!(f, "{} is not a file", p),
            DropboxClientError::MissingResultHeader => write!(f, "download response lacks {}", API_RESULT_HEADER),
        }
    }
}

impl std::error::Error for DropboxClientError {}

impl From<serde_json::Error> for DropboxClientError {
    fn from(value: serde_json::Error) -> Self {
        DropboxClientError::Json(value.to_string())
    }
}

impl From<ureq::Error> for DropboxClientError {
    fn from(value: ureq::Error) -> Self {
        DropboxClientError::Transport(value.to_string())
    }
}

/// Absolute URLs of the three endpoints the client calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub token: String,
    pub metadata: String,
    pub download: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            token: OAUTH_TOKEN_URL.to_string(),
            metadata: GET_METADATA_URL.to_string(),
            download: DOWNLOAD_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct DropboxClient {
    agent: ureq::Agent,
    endpoints: Endpoints,
    app_key: String,
    app_secret: String,
    refresh_token: String,
    access: RefCell<Option<AccessToken>>,
}

impl DropboxClient {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::with_endpoints(Endpoints::default(), app_key, app_secret, refresh_token, timeout)
    }

    /// Client talking to `endpoints`. No request is made until the first call.
    pub fn with_endpoints(
        endpoints: Endpoints,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();

        DropboxClient {
            agent: ureq::Agent::new_with_config(config),
            endpoints,
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            refresh_token: refresh_token.into(),
            access: RefCell::new(None),
        }
    }

    fn refresh_grant(&self) -> Result<AccessToken, DropboxClientError> {
        let resp = self
            .agent
            .post(self.endpoints.token.as_str())
            .header("Accept", "application/json")
            .send_form([
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
                ("client_id", self.app_key.as_str()),
                ("client_secret", self.app_secret.as_str()),
            ])?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = read_body(resp);
            return Err(DropboxClientError::Auth(format!("http {}: {}", status, body)));
        }

        let TokenResponse {
            access_token,
            expires_in,
            ..
        } = decode_json(resp)?;
        debug!("Obtained Dropbox access token (expires in {}s)", expires_in);
        Ok(AccessToken {
            value: access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        })
    }

    fn bearer(&self) -> Result<String, DropboxClientError> {
        let mut access = self.access.borrow_mut();
        if let Some(t) = access.as_ref()
            && !needs_refresh(t.expires_at, Instant::now())
        {
            return Ok(t.value.clone());
        }

        let token = self.refresh_grant()?;
        let value = token.value.clone();
        *access = Some(token);
        Ok(value)
    }

    /// Send an authenticated request built by `send`, retrying once with a
    /// fresh token on 401. Non-2xx responses become `Http` errors.
    fn call_authorized<F>(&self, send: F) -> Result<Response<Body>, DropboxClientError>
    where
        F: Fn(&str) -> Result<Response<Body>, ureq::Error>,
    {
        let auth = format!("Bearer {}", self.bearer()?);
        let mut resp = send(&auth)?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("Dropbox rejected the access token; refreshing and retrying once");
            let token = self.refresh_grant()?;
            let auth = format!("Bearer {}", token.value);
            *self.access.borrow_mut() = Some(token);
            resp = send(&auth)?;
        }

        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(http_error(resp))
        }
    }

    pub fn get_metadata(&self, path: &str) -> Result<Metadata, DropboxClientError> {
        let arg = PathArg { path };
        let resp = self.call_authorized(|auth| {
            self.agent
                .post(self.endpoints.metadata.as_str())
                .header("Authorization", auth)
                .send_json(&arg)
        })?;
        decode_json(resp)
    }

    /// Start a download; the body is streamed from the returned reader.
    pub fn download_file(&self, path: &str) -> Result<(FileMetadata, impl Read + use<>), DropboxClientError> {
        let arg = header_safe_json(&PathArg { path })?;
        let resp = self.call_authorized(|auth| {
            self.agent
                .post(self.endpoints.download.as_str())
                .header("Authorization", auth)
                .header(API_ARG_HEADER, arg.as_str())
                .send_empty()
        })?;

        let result = resp
            .headers()
            .get(API_RESULT_HEADER)
            .ok_or(DropboxClientError::MissingResultHeader)?
            .to_str()
            .map_err(|e| DropboxClientError::Json(format!("{} header: {}", API_RESULT_HEADER, e)))?;
        let meta: FileMetadata = serde_json::from_str(result)?;

        Ok((meta, resp.into_body().into_reader()))
    }
}

impl RemoteStorage for DropboxClient {
    type Error = DropboxClientError;

    fn revision(&self, path: &str) -> Result<String, Self::Error> {
        match self.get_metadata(path)? {
            Metadata::File(file) => Ok(file.rev),
            Metadata::Folder(_) | Metadata::Deleted(_) => Err(DropboxClientError::NotAFile(path.to_string())),
        }
    }

    fn download(&self, path: &str) -> Result<RemoteObject, Self::Error> {
        let (meta, body) = self.download_file(path)?;
        Ok(RemoteObject {
            revision: Some(meta.rev),
            size: Some(meta.size),
            body: Box::new(body),
        })
    }
}

/// A token is renewed once it is within `TOKEN_REFRESH_MARGIN` of expiring.
fn needs_refresh(expires_at: Instant, now: Instant) -> bool {
    now + TOKEN_REFRESH_MARGIN >= expires_at
}

fn decode_json<T: DeserializeOwned>(resp: Response<Body>) -> Result<T, DropboxClientError> {
    let reader = resp.into_body().into_reader();
    let mut de = serde_json::Deserializer::from_reader(reader);
    serde_path_to_error::deserialize(&mut de).map_err(|e| DropboxClientError::Json(e.to_string()))
}

fn read_body(resp: Response<Body>) -> String {
    let mut body = resp.into_body();
    body.read_to_string().unwrap_or_else(|_| String::from("<no body>"))
}

fn http_error(resp: Response<Body>) -> DropboxClientError {
    let status = resp.status().as_u16();
    let raw = read_body(resp);
    let message = serde_json::from_str::<ApiErrorBody>(&raw)
        .map(|b| b.error_summary)
        .unwrap_or(raw);
    DropboxClientError::Http { status, message }
}

/// JSON for use in an HTTP header: non-ASCII characters and DEL are written
/// as `\uXXXX` escapes.
fn header_safe_json<T: Serialize>(value: &T) -> Result<String, DropboxClientError> {
    let json = serde_json::to_string(value)?;
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() && ch != '\x7f' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::{reading, write_snapshot};
    use crate::snapshot::{LoadOutcome, SnapshotCache};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    const TOKEN_T1: &str = r#"{"access_token":"t1","expires_in":14400,"token_type":"bearer"}"#;
    const TOKEN_T2: &str = r#"{"access_token":"t2","expires_in":14400,"token_type":"bearer"}"#;
    const FILE_META: &str = r#"{".tag":"file","name":"air.sqlite","id":"id:1","rev":"015f1","size":4096}"#;
    const EXPIRED: &str = r#"{"error_summary":"expired_access_token/","error":{".tag":"expired_access_token"}}"#;

    /// Request line and `Authorization` header of each request received.
    type RequestLog = Arc<Mutex<Vec<(String, Option<String>)>>>;

    /// Local HTTP server answering one request per connection with the next
    /// scripted `(status, body)`.
    fn serve(responses: Vec<(u16, &'static str)>) -> (Endpoints, RequestLog) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&log);

        thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());

                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut auth = None;
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("authorization") {
                            auth = Some(value.trim().to_string());
                        } else if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap();
                        }
                    }
                }
                let mut request_body = vec![0u8; content_length];
                reader.read_exact(&mut request_body).unwrap();
                seen.lock().unwrap().push((request_line.trim_end().to_string(), auth));

                write!(
                    stream,
                    "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                )
                .unwrap();
                stream.flush().unwrap();
            }
        });

        let endpoints = Endpoints {
            token: format!("{}/oauth2/token", base),
            metadata: format!("{}/2/files/get_metadata", base),
            download: format!("{}/2/files/download", base),
        };
        (endpoints, log)
    }

    fn client(endpoints: Endpoints) -> DropboxClient {
        DropboxClient::with_endpoints(endpoints, "key", "secret", "refresh", Duration::from_secs(5))
    }

    fn requests(log: &RequestLog) -> Vec<(String, Option<String>)> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn token_is_renewed_within_the_refresh_margin() {
        let now = Instant::now();
        assert!(!needs_refresh(now + Duration::from_secs(3600), now));
        assert!(!needs_refresh(now + TOKEN_REFRESH_MARGIN + Duration::from_secs(1), now));
        assert!(needs_refresh(now + TOKEN_REFRESH_MARGIN, now));
        assert!(needs_refresh(now + Duration::from_secs(5), now));
        assert!(needs_refresh(now, now));
    }

    #[test]
    fn valid_token_is_reused_across_calls() {
        let (endpoints, log) = serve(vec![(200, TOKEN_T1), (200, FILE_META), (200, FILE_META)]);
        let client = client(endpoints);

        assert_eq!(client.revision("/air.sqlite").unwrap(), "015f1");
        assert_eq!(client.revision("/air.sqlite").unwrap(), "015f1");

        let seen = requests(&log);
        assert_eq!(seen.len(), 3);
        assert!(seen[0].0.starts_with("POST /oauth2/token"));
        assert_eq!(seen[1].1.as_deref(), Some("Bearer t1"));
        assert_eq!(seen[2].1.as_deref(), Some("Bearer t1"));
    }

    #[test]
    fn unauthorized_request_refreshes_token_and_retries_once() {
        let (endpoints, log) = serve(vec![(200, TOKEN_T1), (401, EXPIRED), (200, TOKEN_T2), (200, FILE_META)]);
        let client = client(endpoints);

        let meta = client.get_metadata("/air.sqlite").unwrap();

        assert!(matches!(meta, Metadata::File(ref f) if f.rev == "015f1"));
        let seen = requests(&log);
        assert_eq!(seen.len(), 4);
        assert!(seen[0].0.starts_with("POST /oauth2/token"));
        assert_eq!(seen[1].1.as_deref(), Some("Bearer t1"));
        assert!(seen[2].0.starts_with("POST /oauth2/token"));
        assert_eq!(seen[3].1.as_deref(), Some("Bearer t2"));
    }

    #[test]
    fn second_unauthorized_response_is_not_retried() {
        let (endpoints, log) = serve(vec![(200, TOKEN_T1), (401, EXPIRED), (200, TOKEN_T2), (401, EXPIRED)]);
        let client = client(endpoints);

        let err = client.get_metadata("/air.sqlite").unwrap_err();

        match err {
            DropboxClientError::Http { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "expired_access_token/");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(requests(&log).len(), 4);
    }

    #[test]
    fn unreachable_api_falls_back_to_cached_snapshot() {
        // Reserve a port, then close it so every request is refused.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let endpoints = Endpoints {
            token: format!("{}/oauth2/token", base),
            metadata: format!("{}/2/files/get_metadata", base),
            download: format!("{}/2/files/download", base),
        };

        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("air_quality.sqlite");
        let revision_file = dir.path().join("air_quality.rev");
        let rows = vec![reading("sensor_01", "93701", (2024, 1, 15, 0), 40.0)];
        write_snapshot(&cache_file, &rows).unwrap();
        std::fs::write(&revision_file, "rev-1").unwrap();

        let client = client(endpoints);
        assert!(matches!(client.revision("/air.sqlite"), Err(DropboxClientError::Transport(_))));

        let mut cache = SnapshotCache::new(client, "/air.sqlite", cache_file, revision_file);
        assert_eq!(cache.load_readings().unwrap(), rows.as_slice());
        assert_eq!(cache.last_outcome(), Some(&LoadOutcome::StaleFallback));
    }

    #[test]
    fn header_json_is_ascii_and_still_valid_json() {
        let arg = header_safe_json(&PathArg { path: "/données/air 😷.sqlite" }).unwrap();
        assert!(arg.is_ascii());
        assert_eq!(arg, r#"{"path":"/donn\u00e9es/air \ud83d\ude37.sqlite"}"#);

        let back: serde_json::Value = serde_json::from_str(&arg).unwrap();
        assert_eq!(back["path"], "/données/air 😷.sqlite");
    }

    #[test]
    fn plain_paths_are_unchanged() {
        let arg = header_safe_json(&PathArg { path: "/data/air.sqlite" }).unwrap();
        assert_eq!(arg, r#"{"path":"/data/air.sqlite"}"#);
    }
}
