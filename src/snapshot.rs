//! Local snapshot cache kept in sync with a remote object by revision token.
//!
//! The cached file and its revision marker live side by side. A load compares
//! the marker with the remote revision and only downloads on mismatch. New
//! downloads land in a temporary file, are checked, and are then renamed over
//! the cached file; the marker is written last, so a marker never vouches for
//! a file it did not come with.

use crate::db::models::HourlyReading;
use crate::db::store::{self, StoreError};
use core::fmt;
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A download in progress: metadata advertised by the remote plus the body stream.
pub struct RemoteObject {
    pub revision: Option<String>,
    /// Expected byte count, when the remote reports one.
    pub size: Option<u64>,
    pub body: Box<dyn Read>,
}

/// The two remote operations the cache relies on.
pub trait RemoteStorage {
    type Error: Error + Send + Sync + 'static;

    /// Current revision token of the object at `path`.
    fn revision(&self, path: &str) -> Result<String, Self::Error>;

    fn download(&self, path: &str) -> Result<RemoteObject, Self::Error>;
}

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug)]
pub enum DownloadError {
    Remote(BoxError),
    Io(io::Error),
    /// Fewer or more bytes arrived than the remote advertised.
    Truncated { expected: u64, received: u64 },
    /// The downloaded file does not open as a snapshot table.
    Corrupt(StoreError),
}

impl Display for DownloadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Remote(e) => write!(f, "remote error: {}", e),
            DownloadError::Io(e) => write!(f, "i/o error: {}", e),
            DownloadError::Truncated { expected, received } => {
                write!(f, "incomplete transfer: expected {} bytes, received {}", expected, received)
            }
            DownloadError::Corrupt(e) => write!(f, "downloaded snapshot is unreadable: {}", e),
        }
    }
}

impl Error for DownloadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DownloadError::Remote(e) => Some(e.as_ref()),
            DownloadError::Io(e) => Some(e),
            DownloadError::Corrupt(e) => Some(e),
            DownloadError::Truncated { .. } => None,
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(value: io::Error) -> Self {
        DownloadError::Io(value)
    }
}

#[derive(Debug)]
pub enum SnapshotError {
    /// The remote revision lookup failed.
    RemoteMetadata(BoxError),
    Download(DownloadError),
    /// The cached file could not be read.
    Table(StoreError),
    /// No remote revision and no local cache to fall back to.
    DataUnavailable(Box<SnapshotError>),
}

impl Display for SnapshotError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::RemoteMetadata(e) => write!(f, "remote metadata lookup failed: {}", e),
            SnapshotError::Download(e) => write!(f, "snapshot download failed: {}", e),
            SnapshotError::Table(e) => write!(f, "reading cached snapshot failed: {}", e),
            SnapshotError::DataUnavailable(e) => write!(f, "no data available: {}", e),
        }
    }
}

impl Error for SnapshotError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SnapshotError::RemoteMetadata(e) => Some(e.as_ref()),
            SnapshotError::Download(e) => Some(e),
            SnapshotError::Table(e) => Some(e),
            SnapshotError::DataUnavailable(e) => Some(e.as_ref()),
        }
    }
}

impl From<DownloadError> for SnapshotError {
    fn from(value: DownloadError) -> Self {
        SnapshotError::Download(value)
    }
}

/// What a load did to obtain its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Local marker matched the remote revision.
    UpToDate { revision: String },
    /// A new revision was downloaded.
    Downloaded { revision: String, bytes: u64 },
    /// Remote lookup failed; the existing cache was used as is.
    StaleFallback,
}

/// Snapshot cache bound to one remote object, memoizing the loaded rows.
pub struct SnapshotCache<S: RemoteStorage> {
    remote: S,
    remote_path: String,
    cache_file: PathBuf,
    revision_file: PathBuf,
    memo: Option<Vec<HourlyReading>>,
    last_outcome: Option<LoadOutcome>,
}

impl<S: RemoteStorage> SnapshotCache<S> {
    pub fn new(remote: S, remote_path: impl Into<String>, cache_file: PathBuf, revision_file: PathBuf) -> Self {
        SnapshotCache {
            remote,
            remote_path: remote_path.into(),
            cache_file,
            revision_file,
            memo: None,
            last_outcome: None,
        }
    }

    /// All rows of the snapshot. The freshness check and any download run at
    /// most once until `invalidate` is called.
    pub fn load_readings(&mut self) -> Result<&[HourlyReading], SnapshotError> {
        if self.memo.is_none() {
            let (rows, outcome) = self.sync()?;
            info!("Snapshot loaded: {} hourly reading(s) ({:?})", rows.len(), outcome);
            self.memo = Some(rows);
            self.last_outcome = Some(outcome);
        }
        Ok(self.memo.as_deref().unwrap_or_default())
    }

    /// Forget the memoized rows; the next load re-checks the remote revision.
    pub fn invalidate(&mut self) {
        self.memo = None;
        self.last_outcome = None;
    }

    pub fn last_outcome(&self) -> Option<&LoadOutcome> {
        self.last_outcome.as_ref()
    }

    fn sync(&self) -> Result<(Vec<HourlyReading>, LoadOutcome), SnapshotError> {
        let remote_rev = match self.remote.revision(&self.remote_path) {
            Ok(rev) => rev,
            Err(e) => {
                let err = SnapshotError::RemoteMetadata(Box::new(e));
                if !self.cache_file.is_file() {
                    return Err(SnapshotError::DataUnavailable(Box::new(err)));
                }
                warn!("{}; using existing cache at {}", err, self.cache_file.display());
                // Neither side can produce a table when the cache is unreadable too.
                let rows = store::load_readings(&self.cache_file)
                    .map_err(|e| SnapshotError::DataUnavailable(Box::new(SnapshotError::Table(e))))?;
                return Ok((rows, LoadOutcome::StaleFallback));
            }
        };

        if let Some(local_rev) = self.local_revision()
            && local_rev == remote_rev
            && self.cache_file.is_file()
        {
            match store::load_readings(&self.cache_file) {
                Ok(rows) => {
                    info!("Local snapshot is up to date (rev {})", remote_rev);
                    return Ok((rows, LoadOutcome::UpToDate { revision: remote_rev }));
                }
                Err(e) => warn!(
                    "Cached snapshot {} is unreadable ({}); downloading rev {} again",
                    self.cache_file.display(),
                    e,
                    remote_rev
                ),
            }
        }

        info!(
            "New snapshot revision {} detected; downloading {}",
            remote_rev, self.remote_path
        );
        let (rows, revision, bytes) = self.download_and_replace(&remote_rev)?;
        info!("Download complete ({} bytes, rev {})", bytes, revision);
        Ok((rows, LoadOutcome::Downloaded { revision, bytes }))
    }

    fn local_revision(&self) -> Option<String> {
        let raw = fs::read_to_string(&self.revision_file).ok()?;
        let rev = raw.trim();
        (!rev.is_empty()).then(|| rev.to_string())
    }

    fn cache_dir(&self) -> &Path {
        match self.cache_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    /// Download into a temp file next to the cache, check it, then swap it in
    /// and record its revision. The old file and marker are untouched on error.
    fn download_and_replace(&self, expected_rev: &str) -> Result<(Vec<HourlyReading>, String, u64), DownloadError> {
        let dir = self.cache_dir();
        fs::create_dir_all(dir)?;

        let mut object = self
            .remote
            .download(&self.remote_path)
            .map_err(|e| DownloadError::Remote(Box::new(e)))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".snapshot-")
            .suffix(".partial")
            .tempfile_in(dir)?;
        let received = io::copy(&mut object.body, tmp.as_file_mut())?;
        if let Some(expected) = object.size
            && expected != received
        {
            return Err(DownloadError::Truncated { expected, received });
        }
        tmp.as_file_mut().sync_all()?;

        let rows = store::load_readings(tmp.path()).map_err(DownloadError::Corrupt)?;

        // The revision served with the body wins over the one looked up earlier.
        let revision = object.revision.unwrap_or_else(|| expected_rev.to_string());

        tmp.persist(&self.cache_file).map_err(|e| DownloadError::Io(e.error))?;
        write_atomically(dir, &self.revision_file, revision.as_bytes())?;

        Ok((rows, revision, received))
    }
}

fn write_atomically(dir: &Path, target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::reading;
    use std::cell::{Cell, RefCell};
    use std::io::Cursor;

    #[derive(Debug)]
    struct FakeError(&'static str);

    impl Display for FakeError {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Error for FakeError {}

    /// In-memory remote serving a fixed revision and body.
    struct FakeRemote {
        revision: RefCell<Result<String, &'static str>>,
        body: RefCell<Vec<u8>>,
        /// Overrides the advertised size to simulate a cut-off transfer.
        advertised_size: Cell<Option<u64>>,
        revision_calls: Cell<usize>,
        download_calls: Cell<usize>,
    }

    impl FakeRemote {
        fn new(revision: &str, body: Vec<u8>) -> Self {
            FakeRemote {
                revision: RefCell::new(Ok(revision.to_string())),
                body: RefCell::new(body),
                advertised_size: Cell::new(None),
                revision_calls: Cell::new(0),
                download_calls: Cell::new(0),
            }
        }
    }

    impl RemoteStorage for FakeRemote {
        type Error = FakeError;

        fn revision(&self, _path: &str) -> Result<String, FakeError> {
            self.revision_calls.set(self.revision_calls.get() + 1);
            self.revision.borrow().clone().map_err(FakeError)
        }

        fn download(&self, _path: &str) -> Result<RemoteObject, FakeError> {
            self.download_calls.set(self.download_calls.get() + 1);
            let body = self.body.borrow().clone();
            let size = self.advertised_size.get().unwrap_or(body.len() as u64);
            Ok(RemoteObject {
                revision: self.revision.borrow().clone().ok(),
                size: Some(size),
                body: Box::new(Cursor::new(body)),
            })
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        cache_file: PathBuf,
        revision_file: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache_file = dir.path().join("cache").join("air_quality.sqlite");
            let revision_file = dir.path().join("cache").join("air_quality.rev");
            Fixture {
                dir,
                cache_file,
                revision_file,
            }
        }

        fn cache(&self, remote: FakeRemote) -> SnapshotCache<FakeRemote> {
            SnapshotCache::new(remote, "/air.sqlite", self.cache_file.clone(), self.revision_file.clone())
        }

        /// Seed the local cache with `rows` under revision `rev`.
        fn seed_local(&self, rows: &[HourlyReading], rev: &str) {
            fs::create_dir_all(self.cache_file.parent().unwrap()).unwrap();
            store::tests::write_snapshot(&self.cache_file, rows).unwrap();
            fs::write(&self.revision_file, rev).unwrap();
        }

        /// Bytes of a snapshot file holding `rows`.
        fn snapshot_bytes(&self, rows: &[HourlyReading]) -> Vec<u8> {
            let path = self.dir.path().join(format!("remote-{}.sqlite", rows.len()));
            store::tests::write_snapshot(&path, rows).unwrap();
            fs::read(path).unwrap()
        }
    }

    fn local_rows() -> Vec<HourlyReading> {
        vec![reading("sensor_01", "93701", (2024, 1, 15, 0), 40.0)]
    }

    fn remote_rows() -> Vec<HourlyReading> {
        vec![
            reading("sensor_01", "93701", (2024, 1, 15, 0), 40.0),
            reading("sensor_02", "93702", (2024, 1, 16, 0), 60.0),
        ]
    }

    #[test]
    fn matching_revision_reads_local_file_without_download() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1\n");
        let before = fs::read(&fx.cache_file).unwrap();
        let remote = FakeRemote::new("rev-1", fx.snapshot_bytes(&remote_rows()));

        let mut cache = fx.cache(remote);
        let rows = cache.load_readings().unwrap().to_vec();

        assert_eq!(rows, local_rows());
        assert_eq!(cache.remote.download_calls.get(), 0);
        assert_eq!(
            cache.last_outcome(),
            Some(&LoadOutcome::UpToDate {
                revision: "rev-1".into()
            })
        );
        assert_eq!(fs::read(&fx.cache_file).unwrap(), before);
    }

    #[test]
    fn changed_revision_downloads_once_and_updates_marker() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        let remote = FakeRemote::new("rev-2", fx.snapshot_bytes(&remote_rows()));

        let mut cache = fx.cache(remote);
        let rows = cache.load_readings().unwrap().to_vec();

        assert_eq!(rows, remote_rows());
        assert_eq!(cache.remote.download_calls.get(), 1);
        assert_eq!(fs::read_to_string(&fx.revision_file).unwrap(), "rev-2");
        assert_eq!(store::load_readings(&fx.cache_file).unwrap(), remote_rows());
        assert!(matches!(cache.last_outcome(), Some(LoadOutcome::Downloaded { .. })));
    }

    #[test]
    fn empty_cache_directory_is_populated() {
        let fx = Fixture::new();
        let remote = FakeRemote::new("rev-9", fx.snapshot_bytes(&remote_rows()));

        let mut cache = fx.cache(remote);
        assert_eq!(cache.load_readings().unwrap().len(), 2);
        assert_eq!(cache.remote.download_calls.get(), 1);
        assert_eq!(fs::read_to_string(&fx.revision_file).unwrap(), "rev-9");
    }

    #[test]
    fn cache_file_without_marker_is_refreshed() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        fs::remove_file(&fx.revision_file).unwrap();
        let remote = FakeRemote::new("rev-1", fx.snapshot_bytes(&remote_rows()));

        let mut cache = fx.cache(remote);
        assert_eq!(cache.load_readings().unwrap().len(), 2);
        assert_eq!(cache.remote.download_calls.get(), 1);
    }

    #[test]
    fn truncated_download_leaves_cache_and_marker_untouched() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        let file_before = fs::read(&fx.cache_file).unwrap();
        let marker_before = fs::read(&fx.revision_file).unwrap();

        let bytes = fx.snapshot_bytes(&remote_rows());
        let full_len = bytes.len() as u64;
        let remote = FakeRemote::new("rev-2", bytes[..bytes.len() / 2].to_vec());
        remote.advertised_size.set(Some(full_len));

        let mut cache = fx.cache(remote);
        let err = cache.load_readings().unwrap_err();

        assert!(matches!(
            err,
            SnapshotError::Download(DownloadError::Truncated { expected, .. }) if expected == full_len
        ));
        assert_eq!(fs::read(&fx.cache_file).unwrap(), file_before);
        assert_eq!(fs::read(&fx.revision_file).unwrap(), marker_before);
        assert_eq!(leftover_partials(&fx), 0);
    }

    #[test]
    fn corrupt_download_leaves_cache_and_marker_untouched() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        let file_before = fs::read(&fx.cache_file).unwrap();
        let remote = FakeRemote::new("rev-2", vec![0x5a; 4096]);

        let mut cache = fx.cache(remote);
        let err = cache.load_readings().unwrap_err();

        assert!(matches!(err, SnapshotError::Download(DownloadError::Corrupt(_))));
        assert_eq!(fs::read(&fx.cache_file).unwrap(), file_before);
        assert_eq!(fs::read_to_string(&fx.revision_file).unwrap(), "rev-1");
    }

    #[test]
    fn metadata_failure_falls_back_to_local_cache() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        let remote = FakeRemote::new("unused", Vec::new());
        *remote.revision.borrow_mut() = Err("network unreachable");

        let mut cache = fx.cache(remote);
        let rows = cache.load_readings().unwrap().to_vec();

        assert_eq!(rows, local_rows());
        assert_eq!(cache.last_outcome(), Some(&LoadOutcome::StaleFallback));
        assert_eq!(cache.remote.download_calls.get(), 0);
    }

    #[test]
    fn metadata_failure_without_cache_is_data_unavailable() {
        let fx = Fixture::new();
        let remote = FakeRemote::new("unused", Vec::new());
        *remote.revision.borrow_mut() = Err("401 unauthorized");

        let mut cache = fx.cache(remote);
        let err = cache.load_readings().unwrap_err();

        match err {
            SnapshotError::DataUnavailable(inner) => {
                assert!(matches!(*inner, SnapshotError::RemoteMetadata(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn unreadable_cache_with_current_marker_is_downloaded_again() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        fs::write(&fx.cache_file, vec![0x5a_u8; 4096]).unwrap();
        let bytes = fx.snapshot_bytes(&remote_rows());
        let size = bytes.len() as u64;
        let remote = FakeRemote::new("rev-1", bytes);

        let mut cache = fx.cache(remote);
        let rows = cache.load_readings().unwrap().to_vec();

        assert_eq!(rows, remote_rows());
        assert_eq!(cache.remote.download_calls.get(), 1);
        assert_eq!(
            cache.last_outcome(),
            Some(&LoadOutcome::Downloaded {
                revision: "rev-1".into(),
                bytes: size
            })
        );
        assert_eq!(store::load_readings(&fx.cache_file).unwrap(), remote_rows());
    }

    #[test]
    fn metadata_failure_with_unreadable_cache_is_data_unavailable() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        fs::write(&fx.cache_file, vec![0x5a_u8; 4096]).unwrap();
        let remote = FakeRemote::new("unused", Vec::new());
        *remote.revision.borrow_mut() = Err("network unreachable");

        let mut cache = fx.cache(remote);
        let err = cache.load_readings().unwrap_err();

        match err {
            SnapshotError::DataUnavailable(inner) => {
                assert!(matches!(*inner, SnapshotError::Table(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(cache.remote.download_calls.get(), 0);
    }

    #[test]
    fn loads_are_memoized_until_invalidated() {
        let fx = Fixture::new();
        fx.seed_local(&local_rows(), "rev-1");
        let remote = FakeRemote::new("rev-1", fx.snapshot_bytes(&remote_rows()));

        let mut cache = fx.cache(remote);
        cache.load_readings().unwrap();
        cache.load_readings().unwrap();
        assert_eq!(cache.remote.revision_calls.get(), 1);

        // Remote moves on; the memo hides it until invalidated.
        *cache.remote.revision.borrow_mut() = Ok("rev-2".into());
        assert_eq!(cache.load_readings().unwrap().len(), 1);
        assert_eq!(cache.remote.revision_calls.get(), 1);

        cache.invalidate();
        assert_eq!(cache.load_readings().unwrap().len(), 2);
        assert_eq!(cache.remote.revision_calls.get(), 2);
        assert_eq!(cache.remote.download_calls.get(), 1);
    }

    fn leftover_partials(fx: &Fixture) -> usize {
        fs::read_dir(fx.cache_file.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .count()
    }
}
