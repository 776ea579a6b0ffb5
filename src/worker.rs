use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_DELAY_SECS, DEFAULT_LIMIT};
use crate::errors::{Result, TaggrabError};
use crate::fetch::{Download, Fetcher, guess_extension};
use crate::hash::{ContentHasher, url_hash};
use crate::source::{Candidate, Credentials, MediaSource, normalize_term};
use crate::storage::MediaTracker;
use crate::storage::models::{MediaKind, MediaRecord, NewMedia};

pub const DEFAULT_SEARCH_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const CHUNK_SIZE: usize = 64 * 1024;
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Cooperative stop flag shared between the worker and whoever drives it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sleep for `duration` in short steps. Returns false if cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_STEP.min(deadline - now));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaSelection {
    pub photos: bool,
    pub videos: bool,
}

impl Default for MediaSelection {
    fn default() -> Self {
        Self { photos: true, videos: true }
    }
}

impl MediaSelection {
    pub fn accepts(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Photo => self.photos,
            MediaKind::Video => self.videos,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.photos && !self.videos
    }
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub term: String,
    pub download_dir: PathBuf,
    pub limit: usize,
    pub selection: MediaSelection,
    pub delay: Duration,
    pub search_attempts: u32,
    pub retry_backoff: Duration,
    pub credentials: Credentials,
}

impl DownloadJob {
    pub fn new(term: &str, download_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            term: normalize_term(term)?,
            download_dir,
            limit: DEFAULT_LIMIT,
            selection: MediaSelection::default(),
            delay: Duration::from_secs(DEFAULT_DELAY_SECS),
            search_attempts: DEFAULT_SEARCH_ATTEMPTS,
            retry_backoff: RETRY_BACKOFF,
            credentials: Credentials::default(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(TaggrabError::InvalidInput("a download directory is required".into()));
        }
        if self.selection.is_empty() {
            return Err(TaggrabError::InvalidInput(
                "select at least one media type (photos or videos)".into(),
            ));
        }
        if self.limit == 0 {
            return Err(TaggrabError::InvalidInput("limit must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDownloaded,
}

/// Progress reported from the worker to the thread rendering it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Status { message: String },
    Found { total: usize },
    Downloaded { count: usize, media_id: String, path: String, bytes: u64 },
    Skipped { media_id: String, reason: SkipReason },
    ItemFailed { media_id: String, error: String },
    Finished { summary: Summary },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub downloaded: usize,
    /// Already-downloaded items plus failed ones.
    pub skipped: usize,
    pub failed: usize,
    pub filtered: usize,
    pub cancelled: bool,
}

enum Outcome {
    Downloaded(MediaRecord),
    AlreadyDownloaded,
    Filtered,
}

struct Written {
    bytes: u64,
    sha256: String,
}

pub struct Downloader<S, F, T> {
    job: DownloadJob,
    source: S,
    fetcher: F,
    tracker: T,
    cancel: CancelToken,
    events: Sender<Event>,
}

impl<S, F, T> Downloader<S, F, T>
where
    S: MediaSource,
    F: Fetcher,
    T: MediaTracker,
{
    pub fn new(job: DownloadJob, source: S, fetcher: F, tracker: T, events: Sender<Event>) -> Self {
        Self {
            job,
            source,
            fetcher,
            tracker,
            cancel: CancelToken::new(),
            events,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn into_tracker(self) -> T {
        self.tracker
    }

    /// Login, search, then download each candidate in turn.
    ///
    /// Login failure, an exhausted search, or an empty result page end the
    /// run with an error. Anything that goes wrong with a single item is
    /// reported and the batch moves on. Logout runs on every path.
    pub fn run(&mut self) -> Result<Summary> {
        let outcome = self.login_and_download();
        self.source.logout();
        if let Err(ref e) = outcome {
            warn!(error = %e, "download run aborted");
        }
        outcome
    }

    fn emit(&self, event: Event) {
        // The receiver going away just means nobody is watching any more.
        let _ = self.events.send(event);
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.emit(Event::Status { message });
    }

    fn login_and_download(&mut self) -> Result<Summary> {
        self.job.validate()?;
        let platform = self.source.platform();

        self.status(format!("Logging in to {}...", platform.as_str()));
        self.source
            .login(&self.job.credentials)
            .map_err(|e| match e {
                TaggrabError::Login(_) => e,
                other => TaggrabError::Login(other.to_string()),
            })?;
        self.status("Login successful");

        self.status(format!("Searching media for #{}...", self.job.term));
        let candidates = self.search_with_retry()?;
        if candidates.is_empty() {
            return Err(TaggrabError::NoResults(format!(
                "no media found for #{}",
                self.job.term
            )));
        }
        self.emit(Event::Found { total: candidates.len() });

        fs::create_dir_all(&self.job.download_dir)?;

        let mut summary = Summary::default();
        let last = candidates.len() - 1;
        for (i, candidate) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            match self.process(candidate, summary.downloaded) {
                Ok(Outcome::Downloaded(record)) => {
                    summary.downloaded += 1;
                    self.emit(Event::Downloaded {
                        count: summary.downloaded,
                        media_id: record.media_id,
                        path: record.file_path,
                        bytes: record.size_bytes as u64,
                    });
                }
                Ok(Outcome::AlreadyDownloaded) => {
                    summary.skipped += 1;
                    debug!(media_id = %candidate.media_id, "already downloaded");
                    self.emit(Event::Skipped {
                        media_id: candidate.media_id.clone(),
                        reason: SkipReason::AlreadyDownloaded,
                    });
                    continue;
                }
                Ok(Outcome::Filtered) => {
                    summary.filtered += 1;
                    continue;
                }
                Err(TaggrabError::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    summary.skipped += 1;
                    summary.failed += 1;
                    warn!(media_id = %candidate.media_id, error = %e, "media download failed");
                    self.emit(Event::ItemFailed {
                        media_id: candidate.media_id.clone(),
                        error: e.to_string(),
                    });
                }
            }

            // Rate limiting between network fetches.
            if i < last && !self.cancel.sleep(self.job.delay) {
                summary.cancelled = true;
                break;
            }
        }

        info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "download run finished"
        );
        self.emit(Event::Finished { summary });
        Ok(summary)
    }

    fn search_with_retry(&mut self) -> Result<Vec<Candidate>> {
        let attempts = self.job.search_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.source.search(&self.job.term, self.job.limit) {
                Ok(mut found) => {
                    found.truncate(self.job.limit);
                    return Ok(found);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "search failed");
                    self.status(format!("Search attempt {}/{} failed: {}", attempt, attempts, e));
                    last_error = Some(e);
                }
            }
            if attempt < attempts && !self.cancel.sleep(self.job.retry_backoff * attempt) {
                return Err(TaggrabError::Cancelled);
            }
        }
        Err(last_error.unwrap_or_else(|| TaggrabError::NoResults(self.job.term.clone())))
    }

    fn process(&mut self, candidate: &Candidate, downloaded_so_far: usize) -> Result<Outcome> {
        if !self.job.selection.accepts(candidate.kind) {
            return Ok(Outcome::Filtered);
        }
        let Some(url) = candidate.url.as_deref() else {
            debug!(media_id = %candidate.media_id, "no download url");
            return Ok(Outcome::Filtered);
        };
        if self
            .tracker
            .is_downloaded(candidate.platform, &candidate.media_id, url)?
        {
            return Ok(Outcome::AlreadyDownloaded);
        }

        let ext = guess_extension(url, candidate.kind);
        let stem = file_stem(&self.job.term, downloaded_so_far);
        let dest = unique_path(&self.job.download_dir, &stem, &ext);

        let download = self.fetcher.open(url)?;
        let written = write_download(download, &dest, &self.cancel)?;

        let recorded = self.tracker.record(NewMedia {
            url_hash: url_hash(url),
            media_id: candidate.media_id.clone(),
            source_url: url.to_string(),
            file_path: dest.to_string_lossy().to_string(),
            kind: candidate.kind,
            platform: candidate.platform,
            search_term: self.job.term.clone(),
            size_bytes: written.bytes as i64,
            sha256: Some(written.sha256),
        });
        match recorded {
            Ok(record) => Ok(Outcome::Downloaded(record)),
            Err(e) => {
                // A file on disk without a record would be fetched again next
                // run under another name.
                let _ = fs::remove_file(&dest);
                Err(e)
            }
        }
    }
}

/// `<term>_<YYYYmmdd_HHMMSS>_<n>`, with the term made safe for file names.
fn file_stem(term: &str, index: usize) -> String {
    let safe: String = term
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}_{}", safe, timestamp, index)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{}{}", stem, ext));
    let mut n = 1;
    while candidate.exists() || part_path(&candidate).exists() {
        candidate = dir.join(format!("{}_{}{}", stem, n, ext));
        n += 1;
    }
    candidate
}

/// Stream into `<dest>.part`, then rename into place once every byte is in.
/// The part file never outlives a failure or a cancel.
fn write_download(download: Download, dest: &Path, cancel: &CancelToken) -> Result<Written> {
    let part = part_path(dest);
    let result = copy_to_part(download, &part, cancel).and_then(|written| {
        fs::rename(&part, dest)?;
        Ok(written)
    });
    if result.is_err() {
        let _ = fs::remove_file(&part);
    }
    result
}

fn copy_to_part(download: Download, part: &Path, cancel: &CancelToken) -> Result<Written> {
    let Download {
        mut reader,
        content_length,
    } = download;
    let mut file = File::create(part)?;
    let mut hasher = ContentHasher::new();
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(TaggrabError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        file.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    file.flush()?;

    if let Some(expected) = content_length {
        if total != expected {
            return Err(TaggrabError::Http(format!(
                "incomplete download: got {} of {} bytes",
                total, expected
            )));
        }
    }
    if total == 0 {
        return Err(TaggrabError::Http("empty response body".into()));
    }
    Ok(Written {
        bytes: total,
        sha256: hasher.finish(),
    })
}

pub struct WorkerHandle {
    cancel: CancelToken,
    events: Receiver<Event>,
    thread: JoinHandle<Result<Summary>>,
}

impl WorkerHandle {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn join(self) -> Result<Summary> {
        self.thread
            .join()
            .map_err(|_| TaggrabError::Config("download worker panicked".into()))?
    }
}

/// Run a download job on its own thread, reporting through the returned handle.
pub fn spawn<S, F, T>(job: DownloadJob, source: S, fetcher: F, tracker: T) -> Result<WorkerHandle>
where
    S: MediaSource + Send + 'static,
    F: Fetcher + 'static,
    T: MediaTracker + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let mut downloader = Downloader::new(job, source, fetcher, tracker, tx);
    let cancel = downloader.cancel_token();
    let thread = thread::Builder::new()
        .name("taggrab-worker".into())
        .spawn(move || downloader.run())?;
    Ok(WorkerHandle {
        cancel,
        events: rx,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::Platform;
    use crate::storage::sqlite::SqliteTracker;
    use std::collections::{HashMap, HashSet};
    use std::io::Cursor;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockSource {
        candidates: Vec<Candidate>,
        fail_login: bool,
        search_failures: u32,
        search_calls: u32,
        logged_out: bool,
    }

    impl MediaSource for MockSource {
        fn platform(&self) -> Platform {
            Platform::Instagram
        }

        fn login(&mut self, _credentials: &Credentials) -> Result<()> {
            if self.fail_login {
                return Err(TaggrabError::Http("connection refused".into()));
            }
            Ok(())
        }

        fn search(&mut self, _term: &str, limit: usize) -> Result<Vec<Candidate>> {
            self.search_calls += 1;
            if self.search_calls <= self.search_failures {
                return Err(TaggrabError::Http("429 too many requests".into()));
            }
            Ok(self.candidates.iter().take(limit).cloned().collect())
        }

        fn logout(&mut self) {
            self.logged_out = true;
        }
    }

    /// Cancels the run on its first read, after handing over one chunk.
    struct CancellingReader {
        inner: Cursor<Vec<u8>>,
        cancel: CancelToken,
    }

    impl Read for CancellingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.cancel.cancel();
            self.inner.read(buf)
        }
    }

    #[derive(Default)]
    struct MockFetcher {
        bodies: HashMap<String, Vec<u8>>,
        failing: HashSet<String>,
        short: HashSet<String>,
        cancel_on: Option<(String, CancelToken)>,
    }

    impl MockFetcher {
        fn serving(urls: &[&str]) -> Self {
            let bodies = urls
                .iter()
                .map(|u| (u.to_string(), format!("bytes of {}", u).into_bytes()))
                .collect();
            Self { bodies, ..Default::default() }
        }
    }

    impl Fetcher for MockFetcher {
        fn open(&self, url: &str) -> Result<Download> {
            if self.failing.contains(url) {
                return Err(TaggrabError::Http(format!("download failed: {} (status=404)", url)));
            }
            let body = self
                .bodies
                .get(url)
                .cloned()
                .ok_or_else(|| TaggrabError::Http(format!("unknown url {}", url)))?;
            let len = body.len() as u64;
            if let Some((cancel_url, token)) = &self.cancel_on {
                if cancel_url == url {
                    return Ok(Download {
                        reader: Box::new(CancellingReader {
                            inner: Cursor::new(body),
                            cancel: token.clone(),
                        }),
                        content_length: Some(len),
                    });
                }
            }
            let content_length = if self.short.contains(url) { Some(len + 100) } else { Some(len) };
            Ok(Download {
                reader: Box::new(Cursor::new(body)),
                content_length,
            })
        }
    }

    fn candidate(id: &str, kind: MediaKind, url: Option<&str>) -> Candidate {
        Candidate {
            media_id: id.to_string(),
            kind,
            url: url.map(String::from),
            platform: Platform::Instagram,
        }
    }

    fn job(dir: &Path) -> DownloadJob {
        let mut job = DownloadJob::new("#cats", dir.to_path_buf()).unwrap();
        job.delay = Duration::ZERO;
        job.retry_backoff = Duration::ZERO;
        job
    }

    fn three_candidates() -> Vec<Candidate> {
        vec![
            candidate("1", MediaKind::Photo, Some("https://cdn/1.jpg")),
            candidate("2", MediaKind::Video, Some("https://cdn/2.mp4")),
            candidate("3", MediaKind::Photo, Some("https://cdn/3.jpg")),
        ]
    }

    fn downloader(
        job: DownloadJob,
        source: MockSource,
        fetcher: MockFetcher,
        tracker: SqliteTracker,
    ) -> (Downloader<MockSource, MockFetcher, SqliteTracker>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Downloader::new(job, source, fetcher, tracker, tx), rx)
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_downloads_and_records_new_items() {
        let dir = TempDir::new().unwrap();
        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let fetcher = MockFetcher::serving(&["https://cdn/1.jpg", "https://cdn/2.mp4", "https://cdn/3.jpg"]);
        let (mut dl, rx) = downloader(job(dir.path()), source, fetcher, SqliteTracker::in_memory().unwrap());

        let summary = dl.run().unwrap();
        assert_eq!(summary.downloaded, 3);
        assert_eq!(summary.skipped, 0);
        assert!(!summary.cancelled);
        assert!(dl.source.logged_out);

        let names = files_in(dir.path());
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n.starts_with("cats_")));
        assert!(names.iter().any(|n| n.ends_with("_1.mp4")));

        let record = dl.tracker.find_by_hash(&url_hash("https://cdn/2.mp4")).unwrap().unwrap();
        assert_eq!(record.kind, MediaKind::Video);
        assert_eq!(record.search_term, "cats");
        assert_eq!(record.size_bytes, "bytes of https://cdn/2.mp4".len() as i64);
        assert_eq!(
            record.sha256.as_deref(),
            Some(crate::hash::hash_content(b"bytes of https://cdn/2.mp4").as_str())
        );
        assert_eq!(fs::read(&record.file_path).unwrap(), b"bytes of https://cdn/2.mp4");

        let events: Vec<Event> = rx.try_iter().collect();
        assert!(events.contains(&Event::Found { total: 3 }));
        assert_eq!(events.last(), Some(&Event::Finished { summary }));
    }

    #[test]
    fn test_second_run_downloads_nothing() {
        let dir = TempDir::new().unwrap();
        let urls = ["https://cdn/1.jpg", "https://cdn/2.mp4", "https://cdn/3.jpg"];
        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let (mut first, _rx) =
            downloader(job(dir.path()), source, MockFetcher::serving(&urls), SqliteTracker::in_memory().unwrap());
        first.run().unwrap();
        let tracker = first.into_tracker();

        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let (mut second, rx) = downloader(job(dir.path()), source, MockFetcher::serving(&urls), tracker);
        let summary = second.run().unwrap();
        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(files_in(dir.path()).len(), 3);
        assert_eq!(second.tracker.stats().unwrap().total, 3);

        let skips = rx
            .try_iter()
            .filter(|e| matches!(e, Event::Skipped { reason: SkipReason::AlreadyDownloaded, .. }))
            .count();
        assert_eq!(skips, 3);
    }

    #[test]
    fn test_same_url_twice_in_one_page_downloads_once() {
        let dir = TempDir::new().unwrap();
        let source = MockSource {
            candidates: vec![
                candidate("1", MediaKind::Photo, Some("https://cdn/1.jpg")),
                candidate("1b", MediaKind::Photo, Some("https://cdn/1.jpg")),
            ],
            ..Default::default()
        };
        let (mut dl, _rx) = downloader(
            job(dir.path()),
            source,
            MockFetcher::serving(&["https://cdn/1.jpg"]),
            SqliteTracker::in_memory().unwrap(),
        );
        let summary = dl.run().unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(files_in(dir.path()).len(), 1);
    }

    #[test]
    fn test_filters_by_kind_and_missing_url() {
        let dir = TempDir::new().unwrap();
        let mut candidates = three_candidates();
        candidates.push(candidate("4", MediaKind::Photo, None));
        let source = MockSource { candidates, ..Default::default() };
        let mut job = job(dir.path());
        job.selection = MediaSelection { photos: true, videos: false };
        let (mut dl, _rx) = downloader(
            job,
            source,
            MockFetcher::serving(&["https://cdn/1.jpg", "https://cdn/3.jpg"]),
            SqliteTracker::in_memory().unwrap(),
        );
        let summary = dl.run().unwrap();
        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.filtered, 2);
        assert_eq!(summary.skipped, 0);
        assert!(files_in(dir.path()).iter().all(|n| n.ends_with(".jpg")));
    }

    #[test]
    fn test_item_failure_skips_and_continues() {
        let dir = TempDir::new().unwrap();
        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let mut fetcher = MockFetcher::serving(&["https://cdn/1.jpg", "https://cdn/3.jpg"]);
        fetcher.failing.insert("https://cdn/2.mp4".into());
        let (mut dl, rx) = downloader(job(dir.path()), source, fetcher, SqliteTracker::in_memory().unwrap());

        let summary = dl.run().unwrap();
        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert!(!dl.tracker.is_downloaded(Platform::Instagram, "2", "https://cdn/2.mp4").unwrap());
        assert!(rx.try_iter().any(|e| matches!(e, Event::ItemFailed { ref media_id, .. } if media_id == "2")));
    }

    #[test]
    fn test_incomplete_download_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let source = MockSource {
            candidates: vec![candidate("1", MediaKind::Photo, Some("https://cdn/1.jpg"))],
            ..Default::default()
        };
        let mut fetcher = MockFetcher::serving(&["https://cdn/1.jpg"]);
        fetcher.short.insert("https://cdn/1.jpg".into());
        let (mut dl, _rx) = downloader(job(dir.path()), source, fetcher, SqliteTracker::in_memory().unwrap());

        let summary = dl.run().unwrap();
        assert_eq!(summary.failed, 1);
        assert!(files_in(dir.path()).is_empty());
        assert_eq!(dl.tracker.stats().unwrap().total, 0);
    }

    #[test]
    fn test_cancel_mid_download_discards_partial_file() {
        let dir = TempDir::new().unwrap();
        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let urls = ["https://cdn/1.jpg", "https://cdn/2.mp4", "https://cdn/3.jpg"];
        let (tx, rx) = mpsc::channel();
        let mut dl = Downloader::new(
            job(dir.path()),
            source,
            MockFetcher::default(),
            SqliteTracker::in_memory().unwrap(),
            tx,
        );
        let mut fetcher = MockFetcher::serving(&urls);
        fetcher.cancel_on = Some(("https://cdn/2.mp4".into(), dl.cancel_token()));
        dl.fetcher = fetcher;

        let summary = dl.run().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.failed, 0);
        assert!(dl.source.logged_out);

        let names = files_in(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".jpg"));
        assert!(!dl.tracker.is_downloaded(Platform::Instagram, "2", "https://cdn/2.mp4").unwrap());
        assert!(matches!(rx.try_iter().last(), Some(Event::Finished { .. })));
    }

    #[test]
    fn test_cancel_before_start_downloads_nothing() {
        let dir = TempDir::new().unwrap();
        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let (mut dl, _rx) = downloader(
            job(dir.path()),
            source,
            MockFetcher::serving(&["https://cdn/1.jpg"]),
            SqliteTracker::in_memory().unwrap(),
        );
        dl.cancel_token().cancel();
        let summary = dl.run().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.downloaded, 0);
    }

    #[test]
    fn test_login_failure_is_fatal_and_still_logs_out() {
        let dir = TempDir::new().unwrap();
        let source = MockSource {
            candidates: three_candidates(),
            fail_login: true,
            ..Default::default()
        };
        let (mut dl, _rx) =
            downloader(job(dir.path()), source, MockFetcher::default(), SqliteTracker::in_memory().unwrap());
        let result = dl.run();
        assert!(matches!(result, Err(TaggrabError::Login(_))));
        assert_eq!(dl.source.search_calls, 0);
        assert!(dl.source.logged_out);
    }

    #[test]
    fn test_empty_results_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (mut dl, rx) = downloader(
            job(dir.path()),
            MockSource::default(),
            MockFetcher::default(),
            SqliteTracker::in_memory().unwrap(),
        );
        let result = dl.run();
        assert!(matches!(result, Err(TaggrabError::NoResults(_))));
        assert!(dl.source.logged_out);
        assert!(!rx.try_iter().any(|e| matches!(e, Event::Finished { .. })));
    }

    #[test]
    fn test_search_retried_until_success() {
        let dir = TempDir::new().unwrap();
        let source = MockSource {
            candidates: three_candidates(),
            search_failures: 2,
            ..Default::default()
        };
        let urls = ["https://cdn/1.jpg", "https://cdn/2.mp4", "https://cdn/3.jpg"];
        let (mut dl, _rx) =
            downloader(job(dir.path()), source, MockFetcher::serving(&urls), SqliteTracker::in_memory().unwrap());
        let summary = dl.run().unwrap();
        assert_eq!(dl.source.search_calls, 3);
        assert_eq!(summary.downloaded, 3);
    }

    #[test]
    fn test_search_gives_up_after_bounded_attempts() {
        let dir = TempDir::new().unwrap();
        let source = MockSource {
            candidates: three_candidates(),
            search_failures: 10,
            ..Default::default()
        };
        let (mut dl, _rx) =
            downloader(job(dir.path()), source, MockFetcher::default(), SqliteTracker::in_memory().unwrap());
        let result = dl.run();
        assert!(matches!(result, Err(TaggrabError::Http(_))));
        assert_eq!(dl.source.search_calls, DEFAULT_SEARCH_ATTEMPTS);
        assert!(dl.source.logged_out);
    }

    #[test]
    fn test_limit_bounds_the_page() {
        let dir = TempDir::new().unwrap();
        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let mut job = job(dir.path());
        job.limit = 2;
        let (mut dl, _rx) = downloader(
            job,
            source,
            MockFetcher::serving(&["https://cdn/1.jpg", "https://cdn/2.mp4"]),
            SqliteTracker::in_memory().unwrap(),
        );
        assert_eq!(dl.run().unwrap().downloaded, 2);
    }

    #[test]
    fn test_validate_rejects_empty_selection() {
        let dir = TempDir::new().unwrap();
        let mut job = job(dir.path());
        job.selection = MediaSelection { photos: false, videos: false };
        assert!(matches!(job.validate(), Err(TaggrabError::InvalidInput(_))));
    }

    #[test]
    fn test_spawn_reports_over_channel() {
        let dir = TempDir::new().unwrap();
        let source = MockSource { candidates: three_candidates(), ..Default::default() };
        let urls = ["https://cdn/1.jpg", "https://cdn/2.mp4", "https://cdn/3.jpg"];
        let handle = spawn(
            job(dir.path()),
            source,
            MockFetcher::serving(&urls),
            SqliteTracker::in_memory().unwrap(),
        )
        .unwrap();

        let events: Vec<Event> = handle.events().iter().collect();
        let summary = handle.join().unwrap();
        assert_eq!(summary.downloaded, 3);
        let downloaded = events
            .iter()
            .filter(|e| matches!(e, Event::Downloaded { .. }))
            .count();
        assert_eq!(downloaded, 3);
        assert_eq!(events.last(), Some(&Event::Finished { summary }));
    }

    #[test]
    fn test_unique_path_avoids_collisions() {
        let dir = TempDir::new().unwrap();
        let first = unique_path(dir.path(), "cats_x_0", ".jpg");
        fs::write(&first, b"x").unwrap();
        let second = unique_path(dir.path(), "cats_x_0", ".jpg");
        assert_eq!(second, dir.path().join("cats_x_0_1.jpg"));
    }

    #[test]
    fn test_file_stem_sanitizes_term() {
        let stem = file_stem("street food/2024", 7);
        assert!(stem.starts_with("street_food_2024_"));
        assert!(stem.ends_with("_7"));
    }

    #[test]
    fn test_cancel_token_sleep() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(1)));
        token.cancel();
        assert!(!token.sleep(Duration::from_secs(5)));
    }
}
