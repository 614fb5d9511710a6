//! Parallel batch HTTP(S) download implementation.
//!
//! A [`Batch`] collects entries to download, each with an optional expected
//! size and SHA-1 used to verify the downloaded file. Running the batch
//! spawns a pool of detached workers fed through a shared work channel,
//! results are fanned back in and yielded to the caller in completion order.

use std::hash::{Hash, Hasher};
use std::iter::FusedIterator;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Instant;
use std::cmp::Reverse;
use std::sync::Arc;
use std::{io, thread};

use sha1::{Digest, Sha1};

use reqwest::{header, Client, StatusCode, Url};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::io::AsyncWriteExt;
use tokio::fs::{self, File};
use tokio::sync::Mutex;


/// Maximum number of attempts for a single entry, transport errors, bad
/// statuses and failed validations all consume one attempt.
const MAX_TRY_COUNT: usize = 3;

/// Maximum number of redirects a single entry can go through before being
/// considered not found.
const MAX_REDIRECT_COUNT: u8 = 5;

/// Smoothing factor of the exponential moving average of workers' speed.
const SPEED_SMOOTHING: f32 = 0.005;

/// Sort key for entries without declared size, such entries are scheduled as
/// if they were 1 MiB so they are downloaded early.
const FALLBACK_SORT_SIZE: u32 = 1_048_576;


/// A download entry to be pushed into a [`Batch`], describing the URL to
/// fetch, the file to write and the optional expectations used to verify the
/// downloaded content.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The URL to download the file from.
    url: Box<str>,
    /// The file where the downloaded content is written.
    file: Box<Path>,
    /// Optional expected size of the file.
    expected_size: Option<u32>,
    /// Optional expected SHA-1 of the file.
    expected_sha1: Option<[u8; 20]>,
    /// Optional display name, the URL is used when absent.
    name: Option<Box<str>>,
    /// True if the file should be made executable on systems where it's
    /// relevant to later execute a binary.
    executable: bool,
}

impl Entry {

    /// Create a new entry downloading the given URL to the given file.
    pub fn new(url: impl Into<Box<str>>, file: impl Into<Box<Path>>) -> Self {
        Self {
            url: url.into(),
            file: file.into(),
            expected_size: None,
            expected_sha1: None,
            name: None,
            executable: false,
        }
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn file(&self) -> &Path {
        &self.file
    }

    #[inline]
    pub fn expected_size(&self) -> Option<u32> {
        self.expected_size
    }

    #[inline]
    pub fn set_expected_size(&mut self, size: Option<u32>) -> &mut Self {
        self.expected_size = size;
        self
    }

    #[inline]
    pub fn expected_sha1(&self) -> Option<&[u8; 20]> {
        self.expected_sha1.as_ref()
    }

    #[inline]
    pub fn set_expected_sha1(&mut self, sha1: Option<[u8; 20]>) -> &mut Self {
        self.expected_sha1 = sha1;
        self
    }

    /// The display name of this entry, defaulting to its URL when no name
    /// has been set.
    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    #[inline]
    pub fn set_name(&mut self, name: impl Into<Box<str>>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    #[inline]
    pub fn executable(&self) -> bool {
        self.executable
    }

    #[inline]
    pub fn set_executable(&mut self, executable: bool) -> &mut Self {
        self.executable = executable;
        self
    }

}

/// Entries are identified by their URL, file, expected size and expected
/// SHA-1, the display name and executable flag are ignored. Because the
/// expectations are part of the identity they must not be modified once the
/// entry has been pushed into a batch.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
            && self.file == other.file
            && self.expected_size == other.expected_size
            && self.expected_sha1 == other.expected_sha1
    }
}

impl Eq for Entry { }

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.file.hash(state);
        self.expected_size.hash(state);
        self.expected_sha1.hash(state);
    }
}

/// Internal entry with its URL already parsed, ready to be dispatched to a
/// worker through the work channel.
#[derive(Debug, Clone)]
struct PreparedEntry {
    /// The parsed URL, its scheme is guaranteed to be HTTP or HTTPS.
    url: Url,
    /// Number of redirects this entry went through so far.
    redirects: u8,
    /// The original entry.
    entry: Entry,
}

impl PreparedEntry {

    fn from_entry(entry: Entry) -> Result<Self, InvalidUrlError> {
        let url = match Url::parse(&entry.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return Err(InvalidUrlError { url: entry.url }),
        };
        Ok(Self {
            url,
            redirects: 0,
            entry,
        })
    }

}

/// A list of pending downloads that can be all downloaded at once.
#[derive(Debug, Default)]
pub struct Batch {
    /// All entries to be downloaded.
    entries: Vec<PreparedEntry>,
    /// Cumulative size declared by entries, entries without expected size
    /// count as zero.
    total_size: u64,
}

impl Batch {

    /// Create a new empty download batch.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the total number of entries pushed into this download batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return true if this batch has no entry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cumulative size declared by the entries of this batch,
    /// entries without expected size are not counted.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Push a new entry to be downloaded in this batch.
    ///
    /// This fails if the entry's URL is not a valid HTTP or HTTPS URL. The
    /// result of two entries sharing the same destination file is
    /// unspecified, callers must ensure that destinations are unique.
    pub fn push(&mut self, entry: Entry) -> Result<(), InvalidUrlError> {
        let prepared = PreparedEntry::from_entry(entry)?;
        if let Some(size) = prepared.entry.expected_size {
            self.total_size += u64::from(size);
        }
        self.entries.push(prepared);
        Ok(())
    }

    /// Push a new entry like [`push`](Self::push), unless the destination
    /// file already exists as a regular file and the entry's expected size
    /// is either absent or equal to the on-disk size, in which case the
    /// entry is silently skipped.
    pub fn push_verify(&mut self, entry: Entry) -> Result<(), InvalidUrlError> {
        if let Ok(metadata) = entry.file.metadata() {
            if metadata.is_file() && entry.expected_size.is_none_or(|size| u64::from(size) == metadata.len()) {
                return Ok(());
            }
        }
        self.push(entry)
    }

    /// Remove all entries and reset the size counter.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0;
    }

    /// Start downloading this batch on the given number of workers and
    /// return the lazy sequence of results.
    ///
    /// Entries are dispatched biggest first to improve parallelization, and
    /// the returned sequence yields one `(count, result)` pair per entry, in
    /// completion order, with `count` running from 1 to the number of
    /// entries. The given number of workers is clamped between one and the
    /// number of entries. The batch keeps its entries, so a failed run can
    /// be retried.
    ///
    /// Workers are detached background tasks running on a runtime owned by
    /// the returned sequence, so this function must not be called from an
    /// asynchronous context, iterating would panic.
    pub fn start(&mut self, workers_count: usize) -> reqwest::Result<Downloads> {

        // Big files first for better parallelization at the start and less
        // blocking on stragglers at the end, unknown sizes go early too.
        self.entries.sort_by_key(|prepared| {
            Reverse(prepared.entry.expected_size.unwrap_or(FALLBACK_SORT_SIZE))
        });

        let entries_count = self.entries.len();

        if entries_count == 0 {
            let (_, results_rx) = mpsc::unbounded_channel();
            return Ok(Downloads {
                rt: None,
                work_tx: None,
                results_rx,
                workers_count: 0,
                entries_count: 0,
                count: 0,
            });
        }

        // At least one worker, but never more than the number of entries.
        let workers_count = workers_count.clamp(1, entries_count);

        let client = crate::http::client()?;
        let rt = crate::tokio::runtime();

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        // The work channel's receiver is shared by all workers.
        let work_rx = Arc::new(Mutex::new(work_rx));

        // Workers are detached, their handles are intentionally dropped, a
        // sentinel dismisses each of them once all results have arrived.
        for worker_id in 0..workers_count {
            rt.spawn(run_worker(
                worker_id,
                client.clone(),
                Arc::clone(&work_rx),
                work_tx.clone(),
                results_tx.clone()));
        }

        for prepared in &self.entries {
            let _ = work_tx.send(Some(prepared.clone()));
        }

        Ok(Downloads {
            rt: Some(rt),
            work_tx: Some(work_tx),
            results_rx,
            workers_count,
            entries_count,
            count: 0,
        })

    }

    /// Download this whole batch, reporting events to the given handler.
    ///
    /// The number of workers is [`default_workers_count`]. If every entry
    /// succeeds the batch is cleared, so multiple population stages can
    /// chain on the same batch without re-downloading, and this returns Ok.
    /// If at least one entry fails, the error carries every failed entry
    /// with its failure kind and the batch is left untouched.
    ///
    /// An empty batch returns immediately without reporting any event.
    ///
    /// This function must not be called from an asynchronous context, see
    /// [`start`](Self::start).
    pub fn download(&mut self, mut handler: impl Handler) -> Result<(), DownloadError> {

        let entries_count = self.entries.len();
        if entries_count == 0 {
            return Ok(());
        }

        let workers_count = default_workers_count(entries_count);

        handler.handle(Event::Started {
            workers_count,
            entries_count,
            total_size: self.total_size,
        });

        let mut errors = Vec::new();

        for (count, result) in self.start(workers_count)? {
            match result {
                Ok(success) => {
                    handler.handle(Event::Progress {
                        worker_id: success.worker_id,
                        count,
                        entry: &success.entry,
                        size: success.size,
                        speed: success.speed,
                    });
                }
                Err(error) => {
                    errors.push(error);
                }
            }
        }

        if !errors.is_empty() {
            return Err(DownloadError::Entries { errors });
        }

        self.clear();
        handler.handle(Event::Completed);
        Ok(())

    }

}

/// Default number of workers used by [`Batch::download`], four workers per
/// logical CPU, but never more than the number of entries.
pub fn default_workers_count(entries_count: usize) -> usize {
    let cpus = thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1);
    entries_count.min(cpus.saturating_mul(4))
}

/// The lazy sequence of results of a started batch, see [`Batch::start`].
///
/// Exactly one result is yielded per entry of the batch, in completion
/// order. Once the last result has been yielded, or when this sequence is
/// dropped, the workers are dismissed and the backing runtime is shut down
/// in the background, nothing ever joins the workers.
#[derive(Debug)]
pub struct Downloads {
    /// The runtime backing the workers, none if the batch was empty.
    rt: Option<tokio::runtime::Runtime>,
    /// Sender used to dismiss workers with one sentinel each, taken once.
    work_tx: Option<UnboundedSender<Option<PreparedEntry>>>,
    /// Where results are received from workers.
    results_rx: UnboundedReceiver<Result<EntrySuccess, EntryError>>,
    /// Number of spawned workers.
    workers_count: usize,
    /// Number of entries dispatched, and so of results to yield.
    entries_count: usize,
    /// Number of results yielded so far.
    count: usize,
}

impl Downloads {

    /// Send one sentinel per worker and shut the runtime down without
    /// waiting for the workers to terminate.
    fn dismiss_workers(&mut self) {
        if let Some(work_tx) = self.work_tx.take() {
            for _ in 0..self.workers_count {
                let _ = work_tx.send(None);
            }
        }
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }

}

impl Iterator for Downloads {

    type Item = (usize, Result<EntrySuccess, EntryError>);

    fn next(&mut self) -> Option<Self::Item> {

        if self.count >= self.entries_count {
            return None;
        }

        let result = self.results_rx.blocking_recv()?;
        self.count += 1;

        if self.count == self.entries_count {
            self.dismiss_workers();
        }

        Some((self.count, result))

    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries_count - self.count;
        (remaining, Some(remaining))
    }

}

impl FusedIterator for Downloads { }
impl ExactSizeIterator for Downloads { }

impl Drop for Downloads {
    fn drop(&mut self) {
        self.dismiss_workers();
    }
}

/// State of a successfully downloaded entry.
#[derive(Debug)]
pub struct EntrySuccess {
    /// Identifier of the worker that downloaded the entry.
    worker_id: usize,
    /// The downloaded entry, its URL is the final one if redirects happened.
    entry: Entry,
    /// Number of bytes written to the destination file.
    size: u32,
    /// Smoothed speed of the downloading worker, in bytes per second.
    speed: f32,
}

impl EntrySuccess {

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[inline]
    pub fn into_entry(self) -> Entry {
        self.entry
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn speed(&self) -> f32 {
        self.speed
    }

}

/// State of an entry that failed to download, it also acts as a standard
/// error type.
#[derive(thiserror::Error, Debug)]
#[error("{}: {}", .entry.name(), .kind)]
pub struct EntryError {
    /// Identifier of the worker that gave up on the entry.
    worker_id: usize,
    /// The failed entry.
    entry: Entry,
    /// What the last attempt failed on.
    kind: EntryErrorKind,
}

impl EntryError {

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[inline]
    pub fn into_entry(self) -> Entry {
        self.entry
    }

    #[inline]
    pub fn kind(&self) -> EntryErrorKind {
        self.kind
    }

}

/// An error kind for a single entry, this is the error of the last attempt
/// when the attempt budget has been exhausted.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryErrorKind {
    /// A transport error while connecting, sending the request or reading
    /// the response, this also covers local I/O errors on the destination.
    #[error("connection error")]
    Connection,
    /// The server kept answering with a status other than 200.
    #[error("not found")]
    NotFound,
    /// Invalid size of the fully downloaded entry compared to the expected
    /// size. Implies that [`Entry::set_expected_size`] is not none.
    #[error("invalid size")]
    InvalidSize,
    /// Invalid SHA-1 of the fully downloaded entry compared to the expected
    /// SHA-1. Implies that [`Entry::set_expected_sha1`] is not none.
    #[error("invalid sha1")]
    InvalidSha1,
}

/// The URL of an entry pushed to a batch could not be parsed, or its scheme
/// is not HTTP or HTTPS.
#[derive(thiserror::Error, Debug)]
#[error("invalid url: {url}")]
pub struct InvalidUrlError {
    /// The rejected URL.
    pub url: Box<str>,
}

/// The error type returned by [`Batch::download`].
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    /// The HTTP client could not be initialized.
    #[error("client: {0}")]
    Client(#[from] reqwest::Error),
    /// At least one entry failed after exhausting its attempts, each failed
    /// entry is present with its failure kind.
    #[error("failed to download {} entries", .errors.len())]
    Entries {
        errors: Vec<EntryError>,
    },
}

/// Events happening while downloading a batch.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum Event<'a> {
    /// The batch starts downloading on the given number of workers. Not
    /// reported for an empty batch.
    Started {
        workers_count: usize,
        entries_count: usize,
        /// Cumulative size declared by the entries, see [`Batch::total_size`].
        total_size: u64,
    },
    /// An entry has been successfully downloaded and validated. The count
    /// runs over successes and failures altogether, so it's not necessarily
    /// contiguous from one progress event to the next.
    Progress {
        worker_id: usize,
        count: usize,
        entry: &'a Entry,
        size: u32,
        /// Smoothed speed of the downloading worker, in bytes per second.
        speed: f32,
    },
    /// The whole batch has been downloaded successfully and cleared. Not
    /// reported for an empty batch.
    Completed,
}

/// A handle for watching a batch download progress.
pub trait Handler {
    /// Handle a single event, called on the thread driving the download.
    fn handle(&mut self, event: Event);
}

/// Blanket implementation if no handler is needed.
impl Handler for () {
    fn handle(&mut self, event: Event) {
        let _ = event;
    }
}

impl<H: Handler + ?Sized> Handler for &mut H {
    #[inline]
    fn handle(&mut self, event: Event) {
        (**self).handle(event)
    }
}

/// A worker loop, consuming prepared entries from the shared work channel
/// until a sentinel or the closing of a channel dismisses it.
async fn run_worker(
    worker_id: usize,
    client: Client,
    work_rx: Arc<Mutex<UnboundedReceiver<Option<PreparedEntry>>>>,
    work_tx: UnboundedSender<Option<PreparedEntry>>,
    results_tx: UnboundedSender<Result<EntrySuccess, EntryError>>,
) {

    // Smoothed speed of this worker, carried across entries.
    let mut speed = 0.0f32;

    loop {

        let msg = {
            let mut work_rx = work_rx.lock().await;
            work_rx.recv().await
        };

        // A sentinel must be consumed at most once per worker.
        let Some(Some(prepared)) = msg else { break };

        if let Some(result) = download_entry(worker_id, &client, &work_tx, prepared, &mut speed).await {
            // The receiving end dropping the sequence dismisses us as well.
            if results_tx.send(result).is_err() {
                break;
            }
        }

    }

}

/// Download a single prepared entry, retrying up to [`MAX_TRY_COUNT`] times,
/// and return its result. Redirected entries are pushed back onto the work
/// channel and produce no result here, the re-injected entry will produce
/// exactly one result later.
async fn download_entry(
    worker_id: usize,
    client: &Client,
    work_tx: &UnboundedSender<Option<PreparedEntry>>,
    prepared: PreparedEntry,
    speed: &mut f32,
) -> Option<Result<EntrySuccess, EntryError>> {

    let PreparedEntry { url, redirects, entry } = prepared;

    let mut last_error = EntryErrorKind::Connection;
    let mut try_count = 0;

    loop {

        try_count += 1;
        if try_count > MAX_TRY_COUNT {
            return Some(Err(EntryError { worker_id, entry, kind: last_error }));
        }

        let started = Instant::now();

        let mut res = match client.get(url.clone()).send().await {
            Ok(res) => res,
            Err(_) => {
                last_error = EntryErrorKind::Connection;
                continue;
            }
        };

        let status = res.status();
        if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {

            let location = res.headers().get(header::LOCATION)
                .and_then(|location| location.to_str().ok())
                .and_then(|location| url.join(location).ok());

            // Skip the remaining body so the connection can be reused.
            drain(&mut res).await;

            // A missing or malformed location is worth another attempt.
            let Some(redirect_url) = location else {
                last_error = EntryErrorKind::NotFound;
                continue;
            };

            if redirects >= MAX_REDIRECT_COUNT {
                return Some(Err(EntryError { worker_id, entry, kind: EntryErrorKind::NotFound }));
            }

            // The redirected entry goes back onto the work channel, keeping
            // the original display name, and no result is produced now so
            // the engine's result count stays exact. The target is validated
            // like any pushed entry, so a redirect escaping to an
            // unsupported scheme fails the entry instead of being fetched.
            let redirect_entry = Entry {
                url: redirect_url.as_str().into(),
                file: entry.file.clone(),
                expected_size: entry.expected_size,
                expected_sha1: entry.expected_sha1,
                name: Some(entry.name().into()),
                executable: entry.executable,
            };

            return match PreparedEntry::from_entry(redirect_entry) {
                Ok(mut prepared) => {
                    prepared.redirects = redirects + 1;
                    let _ = work_tx.send(Some(prepared));
                    None
                }
                Err(_) => {
                    Some(Err(EntryError { worker_id, entry, kind: EntryErrorKind::NotFound }))
                }
            };

        } else if status != StatusCode::OK {
            // Skip all remaining bytes to allow further requests on the
            // same connection.
            drain(&mut res).await;
            last_error = EntryErrorKind::NotFound;
            continue;
        }

        let mut sha1 = entry.expected_sha1.map(|_| Sha1::new());

        let size = match write_entry_file(&mut res, &entry.file, &mut sha1).await {
            Ok(size) => size,
            Err(kind) => {
                let _ = fs::remove_file(&entry.file).await;
                last_error = kind;
                continue;
            }
        };

        // Only those that can read the file will be able to execute it.
        if entry.executable && make_executable(&entry.file).await.is_err() {
            let _ = fs::remove_file(&entry.file).await;
            last_error = EntryErrorKind::Connection;
            continue;
        }

        let elapsed = started.elapsed().as_secs_f32();

        if entry.expected_size.is_some_and(|expected_size| expected_size != size) {
            last_error = EntryErrorKind::InvalidSize;
        } else if let Some(expected_sha1) = &entry.expected_sha1 {
            let computed_sha1 = sha1.take().unwrap_or_default().finalize();
            if computed_sha1.as_slice() != expected_sha1 {
                last_error = EntryErrorKind::InvalidSha1;
            } else {
                *speed = smooth_speed(*speed, size, elapsed);
                return Some(Ok(EntrySuccess { worker_id, entry, size, speed: *speed }));
            }
        } else {
            *speed = smooth_speed(*speed, size, elapsed);
            return Some(Ok(EntrySuccess { worker_id, entry, size, speed: *speed }));
        }

        // The checks have failed on a fully downloaded file, remove it
        // before the next attempt.
        let _ = fs::remove_file(&entry.file).await;

    }

}

/// Stream the response's body to the entry's file, updating the digest on
/// the fly when one is expected, and return the number of bytes written.
/// All errors are mapped to [`EntryErrorKind::Connection`], except a body
/// overflowing 32 bits which can't match any expected size.
async fn write_entry_file(
    res: &mut reqwest::Response,
    file: &Path,
    sha1: &mut Option<Sha1>,
) -> Result<u32, EntryErrorKind> {

    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).await.map_err(|_| EntryErrorKind::Connection)?;
    }

    let mut dst = File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(file).await
        .map_err(|_| EntryErrorKind::Connection)?;

    let mut size = 0usize;

    while let Some(chunk) = res.chunk().await.map_err(|_| EntryErrorKind::Connection)? {
        size += chunk.len();
        if let Some(digest) = sha1.as_mut() {
            digest.update(&chunk);
        }
        dst.write_all(&chunk).await.map_err(|_| EntryErrorKind::Connection)?;
    }

    // Ensure the file is fully written before validation.
    dst.flush().await.map_err(|_| EntryErrorKind::Connection)?;

    u32::try_from(size).map_err(|_| EntryErrorKind::InvalidSize)

}

/// Skip the remaining response body, required before reusing the underlying
/// connection for another request.
async fn drain(res: &mut reqwest::Response) {
    while let Ok(Some(_)) = res.chunk().await { }
}

/// Update the exponential moving average of a worker's speed with a transfer
/// of the given size and duration, a zero duration leaves it unchanged.
fn smooth_speed(speed: f32, size: u32, elapsed: f32) -> f32 {
    if elapsed > 0.0 {
        let instant_speed = size as f32 / elapsed;
        SPEED_SMOOTHING * instant_speed + (1.0 - SPEED_SMOOTHING) * speed
    } else {
        speed
    }
}

/// Augment the file's mode so that every principal that can read the file
/// can also execute it.
#[cfg(unix)]
async fn make_executable(file: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(file).await?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    permissions.set_mode(mode | ((mode & 0o444) >> 2));
    fs::set_permissions(file, permissions).await
}

/// Without POSIX modes there is nothing to do.
#[cfg(not(unix))]
async fn make_executable(_file: &Path) -> io::Result<()> {
    Ok(())
}


#[cfg(test)]
mod tests {

    use std::hash::{DefaultHasher, Hash, Hasher};
    use std::path::Path;

    use super::{default_workers_count, smooth_speed, Entry};

    fn hash(entry: &Entry) -> u64 {
        let mut hasher = DefaultHasher::new();
        entry.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn entry_identity() {

        let mut first = Entry::new("https://example.com/a", Path::new("/tmp/a"));
        first.set_expected_size(Some(12));

        let mut second = Entry::new("https://example.com/a", Path::new("/tmp/a"));
        second.set_expected_size(Some(12));

        // Name and executable flag are not part of the identity.
        second.set_name("other").set_executable(true);
        assert_eq!(first, second);
        assert_eq!(hash(&first), hash(&second));

        second.set_expected_size(Some(13));
        assert_ne!(first, second);

        second.set_expected_size(Some(12)).set_expected_sha1(Some([0; 20]));
        assert_ne!(first, second);

        let third = Entry::new("https://example.com/a", Path::new("/tmp/b"));
        assert_ne!(first, third);

    }

    #[test]
    fn entry_name_defaults_to_url() {
        let mut entry = Entry::new("https://example.com/a", Path::new("/tmp/a"));
        assert_eq!(entry.name(), "https://example.com/a");
        entry.set_name("a");
        assert_eq!(entry.name(), "a");
    }

    #[test]
    fn workers_count() {

        let cpus = std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1);

        assert_eq!(default_workers_count(0), 0);
        assert_eq!(default_workers_count(1), 1);
        assert_eq!(default_workers_count(usize::MAX), cpus * 4);

    }

    #[test]
    fn speed_smoothing() {

        // A zero elapsed time should not touch the average.
        assert_eq!(smooth_speed(123.0, 456, 0.0), 123.0);

        let speed = smooth_speed(0.0, 1000, 1.0);
        assert!((speed - 5.0).abs() < 1e-3);

    }

}
