//! Block device backends
//!
//! [`BlockDevice`] is the seam between the engine and the media. The engine
//! hands over a request whose device offset and buffer are already bound;
//! the device performs the transfer asynchronously and reports through
//! [`Request::complete_local`].
//!
//! [`FileBlockDevice`] backs the engine with a regular file or raw block
//! device. Submissions go into an MPMC [`Ring`] drained in batches by a
//! fixed pool of worker threads doing positional I/O.

use crate::raw_io::RawFile;
use crate::request::Request;
use crate::ring::{Ring, RingMode};
use crossbeam_utils::Backoff;
use cyprestore_common::config::StorageConfig;
use cyprestore_common::{Error, RequestType, Result};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Idle workers sleep at most this long between queue checks
const IDLE_PARK: Duration = Duration::from_millis(1);

/// Media behind the storage engine
pub trait BlockDevice: Send + Sync {
    /// Process-wide setup, before `open`
    fn init_env(&self) -> Result<()>;

    /// Open the media and start accepting requests
    fn open(&self) -> Result<()>;

    /// Queue a bound request
    ///
    /// On `Ok` the device completes the request exactly once. On `Err` the
    /// request was not accepted and the caller still owns its completion.
    fn process_request(&self, req: &Arc<Request>) -> Result<()>;

    /// Periodic housekeeping
    fn period_device_admin(&self);

    /// Stop accepting requests and release the media
    fn close(&self) -> Result<()>;

    /// Undo `init_env`
    fn close_env(&self);

    /// Usable bytes
    fn capacity(&self) -> u64;
}

/// I/O counters
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
}

impl DeviceStats {
    fn record(&self, req_type: RequestType, len: usize, ok: bool) {
        let (ops, bytes, errors) = match req_type {
            RequestType::Write | RequestType::Replicate => {
                (&self.writes, &self.bytes_written, &self.write_errors)
            }
            _ => (&self.reads, &self.bytes_read, &self.read_errors),
        };
        if ok {
            ops.fetch_add(1, Ordering::Relaxed);
            bytes.fetch_add(len as u64, Ordering::Relaxed);
        } else {
            errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Settings for a file-backed device
#[derive(Clone, Debug)]
pub struct FileDeviceConfig {
    pub path: PathBuf,
    /// Size of a newly created backing file
    pub size: u64,
    pub direct_io: bool,
    pub workers: usize,
    /// Requests a worker takes per dequeue
    pub batch: usize,
    /// Submission ring size (power of two)
    pub queue_size: u32,
}

impl From<&StorageConfig> for FileDeviceConfig {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            path: storage.device_path.clone(),
            size: storage.device_size,
            direct_io: storage.direct_io,
            workers: storage.io_workers,
            batch: storage.io_batch,
            queue_size: storage.io_queue_size,
        }
    }
}

struct Shared {
    queue: Ring<Arc<Request>>,
    running: AtomicBool,
    stats: DeviceStats,
}

/// File or raw-device backend served by a worker pool
pub struct FileBlockDevice {
    config: FileDeviceConfig,
    shared: Arc<Shared>,
    file: RwLock<Option<Arc<RawFile>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    wakers: RwLock<Vec<Thread>>,
    next_waker: AtomicUsize,
}

impl FileBlockDevice {
    pub fn new(config: FileDeviceConfig) -> Result<Self> {
        if config.workers == 0 || config.batch == 0 {
            return Err(Error::invalid_argument(
                "device needs at least one worker and a non-zero batch",
            ));
        }
        let queue = Ring::new(config.queue_size, RingMode::MpMc)?;
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                queue,
                running: AtomicBool::new(false),
                stats: DeviceStats::default(),
            }),
            file: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
            wakers: RwLock::new(Vec::new()),
            next_waker: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn stats(&self) -> &DeviceStats {
        &self.shared.stats
    }

    /// Requests waiting for a worker
    #[must_use]
    pub fn queued(&self) -> u32 {
        self.shared.queue.used()
    }

    fn wake_one(&self) {
        let wakers = self.wakers.read();
        if !wakers.is_empty() {
            let n = self.next_waker.fetch_add(1, Ordering::Relaxed);
            wakers[n % wakers.len()].unpark();
        }
    }
}

impl BlockDevice for FileBlockDevice {
    fn init_env(&self) -> Result<()> {
        if let Some(parent) = self.config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<()> {
        let mut slot = self.file.write();
        if slot.is_some() {
            return Err(Error::internal("device already open"));
        }
        let file = Arc::new(RawFile::create(
            &self.config.path,
            self.config.size,
            self.config.direct_io,
        )?);

        self.shared.running.store(true, Ordering::Release);
        let mut workers = self.workers.lock();
        let mut wakers = self.wakers.write();
        for i in 0..self.config.workers {
            let shared = Arc::clone(&self.shared);
            let file = Arc::clone(&file);
            let batch = u32::try_from(self.config.batch).unwrap_or(u32::MAX);
            let handle = thread::Builder::new()
                .name(format!("bdev-io-{i}"))
                .spawn(move || worker_loop(&shared, &file, batch))?;
            wakers.push(handle.thread().clone());
            workers.push(handle);
        }

        info!(
            "Opened device {} ({} bytes, direct_io={}, {} workers)",
            file.path(),
            file.size(),
            file.direct_io(),
            self.config.workers
        );
        *slot = Some(file);
        Ok(())
    }

    fn process_request(&self, req: &Arc<Request>) -> Result<()> {
        // Held across the enqueue so `close` cannot slip in between.
        let file = self.file.read();
        if file.is_none() || !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Storage("device is not open".into()));
        }
        self.shared
            .queue
            .enqueue(Arc::clone(req))
            .map_err(|_| Error::RingFull)?;
        self.wake_one();
        Ok(())
    }

    fn period_device_admin(&self) {
        let Some(file) = self.file.read().clone() else {
            return;
        };
        if let Err(e) = file.sync_data() {
            warn!("Device admin: {}", e);
        }
        let stats = &self.shared.stats;
        debug!(
            "Device {}: reads={} writes={} read_bytes={} write_bytes={} errors={}/{} queued={}",
            file.path(),
            stats.reads.load(Ordering::Relaxed),
            stats.writes.load(Ordering::Relaxed),
            stats.bytes_read.load(Ordering::Relaxed),
            stats.bytes_written.load(Ordering::Relaxed),
            stats.read_errors.load(Ordering::Relaxed),
            stats.write_errors.load(Ordering::Relaxed),
            self.queued()
        );
    }

    fn close(&self) -> Result<()> {
        let file = {
            let mut slot = self.file.write();
            self.shared.running.store(false, Ordering::Release);
            slot.take()
        };
        for waker in self.wakers.write().drain(..) {
            waker.unpark();
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("Device worker panicked");
            }
        }
        fail_queued(&self.shared);
        if let Some(file) = file {
            file.sync_data()?;
            info!("Closed device {}", file.path());
        }
        Ok(())
    }

    fn close_env(&self) {}

    fn capacity(&self) -> u64 {
        self.file
            .read()
            .as_ref()
            .map_or(self.config.size, |f| f.size())
    }
}

impl Drop for FileBlockDevice {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::Acquire)
            && let Err(e) = self.close()
        {
            error!("Failed to close device: {}", e);
        }
    }
}

fn worker_loop(shared: &Shared, file: &RawFile, batch: u32) {
    let backoff = Backoff::new();
    while shared.running.load(Ordering::Acquire) {
        let reqs = shared.queue.dequeue_burst(batch);
        if reqs.is_empty() {
            if backoff.is_completed() {
                thread::park_timeout(IDLE_PARK);
            } else {
                backoff.snooze();
            }
            continue;
        }
        backoff.reset();
        for req in reqs {
            let outcome = execute(file, &req, &shared.stats);
            req.complete_local(outcome);
        }
    }

    fail_queued(shared);
}

/// Fail whatever is still queued; it will never reach the media
fn fail_queued(shared: &Shared) {
    while let Ok(req) = shared.queue.dequeue() {
        req.complete_local(Err(Error::Storage("device closed".into())));
    }
}

fn execute(file: &RawFile, req: &Request, stats: &DeviceStats) -> Result<()> {
    let (req_type, offset, len) = req.io_params()?;
    let mut unit = req
        .take_mem_unit()
        .ok_or_else(|| Error::internal(format!("request {} has no buffer", req.id())))?;

    let outcome = if unit.len() < len {
        Err(Error::internal(format!(
            "buffer of {} bytes for a {len} byte transfer",
            unit.len()
        )))
    } else {
        match req_type {
            RequestType::Read | RequestType::Scrub => {
                file.read_at(offset, &mut unit.as_mut_slice()[..len])
            }
            RequestType::Write | RequestType::Replicate => {
                file.write_at(offset, &unit.as_slice()[..len])
            }
            other => Err(Error::invalid_argument(format!(
                "{other} is not a device operation"
            ))),
        }
    };

    req.set_mem_unit(unit);
    stats.record(req_type, len, outcome.is_ok());
    outcome
}
