//! Pooled request contexts
//!
//! A [`Request`] carries one in-flight operation from submission to reply.
//! Requests are recycled through a [`RequestMgr`] ring rather than allocated
//! per operation:
//!
//! ```text
//! Noop -> reset(type) -> processing -> completion -> reset(Noop) -> pooled
//! ```
//!
//! Completion is reference counted. A plain request starts with one count
//! (the local operation); replication raises it to `1 + secondaries`. Each
//! contributor reports through [`Request::complete_local`] or
//! [`Request::complete_replica`], and the one whose decrement takes the count
//! from 1 to 0 builds the reply, returns the request to its pool and invokes
//! the caller's callback.

use crate::mem_buffer::MemUnit;
use crate::ring::{Ring, RingMode};
use bytes::Bytes;
use cyprestore_common::{compute_crc32c, Error, ExtentRouter, RequestType, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Callback receiving the final outcome of a request, invoked exactly once
pub type DoneCallback = Box<dyn FnOnce(Result<IoReply>) + Send>;

/// Successful response payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoReply {
    /// Data for reads
    pub data: Option<Bytes>,
    /// CRC32C of the data for reads and scrubs
    pub crc32: Option<u32>,
}

/// What the transport hands the engine for one operation
pub struct OpContext {
    pub extent_id: String,
    pub offset: u64,
    pub size: u64,
    pub payload: Bytes,
    pub crc32: Option<u32>,
    done: Option<DoneCallback>,
}

impl OpContext {
    /// Context for a range operation with no payload
    pub fn new(extent_id: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            extent_id: extent_id.into(),
            offset,
            size,
            payload: Bytes::new(),
            crc32: None,
            done: None,
        }
    }

    /// Attach write data and its optional CRC32C
    #[must_use]
    pub fn with_payload(mut self, payload: Bytes, crc32: Option<u32>) -> Self {
        self.payload = payload;
        self.crc32 = crc32;
        self
    }

    /// Set the completion callback
    #[must_use]
    pub fn on_done(mut self, done: impl FnOnce(Result<IoReply>) + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }
}

impl fmt::Debug for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("extent_id", &self.extent_id)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("payload_len", &self.payload.len())
            .field("crc32", &self.crc32)
            .finish()
    }
}

/// Owned snapshot of a request's parameters
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub req_type: RequestType,
    pub extent_id: String,
    pub offset: u64,
    pub size: u64,
    pub payload: Bytes,
    pub crc32: Option<u32>,
}

#[derive(Default)]
struct RequestState {
    req_type: RequestType,
    ctx: Option<OpContext>,
    mem: Option<MemUnit>,
    router: Option<Arc<ExtentRouter>>,
    phys_offset: u64,
    zero_fill: bool,
    local_error: Option<Error>,
    begin: Option<Instant>,
}

/// One reusable in-flight operation
pub struct Request {
    id: u32,
    result: AtomicBool,
    ref_count: AtomicU32,
    replica_failures: AtomicU32,
    state: Mutex<RequestState>,
    pool: Weak<RequestMgr>,
}

impl Request {
    fn new(id: u32, pool: Weak<RequestMgr>) -> Self {
        Self {
            id,
            result: AtomicBool::new(true),
            ref_count: AtomicU32::new(1),
            replica_failures: AtomicU32::new(0),
            state: Mutex::new(RequestState::default()),
            pool,
        }
    }

    /// Return to a clean state for `req_type`
    pub fn reset(&self, req_type: RequestType) {
        self.result.store(true, Ordering::Release);
        self.ref_count.store(1, Ordering::Release);
        self.replica_failures.store(0, Ordering::Release);
        *self.state.lock() = RequestState {
            req_type,
            ..RequestState::default()
        };
    }

    /// Pool slot identifier, stable across reuse
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn req_type(&self) -> RequestType {
        self.state.lock().req_type
    }

    /// Attach the transport context
    pub fn set_context(&self, ctx: OpContext) {
        self.state.lock().ctx = Some(ctx);
    }

    /// Snapshot of the request parameters
    pub fn info(&self) -> Result<RequestInfo> {
        let state = self.state.lock();
        let ctx = state
            .ctx
            .as_ref()
            .ok_or_else(|| Error::internal(format!("request {} has no context", self.id)))?;
        Ok(RequestInfo {
            req_type: state.req_type,
            extent_id: ctx.extent_id.clone(),
            offset: ctx.offset,
            size: ctx.size,
            payload: ctx.payload.clone(),
            crc32: ctx.crc32,
        })
    }

    // ---- Outcome tracking ----

    /// Combine an outcome into the result; only ever narrows true -> false
    pub fn set_result(&self, success: bool) {
        if !success {
            self.result.store(false, Ordering::Release);
        }
    }

    #[must_use]
    pub fn result(&self) -> bool {
        self.result.load(Ordering::Acquire)
    }

    pub fn set_ref_count(&self, count: u32) {
        self.ref_count.store(count, Ordering::Release);
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Decrement the count, returning the value before the decrement
    pub fn fetch_and_sub_ref(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel)
    }

    // ---- I/O plumbing ----

    pub fn set_router(&self, router: Arc<ExtentRouter>) {
        self.state.lock().router = Some(router);
    }

    #[must_use]
    pub fn router(&self) -> Option<Arc<ExtentRouter>> {
        self.state.lock().router.clone()
    }

    /// Bind the device offset and buffer this request will use
    pub fn set_io(&self, phys_offset: u64, mem: MemUnit) {
        let mut state = self.state.lock();
        state.phys_offset = phys_offset;
        state.mem = Some(mem);
    }

    #[must_use]
    pub fn phys_offset(&self) -> u64 {
        self.state.lock().phys_offset
    }

    /// Type, device offset and length of the bound I/O
    pub fn io_params(&self) -> Result<(RequestType, u64, usize)> {
        let state = self.state.lock();
        let size = state
            .ctx
            .as_ref()
            .map(|c| c.size as usize)
            .ok_or_else(|| Error::internal(format!("request {} has no context", self.id)))?;
        Ok((state.req_type, state.phys_offset, size))
    }

    /// Borrow the buffer out for the duration of a device operation
    pub fn take_mem_unit(&self) -> Option<MemUnit> {
        self.state.lock().mem.take()
    }

    pub fn set_mem_unit(&self, mem: MemUnit) {
        self.state.lock().mem = Some(mem);
    }

    /// Reply with zeros instead of device data (never-written extent)
    pub fn set_zero_fill(&self) {
        self.state.lock().zero_fill = true;
    }

    // ---- Tracing ----

    pub fn begin_trace_time(&self) {
        self.state.lock().begin = Some(Instant::now());
    }

    /// Time since `begin_trace_time`, logging when it exceeds `slow`
    pub fn end_trace_time(&self, slow: Duration) -> Option<Duration> {
        let (begin, req_type) = {
            let state = self.state.lock();
            (state.begin?, state.req_type)
        };
        let elapsed = begin.elapsed();
        if elapsed > slow {
            warn!(
                "Slow request {} ({}): {:?} exceeds {:?}",
                self.id, req_type, elapsed, slow
            );
        }
        Some(elapsed)
    }

    // ---- Completion ----

    /// Report the local (primary) outcome
    pub fn complete_local(self: &Arc<Self>, outcome: Result<()>) {
        if let Err(e) = outcome {
            self.set_result(false);
            self.state.lock().local_error = Some(e);
        }
        self.put_ref();
    }

    /// Report one secondary's outcome
    pub fn complete_replica(self: &Arc<Self>, outcome: Result<()>) {
        if let Err(e) = outcome {
            debug!("Request {}: replica failed: {}", self.id, e);
            self.set_result(false);
            self.replica_failures.fetch_add(1, Ordering::AcqRel);
        }
        self.put_ref();
    }

    fn put_ref(self: &Arc<Self>) {
        let prev = self.fetch_and_sub_ref();
        debug_assert!(prev >= 1, "request {} over-released", self.id);
        if prev == 1 {
            self.finish();
        }
    }

    /// Build the reply, recycle the request, then answer the caller
    fn finish(self: &Arc<Self>) {
        let slow = self
            .pool
            .upgrade()
            .map_or(Duration::MAX, |pool| pool.slow_threshold);
        self.end_trace_time(slow);

        let (done, reply, partial) = {
            let mut state = self.state.lock();
            let mut ctx = state.ctx.take();
            let done = ctx.as_mut().and_then(|c| c.done.take());
            let reply = self.build_reply(&mut state, ctx.as_ref());
            let partial = state.req_type == RequestType::Write
                && self.replica_failures.load(Ordering::Acquire) > 0;
            // Buffer goes back to its pool here.
            state.mem = None;
            (done, reply, partial)
        };

        self.reset(RequestType::Noop);
        if let Some(pool) = self.pool.upgrade() {
            if partial {
                pool.partial_replications.fetch_add(1, Ordering::Relaxed);
            }
            pool.release(Arc::clone(self));
        }

        match done {
            Some(done) => done(reply),
            None => debug!("Request {} completed without a callback", self.id),
        }
    }

    fn build_reply(&self, state: &mut RequestState, ctx: Option<&OpContext>) -> Result<IoReply> {
        if let Some(e) = state.local_error.take() {
            return Err(e);
        }
        let size = ctx.map_or(0, |c| c.size as usize);

        match state.req_type {
            RequestType::Read | RequestType::Scrub => {
                let data = if state.zero_fill {
                    Bytes::from(vec![0u8; size])
                } else {
                    let mem = state
                        .mem
                        .as_ref()
                        .ok_or_else(|| Error::internal("read completed without a buffer"))?;
                    Bytes::copy_from_slice(&mem.as_slice()[..size])
                };
                let crc32 = Some(compute_crc32c(&data));
                let data = (state.req_type == RequestType::Read).then_some(data);
                Ok(IoReply { data, crc32 })
            }
            RequestType::Write => {
                if !self.result() {
                    let failed = self.replica_failures.load(Ordering::Acquire) as usize;
                    let total = state.router.as_ref().map_or(0, |r| r.secondaries.len());
                    warn!(
                        "Request {} extent {}: {}",
                        self.id,
                        ctx.map_or("?", |c| c.extent_id.as_str()),
                        Error::ReplicatePartialFail { failed, total }
                    );
                }
                Ok(IoReply::default())
            }
            _ => Ok(IoReply::default()),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("result", &self.result())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Pool of reusable requests
pub struct RequestMgr {
    ring: Ring<Arc<Request>>,
    created: AtomicU32,
    partial_replications: AtomicU64,
    slow_threshold: Duration,
    this: Weak<RequestMgr>,
}

impl RequestMgr {
    /// Create a pool holding at most `pool_size - 1` requests
    pub fn new(pool_size: u32, slow_threshold: Duration) -> Result<Arc<Self>> {
        let ring = Ring::new(pool_size, RingMode::MpMc)?;
        Ok(Arc::new_cyclic(|this| Self {
            ring,
            created: AtomicU32::new(0),
            partial_replications: AtomicU64::new(0),
            slow_threshold,
            this: this.clone(),
        }))
    }

    /// Take a request reset for `req_type`, with its trace clock started
    ///
    /// Fails fast with `RingFull` once every request is in flight.
    pub fn acquire(&self, req_type: RequestType) -> Result<Arc<Request>> {
        let req = match self.ring.dequeue() {
            Ok(req) => req,
            Err(_) => {
                let capacity = self.ring.capacity();
                let id = self
                    .created
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < capacity).then_some(n + 1)
                    })
                    .map_err(|_| Error::RingFull)?;
                Arc::new(Request::new(id, self.this.clone()))
            }
        };
        req.reset(req_type);
        req.begin_trace_time();
        Ok(req)
    }

    fn release(&self, req: Arc<Request>) {
        if let Err(rejected) = self.ring.enqueue(req) {
            error!(
                "RequestMgr: ring full on release of request {}",
                rejected.into_inner().id
            );
            self.created.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub const fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Requests created so far
    #[must_use]
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::Acquire)
    }

    /// Writes that completed with at least one failed secondary
    #[must_use]
    pub fn partial_replications(&self) -> u64 {
        self.partial_replications.load(Ordering::Relaxed)
    }

    /// Requests idle in the pool (a snapshot)
    #[must_use]
    pub fn available(&self) -> u32 {
        self.ring.used()
    }

    /// Requests currently in flight (a snapshot)
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.created().saturating_sub(self.available())
    }
}

impl fmt::Debug for RequestMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMgr")
            .field("created", &self.created())
            .field("available", &self.available())
            .finish()
    }
}
