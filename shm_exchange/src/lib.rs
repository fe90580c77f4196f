//! Single-slot request/response exchange over named shared memory.
//!
//! A tablet server process creates one exchange per SQL session; the
//! co-located SQL process opens the same segment by name. The client writes
//! a request into the segment, wakes the server, and blocks until the
//! response lands in the same buffer. One request is in flight at a time.
//!
//! ## Client API
//!
//! - `obtain(size)` — reserve the payload buffer for the next request
//! - `send_request(deadline)` — publish the request, block for the reply
//! - `ready_to_send()` — advisory readiness check
//!
//! ## Server API
//!
//! - `poll()` — block until a request (or shutdown) arrives
//! - `respond(size)` — publish a reply of `size` bytes
//! - [`ExchangeThread`] — poll loop on a dedicated thread, dispatching to a
//!   callback

mod error;
mod shm;
mod sync;

pub use error::{Error, Result};
pub use shm::set_skip_unlink_on_drop;

use shm::SharedMemory;
use sync::{MutexGuard, SharedCondvar, SharedMutex};
use std::fmt;
use std::io;
use std::mem;
use std::ptr::addr_of_mut;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// POSIX shared-memory objects appear as files here.
const SHARED_MEMORY_DIR: &str = "/dev/shm";

fn shared_memory_prefix(instance_id: &str) -> String {
    format!("yb_pg_{}_", instance_id)
}

fn shared_memory_name(instance_id: &str, session_id: u64) -> String {
    format!("{}{}", shared_memory_prefix(instance_id), session_id)
}

/// Exchange state stored in the shared header.
///
/// `Idle` is the only resting state; `RequestSent` and `ResponseSent` are
/// drained by the opposite party. `Shutdown` is terminal.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle = 0,
    RequestSent = 1,
    ResponseSent = 2,
    Shutdown = 3,
}

impl ExchangeState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => ExchangeState::Idle,
            1 => ExchangeState::RequestSent,
            2 => ExchangeState::ResponseSent,
            // A corrupted header reads as terminal.
            _ => ExchangeState::Shutdown,
        }
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeState::Idle => "Idle",
            ExchangeState::RequestSent => "RequestSent",
            ExchangeState::ResponseSent => "ResponseSent",
            ExchangeState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Reply returned by a successful [`SharedExchange::send_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply<'a> {
    /// Payload stored inline in the segment. Valid until the next `obtain`
    /// or `send_request` on this endpoint.
    Inline(&'a [u8]),
    /// The reply did not fit in the segment; only its size is reported and
    /// the payload must be fetched out of band.
    Oversize(usize),
}

/// Synchronization record at offset 0 of the mapped region. The payload
/// buffer starts immediately after it and extends to the end of the region.
#[repr(C)]
struct ExchangeHeader {
    mutex: SharedMutex,
    cond: SharedCondvar,
    state: AtomicU32,
    data_size: AtomicUsize,
}

impl ExchangeHeader {
    /// Placement-constructs the header. Runs exactly once, on the create
    /// path, before any other process opens the segment.
    ///
    /// # Safety
    /// `this` must point to the start of a freshly created writable mapping
    /// of at least `ExchangeHeader::size()` bytes.
    unsafe fn init_at(this: *mut Self) -> io::Result<()> {
        SharedMutex::init_at(addr_of_mut!((*this).mutex))?;
        SharedCondvar::init_at(addr_of_mut!((*this).cond))?;
        addr_of_mut!((*this).state).write(AtomicU32::new(ExchangeState::Idle as u32));
        addr_of_mut!((*this).data_size).write(AtomicUsize::new(0));
        Ok(())
    }

    fn size() -> usize {
        mem::size_of::<Self>()
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { (self as *const Self).add(1) as *mut u8 }
    }

    fn state(&self) -> ExchangeState {
        ExchangeState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn store_state(&self, state: ExchangeState) {
        self.state.store(state as u32, Ordering::Release);
    }

    // The exchange can carry a new request in two cases:
    // 1) it is idle, i.e. no request is being processed at this moment,
    // 2) the previous request failed and the peer has since produced the
    //    (now stale) response for it.
    fn ready_to_send_in(state: ExchangeState, failed_previous_request: bool) -> bool {
        state == ExchangeState::Idle
            || (failed_previous_request && state == ExchangeState::ResponseSent)
    }

    fn ready_to_send(&self, failed_previous_request: bool) -> bool {
        Self::ready_to_send_in(self.state(), failed_previous_request)
    }

    fn send_request(
        &self,
        failed_previous_request: bool,
        size: usize,
        deadline: Instant,
    ) -> Result<usize> {
        let guard = self.mutex.lock();
        let state = self.state();
        if state == ExchangeState::Shutdown {
            return Err(Error::ShutdownInProgress);
        }
        if !Self::ready_to_send_in(state, failed_previous_request) {
            drop(guard);
            return Err(Error::IllegalState(state));
        }
        self.data_size.store(size, Ordering::Relaxed);
        self.store_state(ExchangeState::RequestSent);
        self.cond.notify_one();

        self.wait_for(ExchangeState::ResponseSent, Some(deadline), &guard)?;
        let size = self.data_size.load(Ordering::Relaxed);
        self.store_state(ExchangeState::Idle);
        Ok(size)
    }

    fn respond(&self, size: usize) {
        let guard = self.mutex.lock();
        let state = self.state();
        if state != ExchangeState::RequestSent {
            drop(guard);
            if state != ExchangeState::Shutdown {
                tracing::error!(%state, "respond in wrong state");
                debug_assert!(false, "respond in wrong state: {}", state);
            }
            return;
        }

        self.data_size.store(size, Ordering::Relaxed);
        self.store_state(ExchangeState::ResponseSent);
        self.cond.notify_one();
    }

    fn poll(&self) -> Result<usize> {
        let guard = self.mutex.lock();
        self.wait_for(ExchangeState::RequestSent, None, &guard)?;
        Ok(self.data_size.load(Ordering::Relaxed))
    }

    fn signal_stop(&self) {
        let _guard = self.mutex.lock();
        self.store_state(ExchangeState::Shutdown);
        self.cond.notify_all();
    }

    fn wait_for(
        &self,
        expected: ExchangeState,
        deadline: Option<Instant>,
        guard: &MutexGuard<'_>,
    ) -> Result<()> {
        loop {
            let state = self.state();
            if state == expected {
                return Ok(());
            }
            if state == ExchangeState::Shutdown {
                return Err(Error::ShutdownInProgress);
            }
            match deadline {
                None => self.cond.wait(guard),
                Some(deadline) => {
                    if !self.cond.timed_wait(guard, &sync::wall_timespec(deadline)) {
                        return Err(Error::TimedOut(self.state()));
                    }
                }
            }
        }
    }
}

/// One endpoint of a shared-memory exchange.
///
/// The server side creates the segment (and owns the OS-level name); the
/// client side opens it. Exactly one endpoint of each kind may map a given
/// segment.
pub struct SharedExchange {
    session_id: u64,
    shm: SharedMemory,
    last_size: AtomicUsize,
    failed_previous_request: AtomicBool,
}

impl SharedExchange {
    /// Creates the backing segment named `yb_pg_{instance_id}_{session_id}`
    /// and becomes its owner.
    ///
    /// # Panics
    /// Panics if the OS object cannot be created: the exchange is integral
    /// to the session and there is no meaningful recovery.
    pub fn create(instance_id: &str, session_id: u64) -> Self {
        let name = shared_memory_name(instance_id, session_id);
        // Session ids are unique per live exchange, so the name is unused.
        let shm = match unsafe { SharedMemory::create(&name) } {
            Ok(shm) => shm,
            Err(err) => fatal_setup_error("create", instance_id, session_id, &err),
        };
        let header = shm.as_ptr() as *mut ExchangeHeader;
        if let Err(err) = unsafe { ExchangeHeader::init_at(header) } {
            fatal_setup_error("initialize", instance_id, session_id, &err);
        }
        Self::from_parts(session_id, shm)
    }

    /// Opens an existing segment created by the peer. Does not reinitialize
    /// the header and does not remove the name on drop.
    ///
    /// # Panics
    /// Panics if the OS object cannot be opened.
    pub fn open(instance_id: &str, session_id: u64) -> Self {
        let name = shared_memory_name(instance_id, session_id);
        // The owner placement-constructed the header before handing out the
        // session id, so the mapping is valid to reinterpret.
        let shm = match unsafe { SharedMemory::open(&name) } {
            Ok(shm) => shm,
            Err(err) => fatal_setup_error("open", instance_id, session_id, &err),
        };
        Self::from_parts(session_id, shm)
    }

    fn from_parts(session_id: u64, shm: SharedMemory) -> Self {
        debug_assert!(ExchangeHeader::size() < shm.size());
        Self {
            session_id,
            shm,
            last_size: AtomicUsize::new(0),
            failed_previous_request: AtomicBool::new(false),
        }
    }

    fn header(&self) -> &ExchangeHeader {
        unsafe { &*(self.shm.as_ptr() as *const ExchangeHeader) }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Reserves the payload buffer for a request of `required_size` bytes.
    ///
    /// Returns the start of the payload region, or `None` if the request
    /// does not fit in the segment. The size is remembered for the next
    /// [`send_request`](Self::send_request).
    pub fn obtain(&self, required_size: usize) -> Option<*mut u8> {
        self.last_size.store(required_size, Ordering::Relaxed);
        if ExchangeHeader::size() + required_size > self.shm.size() {
            return None;
        }
        Some(self.header().data_ptr())
    }

    /// Publishes the request written via [`obtain`](Self::obtain) and blocks
    /// until the peer responds, shutdown is signalled, or `deadline` passes.
    pub fn send_request(&self, deadline: Instant) -> Result<Reply<'_>> {
        let header = self.header();
        let failed = self.failed_previous_request.load(Ordering::Relaxed);
        let size = self.last_size.load(Ordering::Relaxed);
        match header.send_request(failed, size, deadline) {
            Ok(size) => {
                self.failed_previous_request.store(false, Ordering::Relaxed);
                if ExchangeHeader::size() + size > self.shm.size() {
                    Ok(Reply::Oversize(size))
                } else {
                    Ok(Reply::Inline(unsafe {
                        slice::from_raw_parts(header.data_ptr(), size)
                    }))
                }
            }
            Err(err) => {
                self.failed_previous_request.store(true, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Advisory readiness check; a subsequent send still rechecks under the
    /// lock.
    pub fn ready_to_send(&self) -> bool {
        self.header()
            .ready_to_send(self.failed_previous_request.load(Ordering::Relaxed))
    }

    /// Publishes a reply of `size` bytes already written to the payload
    /// buffer. Silently ignored after shutdown; any other state than
    /// `RequestSent` is a protocol violation by the peer.
    pub fn respond(&self, size: usize) {
        self.header().respond(size);
    }

    /// Blocks until a request arrives and returns its payload size, or
    /// [`Error::ShutdownInProgress`] once shutdown is signalled. The header
    /// state is left unchanged; the caller reads the payload and eventually
    /// calls [`respond`](Self::respond).
    pub fn poll(&self) -> Result<usize> {
        self.header().poll()
    }

    /// Transitions the exchange to `Shutdown` and wakes all waiters on both
    /// sides. Idempotent.
    pub fn signal_stop(&self) {
        self.header().signal_stop();
    }

    /// Start of the payload region. Whoever holds the slot per the state
    /// machine (sender before `send_request`, responder between `poll` and
    /// `respond`) may access it.
    pub fn data_ptr(&self) -> *mut u8 {
        self.header().data_ptr()
    }
}

fn fatal_setup_error(op: &str, instance_id: &str, session_id: u64, err: &io::Error) -> ! {
    tracing::error!(instance_id, session_id, error = %err, "failed to {} shared exchange", op);
    panic!(
        "failed to {} shared exchange for {}/{}: {}",
        op, instance_id, session_id, err
    );
}

/// Server-side poll loop on a dedicated thread.
///
/// The thread blocks in [`SharedExchange::poll`] and hands each incoming
/// request size to `listener`, which reads the payload out of the segment
/// and eventually calls [`SharedExchange::respond`]. Dropping the handle
/// signals shutdown and joins the thread.
pub struct ExchangeThread {
    exchange: Arc<SharedExchange>,
    handle: Option<JoinHandle<()>>,
}

impl ExchangeThread {
    /// Spawns the poll loop for `exchange`.
    ///
    /// # Panics
    /// Panics if the thread cannot be spawned.
    pub fn new<F>(exchange: SharedExchange, mut listener: F) -> Self
    where
        F: FnMut(&SharedExchange, usize) + Send + 'static,
    {
        let exchange = Arc::new(exchange);
        let polled = Arc::clone(&exchange);
        let thread = thread::Builder::new()
            .name(format!("sh_xchng_{}", exchange.session_id()))
            .spawn(move || loop {
                match polled.poll() {
                    Ok(size) => listener(&polled, size),
                    Err(Error::ShutdownInProgress) => break,
                    Err(err) => {
                        tracing::error!(
                            session_id = polled.session_id(),
                            error = %err,
                            "shared exchange poll failed",
                        );
                        debug_assert!(
                            false,
                            "poll session {} failed: {}",
                            polled.session_id(),
                            err
                        );
                        break;
                    }
                }
            });
        let handle = match thread {
            Ok(handle) => handle,
            Err(err) => panic!("failed to spawn exchange listener thread: {}", err),
        };
        Self {
            exchange,
            handle: Some(handle),
        }
    }

    pub fn exchange(&self) -> &SharedExchange {
        &self.exchange
    }
}

impl Drop for ExchangeThread {
    fn drop(&mut self) {
        self.exchange.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Removes leftover segments from prior runs of `instance_id`.
///
/// Enumerates the shared-memory directory and unlinks every object whose
/// name carries the instance prefix. Idempotent; intended for process
/// startup to purge orphans left by crashes.
pub fn cleanup_shared_memory(instance_id: &str) -> io::Result<()> {
    let prefix = shared_memory_prefix(instance_id);
    for entry in std::fs::read_dir(SHARED_MEMORY_DIR)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) {
            // The entry may already be gone; removal is best effort.
            let _ = shm::unlink(name);
        }
    }
    Ok(())
}
