//! Process-shared synchronization primitives placed inside a mapped segment.
//!
//! The mutex and condition variable are initialized with
//! `PTHREAD_PROCESS_SHARED` so both processes mapping the segment can block
//! on them. Condvar deadlines are absolute `CLOCK_REALTIME` timespecs;
//! [`wall_timespec`] maps monotonic deadlines onto that clock.

use std::cell::UnsafeCell;
use std::io;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Interprocess mutex usable by every process mapping the segment.
#[repr(C)]
pub(crate) struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// The pthread object is the shared state; &self only hands out its address.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initializes the mutex in place with process-shared attributes.
    ///
    /// # Safety
    /// `this` must point to writable memory inside the mapped segment and
    /// must be initialized exactly once, by the segment owner, before any
    /// other process locks it.
    pub unsafe fn init_at(this: *mut Self) -> io::Result<()> {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        let rc = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            let rc = libc::pthread_mutex_init((*this).raw.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(())
        } else {
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            Err(io::Error::from_raw_os_error(rc))
        }
    }

    pub fn lock(&self) -> MutexGuard<'_> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock failed: {}", rc);
        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {}", rc);
    }
}

/// Unlocks the mutex when dropped.
pub(crate) struct MutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Interprocess condition variable paired with [`SharedMutex`].
#[repr(C)]
pub(crate) struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initializes the condvar in place with process-shared attributes.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init_at`].
    pub unsafe fn init_at(this: *mut Self) -> io::Result<()> {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_condattr_t>::uninit();
        let rc = libc::pthread_condattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        let rc = libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            let rc = libc::pthread_cond_init((*this).raw.get(), attr.as_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(())
        } else {
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            Err(io::Error::from_raw_os_error(rc))
        }
    }

    /// Waits until notified. Spurious wakeups are possible; callers re-check
    /// their predicate.
    pub fn wait(&self, guard: &MutexGuard<'_>) {
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_wait failed: {}", rc);
    }

    /// Waits until notified or `abs_deadline` passes on the wall clock.
    /// Returns `false` on timeout.
    pub fn timed_wait(&self, guard: &MutexGuard<'_>, abs_deadline: &libc::timespec) -> bool {
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), abs_deadline)
        };
        if rc == libc::ETIMEDOUT {
            return false;
        }
        debug_assert_eq!(rc, 0, "pthread_cond_timedwait failed: {}", rc);
        true
    }

    pub fn notify_one(&self) {
        let rc = unsafe { libc::pthread_cond_signal(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_signal failed: {}", rc);
    }

    pub fn notify_all(&self) {
        let rc = unsafe { libc::pthread_cond_broadcast(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_broadcast failed: {}", rc);
    }
}

/// Converts a monotonic deadline to an absolute wall-clock timespec.
///
/// The wall/monotonic baseline is sampled once per process; later
/// conversions are additive, so they stay consistent with each other even
/// if the wall clock is stepped in between.
pub(crate) fn wall_timespec(deadline: Instant) -> libc::timespec {
    static CLOCK_BASE: OnceLock<(SystemTime, Instant)> = OnceLock::new();
    let &(base_wall, base_instant) =
        CLOCK_BASE.get_or_init(|| (SystemTime::now(), Instant::now()));

    let wall = base_wall + deadline.saturating_duration_since(base_instant);
    let since_epoch = wall
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    libc::timespec {
        tv_sec: since_epoch.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use std::ptr::addr_of_mut;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    struct Shared {
        mutex: SharedMutex,
        cond: SharedCondvar,
        value: AtomicU32,
    }

    fn new_shared() -> &'static Shared {
        let slot: &'static mut MaybeUninit<Shared> = Box::leak(Box::new(MaybeUninit::uninit()));
        let ptr = slot.as_mut_ptr();
        unsafe {
            SharedMutex::init_at(addr_of_mut!((*ptr).mutex)).unwrap();
            SharedCondvar::init_at(addr_of_mut!((*ptr).cond)).unwrap();
            addr_of_mut!((*ptr).value).write(AtomicU32::new(0));
            slot.assume_init_ref()
        }
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let shared = new_shared();

        let waiter = thread::spawn(move || {
            let guard = shared.mutex.lock();
            while shared.value.load(Ordering::Acquire) == 0 {
                shared.cond.wait(&guard);
            }
            shared.value.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(20));
        {
            let _guard = shared.mutex.lock();
            shared.value.store(7, Ordering::Release);
            shared.cond.notify_one();
        }

        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn test_timed_wait_times_out() {
        let shared = new_shared();

        let start = Instant::now();
        let deadline = wall_timespec(start + Duration::from_millis(50));
        let guard = shared.mutex.lock();
        let woken = shared.cond.timed_wait(&guard, &deadline);
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wall_timespec_is_monotone() {
        let now = Instant::now();
        let a = wall_timespec(now + Duration::from_millis(100));
        let b = wall_timespec(now + Duration::from_millis(200));
        assert!((b.tv_sec, b.tv_nsec) > (a.tv_sec, a.tv_nsec));
    }
}
