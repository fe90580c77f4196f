//! Named shared-memory segments backed by `/dev/shm`.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

static SKIP_UNLINK_ON_DROP: AtomicBool = AtomicBool::new(false);

/// Suppresses removal of owned segments when their handle drops, so tests
/// can inspect segments post-mortem. Test-only; affects the whole process.
pub fn set_skip_unlink_on_drop(skip: bool) {
    SKIP_UNLINK_ON_DROP.store(skip, Ordering::Relaxed);
}

/// Size of one shared-memory page, queried at runtime.
pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// A mapped shared-memory segment exactly one page long.
///
/// The creator owns the OS-level name and unlinks it on drop; openers only
/// release their mapping.
pub(crate) struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    owner: bool,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Creates a new segment named `name`, sized to one page.
    ///
    /// The caller becomes the owner and is responsible for the lifetime of
    /// the OS-level name.
    ///
    /// # Safety
    /// The caller must ensure no other live segment uses `name`.
    pub unsafe fn create(name: &str) -> io::Result<Self> {
        let name = name_to_cstring(name)?;
        let size = page_size();

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(name.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32));
        }

        let ptr = match unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "page size must be non-zero")
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(name.as_c_str());
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name,
            fd: fd.into_raw_fd(),
            owner: true,
        })
    }

    /// Opens an existing segment named `name` and maps one page of it.
    ///
    /// # Safety
    /// The caller must ensure the segment exists and was sized by `create`.
    pub unsafe fn open(name: &str) -> io::Result<Self> {
        let name = name_to_cstring(name)?;
        let size = page_size();

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        let ptr = match unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "page size must be non-zero")
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name,
            fd: fd.into_raw_fd(),
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
            let _ = close(self.fd);
        }
        if self.owner && !SKIP_UNLINK_ON_DROP.load(Ordering::Relaxed) {
            let _ = shm_unlink(self.name.as_c_str());
        }
    }
}

/// Removes a segment by name without opening it.
pub(crate) fn unlink(name: &str) -> io::Result<()> {
    let name = name_to_cstring(name)?;
    shm_unlink(name.as_c_str()).map_err(|e| io::Error::from_raw_os_error(e as i32))
}

fn name_to_cstring(name: &str) -> io::Result<CString> {
    // shm_open requires a leading slash
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };

    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains null byte"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_create_and_open() {
        let name = format!("shm_exchange_test_{}", std::process::id());

        unsafe {
            let shm1 = SharedMemory::create(&name).unwrap();
            assert_eq!(shm1.size(), page_size());

            std::ptr::write_volatile(shm1.as_ptr(), 42u8);

            let shm2 = SharedMemory::open(&name).unwrap();
            assert_eq!(shm2.size(), shm1.size());

            let value = std::ptr::read_volatile(shm2.as_ptr());
            assert_eq!(value, 42u8);

            drop(shm2);
            drop(shm1);
        }
    }

    #[test]
    fn test_create_existing_fails() {
        let name = format!("shm_exchange_dup_{}", std::process::id());

        unsafe {
            let _shm = SharedMemory::create(&name).unwrap();
            assert!(SharedMemory::create(&name).is_err());
        }
    }

    #[test]
    fn test_owner_unlink_and_skip_toggle() {
        let name = format!("shm_exchange_unlink_{}", std::process::id());
        let path = format!("/dev/shm/{}", name);

        unsafe {
            let shm = SharedMemory::create(&name).unwrap();
            assert!(Path::new(&path).exists());
            drop(shm);
            assert!(!Path::new(&path).exists());

            set_skip_unlink_on_drop(true);
            let shm = SharedMemory::create(&name).unwrap();
            drop(shm);
            set_skip_unlink_on_drop(false);

            assert!(Path::new(&path).exists());
            unlink(&name).unwrap();
            assert!(!Path::new(&path).exists());
        }
    }
}
