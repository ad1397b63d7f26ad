use std::fmt;
use std::ptr::NonNull;

/// Crate-wide error type.
///
/// Only externally-caused failures are represented here. Caller contract
/// violations (misaligned pointers, allocating before init, block-size
/// mismatches) are programming bugs and assert instead of returning.
#[derive(Debug)]
pub enum PoolError {
    /// Host allocation refused, or disk space exhausted while preallocating
    /// or zeroing a backing file.
    OutOfMemory(std::io::Error),
    /// A named path exists but is not a readable regular file, its length is
    /// not a multiple of the page size, or a caller-supplied size disagrees
    /// with the on-disk length.
    FilesystemInvalid(String),
    /// An illegal parameter combination (read-only + zero-init, copy-on-write
    /// on a missing file, missing file with no size, bad block size).
    ConfigurationInvalid(String),
    /// The backing file is not writable but the requested mode needs to write.
    PermissionsInvalid(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::OutOfMemory(e) => write!(f, "out of memory: {e}"),
            PoolError::FilesystemInvalid(msg) => write!(f, "invalid backing file: {msg}"),
            PoolError::ConfigurationInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            PoolError::PermissionsInvalid(msg) => write!(f, "insufficient permissions: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::OutOfMemory(e) => Some(e),
            PoolError::FilesystemInvalid(_)
            | PoolError::ConfigurationInvalid(_)
            | PoolError::PermissionsInvalid(_) => None,
        }
    }
}

/// Abstract interface to the host memory system.
///
/// The platform implementation issues real syscalls; under `cfg(loom)` and
/// Miri a heap-backed mock stands in so the synchronization logic can be
/// model-checked without touching the OS.
pub(crate) trait HostOps {
    /// Allocate `size` bytes aligned to the host page size.
    /// `size` must be a non-zero multiple of [`page_size`](Self::page_size).
    fn alloc_chunk(size: usize) -> Result<NonNull<u8>, PoolError>;

    /// Return a chunk previously obtained from [`alloc_chunk`](Self::alloc_chunk).
    ///
    /// # Safety
    /// `ptr`/`size` must match a live `alloc_chunk` result exactly, and the
    /// chunk must not be accessed afterwards.
    unsafe fn free_chunk(ptr: NonNull<u8>, size: usize);

    /// OS page size, discovered once and cached.
    fn page_size() -> usize;

    /// Total physical memory in bytes (best effort; used only to derive
    /// default pool bounds).
    fn physical_memory() -> usize;
}

pub(crate) struct PlatformHostOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{HostOps, PlatformHostOps, PoolError};
    use std::io;
    use std::ptr::NonNull;

    impl HostOps for PlatformHostOps {
        fn alloc_chunk(size: usize) -> Result<NonNull<u8>, PoolError> {
            debug_assert!(
                size != 0 && size.is_multiple_of(Self::page_size()),
                "alloc_chunk: size ({size}) must be a non-zero multiple of the page size",
            );
            // Anonymous mappings are always page-aligned and zero-filled.
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(PoolError::OutOfMemory(io::Error::last_os_error()));
            }
            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(PoolError::OutOfMemory(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn free_chunk(ptr: NonNull<u8>, size: usize) {
            // Safety: FFI call to munmap; ptr/size come from alloc_chunk.
            let rc = unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) };
            debug_assert!(rc == 0, "munmap failed: {}", io::Error::last_os_error());
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; the page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn physical_memory() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
                if pages <= 0 {
                    // Probe failed; fall back to a conservative 4 GiB.
                    return 4 * 1024 * 1024 * 1024;
                }
                #[allow(clippy::cast_sign_loss)]
                {
                    (pages as usize).saturating_mul(Self::page_size())
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed HostOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead every chunk is backed by
// a plain heap allocation, zeroed to match mmap's fresh-page guarantee.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl HostOps for PlatformHostOps {
    fn alloc_chunk(size: usize) -> Result<NonNull<u8>, PoolError> {
        debug_assert!(size != 0 && size.is_multiple_of(Self::page_size()));
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| PoolError::OutOfMemory(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            PoolError::OutOfMemory(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn free_chunk(ptr: NonNull<u8>, size: usize) {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .expect("layout accepted by alloc_chunk");
        // Safety: ptr was allocated with the same layout via alloc_chunk.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    fn page_size() -> usize {
        4096
    }

    fn physical_memory() -> usize {
        4 * 1024 * 1024 * 1024
    }
}
