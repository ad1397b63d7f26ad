use super::free_list::FreeList;
use super::os::{HostOps, PlatformHostOps, PoolError};
use super::stats::{self, Counter};
use super::tagged::TaggedHead;
use crate::sync::atomic::Ordering;
use log::{debug, trace};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::ptr::NonNull;

use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;

#[cfg(debug_assertions)]
use crate::sync::Mutex;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

/// Free list over a mapped region that extends itself lazily.
///
/// Push is the ordinary lock-free push. Pop treats a null `next` inside the
/// region as "the successor is the next block by address": a freshly mapped
/// file starts as one list entry at `base` with every `next` zero, and the
/// chain is discovered block by block as allocations walk the region. This
/// keeps initialization from dirtying every page of a sparse file; a block's
/// page is touched only when the block is handed out.
///
/// Once a block has been deallocated at least once its `next` holds a real
/// successor (or the terminal null), so a reopened persistent file
/// rediscovers its free layout by the same rule.
#[derive(Debug)]
pub(crate) struct MappedList {
    inner: FreeList,
}

impl MappedList {
    pub(crate) fn new() -> Self {
        Self {
            inner: FreeList::new(),
        }
    }

    /// Point the head at `base` with tag zero. Called once per mapping.
    pub(crate) fn initialize(&self, base: NonNull<u8>) {
        self.inner.initialize(base);
    }

    pub(crate) fn push(&self, ptr: NonNull<u8>) {
        self.inner.push(ptr);
    }

    /// Pop the front block of the region `[base, base + len)`.
    pub(crate) fn pop(&self, base: *mut u8, len: usize, block_size: usize) -> Option<NonNull<u8>> {
        let mut head = self.inner.load_head(Ordering::Acquire);
        while !head.is_empty() {
            // Safety: a non-empty head points into the live mapping.
            let mut new_head = unsafe { head.next() };
            if new_head.ptr().is_null() {
                // This block was never handed out before: the real successor
                // is simply the next block in the region, unless we just
                // popped the last one.
                let front = head.ptr();
                // Safety: front lies inside the mapping.
                let second = unsafe { front.add(block_size) };
                let end = base as usize + len;
                new_head = if second as usize >= end {
                    TaggedHead::EMPTY
                } else {
                    TaggedHead(TaggedHead::encode(second, head.tag().wrapping_add(1)))
                };
            }
            match self
                .inner
                .cas_head(head, new_head, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    // Safety: non-empty heads carry non-null pointers.
                    return Some(unsafe { NonNull::new_unchecked(head.ptr()) });
                }
                Err(current) => head = TaggedHead(current),
            }
        }
        None
    }
}

/// Mapping mode for a [`MappedPool`] backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Shared writable mapping; block contents survive unmap and reopen.
    ///
    /// Free-list links written by `deallocate` hold absolute addresses and
    /// are only meaningful within the mapping session that wrote them. A
    /// file is safe to reopen when every block was either still handed out
    /// or never touched at unmap time; otherwise zero the file on reopen
    /// (`zero_init`).
    Persistent,
    /// Private writable mapping; every modification is discarded on unmap.
    /// Not persistent in any form; the name refers to the kernel-level
    /// copy-on-write of the mapped pages, not to durability.
    CopyOnWrite,
    /// Read-only mapping. Deallocation is impossible (it would write the
    /// free-list link into the block).
    ReadOnly,
}

/// A fixed-block pool carved from a memory-mapped file.
///
/// The backing file is flat and headerless: block `k` lives at offset
/// `k * block_size`, and the first word of a free block is its free-list
/// link. Tag state is not persisted; every fresh mapping starts with the
/// head at `base`, tag zero, and rediscovers free space lazily.
#[derive(Debug)]
pub struct MappedPool {
    base: NonNull<u8>,
    len: usize,
    block_size: usize,
    list: MappedList,
    blocks_allocated: Counter,
    /// Shadow map of handed-out blocks, for double-free detection.
    #[cfg(debug_assertions)]
    live: Mutex<FixedBitSet>,
}

// Safety: the mapping is owned by the pool; all shared mutation goes through
// the atomic head (and the debug Mutex).
unsafe impl Send for MappedPool {}
// Safety: see above.
unsafe impl Sync for MappedPool {}

impl MappedPool {
    /// Open (or create) `path` and map it as a pool of `block_size`-byte
    /// blocks.
    ///
    /// `file_size == 0` means "use the existing file's length"; a nonzero
    /// value must match an existing file exactly and is the creation size
    /// for a missing one. `zero_init` zeroes the backing range before use
    /// (via a filesystem range-zero, so sparse files stay sparse).
    ///
    /// # Errors
    ///
    /// - [`PoolError::ConfigurationInvalid`] for illegal parameter
    ///   combinations (missing file without a size, read-only or
    ///   copy-on-write on a missing file, read-only + zero-init, a block
    ///   size the page size does not divide, a length the block size does
    ///   not divide).
    /// - [`PoolError::FilesystemInvalid`] when the path is not a readable
    ///   regular file, its length is not a page multiple, or a supplied
    ///   `file_size` disagrees with the on-disk length.
    /// - [`PoolError::PermissionsInvalid`] when the file is not writable but
    ///   `Persistent` or `zero_init` demands writing.
    /// - [`PoolError::OutOfMemory`] when disk preallocation, zeroing, or the
    ///   mapping itself fails.
    ///
    /// On error nothing is left behind: no mapping, no open descriptor.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        file_size: usize,
        mode: MapMode,
        zero_init: bool,
    ) -> Result<Self, PoolError> {
        let path = path.as_ref();
        let page_size = PlatformHostOps::page_size();

        // block_size must hold a free-list link and map to whole pages.
        if block_size < std::mem::size_of::<usize>()
            || block_size % page_size != 0
        {
            return Err(PoolError::ConfigurationInvalid(format!(
                "block size {block_size} is not a multiple of the page size ({page_size})",
            )));
        }
        if file_size % page_size != 0 {
            return Err(PoolError::ConfigurationInvalid(format!(
                "file size {file_size} is not a multiple of the page size ({page_size})",
            )));
        }
        if mode == MapMode::ReadOnly && zero_init {
            return Err(PoolError::ConfigurationInvalid(
                "zero_init makes no sense for a read-only mapping".into(),
            ));
        }

        let status = match std::fs::metadata(path) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(PoolError::FilesystemInvalid(format!(
                    "cannot stat {}: {e}",
                    path.display(),
                )))
            }
        };

        let (file, len) = match status {
            None => {
                if file_size == 0 {
                    return Err(PoolError::ConfigurationInvalid(format!(
                        "{} does not exist and no size was provided",
                        path.display(),
                    )));
                }
                if mode == MapMode::ReadOnly {
                    return Err(PoolError::ConfigurationInvalid(format!(
                        "read-only mapping requested but {} does not exist",
                        path.display(),
                    )));
                }
                if mode == MapMode::CopyOnWrite {
                    return Err(PoolError::ConfigurationInvalid(format!(
                        "copy-on-write requested but {} does not exist",
                        path.display(),
                    )));
                }
                // Validate before touching the filesystem so a bad
                // configuration leaves nothing behind.
                if file_size % block_size != 0 {
                    return Err(PoolError::ConfigurationInvalid(format!(
                        "file size {file_size} is not a multiple of the block size {block_size}",
                    )));
                }
                let file = Self::create_file(path)?;
                // Reserve the full extent now so running out of disk space
                // later cannot fault the mapping; a fresh file reads back as
                // zeros, so zero_init is already satisfied.
                preallocate(&file, file_size)?;
                (file, file_size)
            }
            Some(meta) => {
                let readable = meta.is_file() && (meta.permissions().mode() & 0o444) != 0;
                if !readable {
                    return Err(PoolError::FilesystemInvalid(format!(
                        "{} exists but is not a {}",
                        path.display(),
                        if meta.is_file() {
                            "readable file"
                        } else {
                            "regular file"
                        },
                    )));
                }
                let writable = (meta.permissions().mode() & 0o222) != 0;
                if !writable {
                    if mode == MapMode::Persistent {
                        return Err(PoolError::PermissionsInvalid(format!(
                            "persistent mode requested but {} is not writable",
                            path.display(),
                        )));
                    }
                    if zero_init {
                        return Err(PoolError::PermissionsInvalid(format!(
                            "zero_init requested for unwritable file {}",
                            path.display(),
                        )));
                    }
                }

                let disk_len = meta.len() as usize;
                let len = if file_size == 0 {
                    if disk_len % page_size != 0 {
                        return Err(PoolError::FilesystemInvalid(format!(
                            "length of {} ({disk_len}) is not a multiple of the page size ({page_size})",
                            path.display(),
                        )));
                    }
                    disk_len
                } else if disk_len != file_size {
                    return Err(PoolError::FilesystemInvalid(format!(
                        "provided size ({file_size}) does not match the length of {} ({disk_len})",
                        path.display(),
                    )));
                } else {
                    file_size
                };

                let file = Self::open_file(path, mode)?;
                if mode == MapMode::Persistent && zero_init {
                    zero_range(&file, len)?;
                }
                (file, len)
            }
        };

        if len == 0 || len % block_size != 0 {
            return Err(PoolError::ConfigurationInvalid(format!(
                "mapped length {len} is not a nonzero multiple of the block size {block_size}",
            )));
        }

        let prot = match mode {
            MapMode::ReadOnly => libc::PROT_READ,
            MapMode::Persistent | MapMode::CopyOnWrite => libc::PROT_READ | libc::PROT_WRITE,
        };
        let flags = match mode {
            MapMode::Persistent => libc::MAP_SHARED,
            MapMode::CopyOnWrite | MapMode::ReadOnly => libc::MAP_PRIVATE,
        };
        // Safety: FFI call to mmap; the fd stays open across the call.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PoolError::OutOfMemory(io::Error::last_os_error()));
        }
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| PoolError::OutOfMemory(io::Error::other("mmap returned null")))?;
        // The descriptor is no longer needed; the mapping keeps the file
        // alive. `file` drops here.

        debug!(
            "MappedPool: mapped {} ({} blocks of {} bytes, {:?}) at {:p}",
            path.display(),
            len / block_size,
            block_size,
            mode,
            base,
        );

        let list = MappedList::new();
        list.initialize(base);
        stats::MAPPED_BYTES.add(len);

        Ok(Self {
            base,
            len,
            block_size,
            list,
            blocks_allocated: Counter::new(),
            #[cfg(debug_assertions)]
            live: Mutex::new(FixedBitSet::with_capacity(len / block_size)),
        })
    }

    fn create_file(path: &Path) -> Result<File, PoolError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
            .map_err(|e| {
                PoolError::FilesystemInvalid(format!("failed to create {}: {e}", path.display()))
            })
    }

    fn open_file(path: &Path, mode: MapMode) -> Result<File, PoolError> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if mode == MapMode::Persistent {
            opts.write(true);
        }
        opts.open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                PoolError::PermissionsInvalid(format!("cannot open {}: {e}", path.display()))
            } else {
                PoolError::FilesystemInvalid(format!("cannot open {}: {e}", path.display()))
            }
        })
    }

    /// Total mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The fixed block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently handed out (running leak counter).
    #[must_use]
    pub fn blocks_allocated(&self) -> usize {
        self.blocks_allocated.get()
    }

    /// Allocate one block, or `None` when the region is exhausted.
    ///
    /// The returned address always lies in `[base, base + len)`.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let ptr = self
            .list
            .pop(self.base.as_ptr(), self.len, self.block_size)?;
        trace!("MappedPool: handing out block {ptr:p}");
        self.blocks_allocated.add(1);
        #[cfg(debug_assertions)]
        {
            let mut live = self.live.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let index = (ptr.as_ptr() as usize - self.base.as_ptr() as usize) / self.block_size;
            assert!(!live.contains(index), "block {ptr:p} handed out twice");
            live.insert(index);
        }
        Some(ptr)
    }

    /// Return a block to the pool.
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`allocate`](Self::allocate) on
    ///   this pool and not freed since.
    /// - The pool must not be mapped read-only (the free-list link is
    ///   written into the block).
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        #[cfg(debug_assertions)]
        {
            let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
            assert!(
                offset < self.len,
                "pointer {ptr:p} does not belong to this MappedPool",
            );
            assert!(
                offset.is_multiple_of(self.block_size),
                "pointer {ptr:p} is not aligned to the block size",
            );
            let mut live = self.live.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let index = offset / self.block_size;
            assert!(live.contains(index), "double free of block {ptr:p}");
            live.set(index, false);
        }
        self.list.push(ptr);
        self.blocks_allocated.sub(1);
    }
}

impl Drop for MappedPool {
    fn drop(&mut self) {
        // Safety: base/len describe the mapping created in open().
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.len) };
        debug_assert!(rc == 0, "munmap failed: {}", io::Error::last_os_error());
        stats::sub_saturating(&stats::MAPPED_BYTES, self.len);
    }
}

/// Reserve disk space for the whole extent. Any subregion that held no data
/// before the call reads back as zeros afterwards.
#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: usize) -> Result<(), PoolError> {
    // Safety: FFI call to fallocate on an owned descriptor.
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
    if rc == -1 {
        return Err(PoolError::OutOfMemory(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn preallocate(file: &File, len: usize) -> Result<(), PoolError> {
    file.set_len(len as u64).map_err(PoolError::OutOfMemory)
}

/// Zero the first `len` bytes of the file, preferably by converting the
/// range into unwritten extents so no data blocks are actually written.
#[cfg(target_os = "linux")]
fn zero_range(file: &File, len: usize) -> Result<(), PoolError> {
    // Safety: FFI call to fallocate on an owned descriptor.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_ZERO_RANGE,
            0,
            len as libc::off_t,
        )
    };
    if rc == -1 {
        // Classified as a disk-space problem: the filesystem could not
        // provide zeroed extents for the range.
        return Err(PoolError::OutOfMemory(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn zero_range(file: &File, len: usize) -> Result<(), PoolError> {
    // Truncate-and-regrow zeroes the range portably.
    file.set_len(0).map_err(PoolError::OutOfMemory)?;
    file.set_len(len as u64).map_err(PoolError::OutOfMemory)
}
