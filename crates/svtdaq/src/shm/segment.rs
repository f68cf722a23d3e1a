// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment mapping.
//!
//! # Segment Lifecycle
//!
//! 1. The network process creates each relay segment with `ShmSegment::create()`
//! 2. The readout process maps it with `ShmSegment::open_existing()`
//! 3. Mappings are released on drop
//! 4. The creator unlinks on shutdown (`ShmSegment::unlink()`)
//!
//! Names must start with `/` and contain no other `/`, e.g. `/svtdaq_data`.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared memory object.
///
/// Unmapped on drop, never unlinked implicitly.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is plain shared memory. All cross-thread access goes
// through the relay handles, which use atomics for every shared counter.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create (or replace) a segment of `size` bytes, zero-filled.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string. A stale segment of
        // the same name is removed first so the new one starts zeroed.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o660,
            )
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the descriptor opened above.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and closed exactly once on this path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = Self::map_and_close(fd, size)?;

        // SAFETY: ptr maps `size` writable bytes that no one else references yet.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        log::debug!("[SHM] Created {} ({} bytes)", name, size);
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map an existing segment using `size` bytes from its start.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let fd = Self::open_fd(name)?;
        let ptr = Self::map_and_close(fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map an existing segment in full, taking its size from the object itself.
    pub fn open_existing(name: &str) -> Result<Self> {
        let fd = Self::open_fd(name)?;

        // SAFETY: zeroed stat is a valid out-parameter; fd is valid.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and closed exactly once on this path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentOpen(err));
        }

        let size = st.st_size as usize;
        let ptr = Self::map_and_close(fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Remove a segment name. A missing segment is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = Self::c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Whether a segment of this name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return false;
        }
        // SAFETY: fd was just opened and is not used afterwards.
        unsafe { libc::close(fd) };
        true
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Typed pointer at `offset` bytes into the mapping.
    ///
    /// Returns `None` when `T` would not fit or would be misaligned.
    pub(crate) fn at<T>(&self, offset: usize) -> Option<*mut T> {
        let end = offset.checked_add(std::mem::size_of::<T>())?;
        if end > self.size || offset % std::mem::align_of::<T>() != 0 {
            return None;
        }
        // SAFETY: offset + size_of::<T>() is within the mapping (checked above).
        Some(unsafe { self.ptr.add(offset) }.cast::<T>())
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn c_name(name: &str) -> Result<CString> {
        let valid = name.starts_with('/') && !name[1..].contains('/') && name.len() <= 255;
        if !valid || name.len() < 2 {
            return Err(ShmError::InvalidName(name.to_string()));
        }
        CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
    }

    fn open_fd(name: &str) -> Result<libc::c_int> {
        let c_name = Self::c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string; no O_CREAT, mode unused.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }
        Ok(fd)
    }

    /// Map `size` bytes of `fd` read/write shared, then close `fd`.
    fn map_and_close(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        if size == 0 {
            // SAFETY: fd is valid and closed exactly once on this path.
            unsafe { libc::close(fd) };
            return Err(ShmError::Mmap(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-length segment",
            )));
        }

        // SAFETY: null hint lets the kernel choose the address; fd is valid.
        // The mapping keeps its own reference, so fd is closed right after.
        let ptr = unsafe {
            let p = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            p
        };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr.cast::<u8>())
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::unique_name;

    #[test]
    fn test_name_rules() {
        assert!(ShmSegment::c_name("/svtdaq_data").is_ok());
        assert!(ShmSegment::c_name("svtdaq").is_err());
        assert!(ShmSegment::c_name("/a/b").is_err());
        assert!(ShmSegment::c_name("/").is_err());
    }

    #[test]
    fn test_create_then_open_existing_shares_bytes() {
        let name = unique_name("seg");
        let seg1 = ShmSegment::create(&name, 4096).expect("create");
        // SAFETY: offset 7 is inside the 4096-byte mapping.
        unsafe { *seg1.as_ptr().add(7) = 0x5A };

        let seg2 = ShmSegment::open_existing(&name).expect("open");
        assert_eq!(seg2.size(), 4096);
        // SAFETY: same object, same offset.
        assert_eq!(unsafe { *seg2.as_ptr().add(7) }, 0x5A);

        drop(seg1);
        drop(seg2);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_open_missing() {
        let name = unique_name("missing");
        assert!(matches!(
            ShmSegment::open_existing(&name),
            Err(ShmError::NotFound(_))
        ));
        assert!(!ShmSegment::exists(&name));
    }

    #[test]
    fn test_typed_pointer_bounds() {
        let name = unique_name("at");
        let seg = ShmSegment::create(&name, 64).expect("create");
        assert!(seg.at::<u32>(60).is_some());
        assert!(seg.at::<u32>(62).is_none());
        assert!(seg.at::<u64>(60).is_none());
        ShmSegment::unlink(&name).ok();
        assert!(ShmSegment::unlink(&name).is_ok());
    }
}
