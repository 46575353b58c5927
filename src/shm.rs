// src/shm.rs
//
//! POSIX shared-memory segments for the node-local preload cache.
//!
//! When every rank on a node needs the same preloaded records, the node
//! master creates one segment, fills it, and the other local ranks map it
//! read-only. Record payloads are then served as zero-copy [`Bytes`] slices
//! over the mapping instead of per-rank heap copies.
//!
//! Unix-only; the preload-cache path is gated accordingly.

#![cfg(unix)]

use std::ffi::CString;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, StageError};

/// One mapped shared-memory segment. The creating rank unlinks the name on
/// drop; every mapping munmaps.
pub struct SharedSegment {
    name: CString,
    addr: *mut libc::c_void,
    len: usize,
    owner: bool,
}

// the mapping is plain bytes at a stable address
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

fn segment_name(tag: &str, node_id: usize) -> Result<CString> {
    CString::new(format!("/shardstage_{}_{}", tag, node_id)).map_err(|_| {
        StageError::Invariant(format!("segment tag '{}' contains a NUL byte", tag))
    })
}

fn errno_detail(what: &str, name: &CString) -> StageError {
    StageError::ResourceExhausted(format!(
        "{} failed for shm segment {:?}: {}",
        what,
        name,
        std::io::Error::last_os_error()
    ))
}

impl SharedSegment {
    /// Create (or replace) the segment and map it read-write. Node-master
    /// side.
    pub fn create(tag: &str, node_id: usize, len: usize) -> Result<Self> {
        let name = segment_name(tag, node_id)?;
        // a stale segment from a crashed run must not alias this one
        unsafe { libc::shm_unlink(name.as_ptr()) };
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(errno_detail("shm_open", &name));
        }
        let ok = unsafe { libc::ftruncate(fd, len as libc::off_t) } == 0;
        if !ok {
            let e = errno_detail("ftruncate", &name);
            unsafe {
                libc::close(fd);
                libc::shm_unlink(name.as_ptr());
            }
            return Err(e);
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            let e = errno_detail("mmap", &name);
            unsafe { libc::shm_unlink(name.as_ptr()) };
            return Err(e);
        }
        Ok(Self {
            name,
            addr,
            len,
            owner: true,
        })
    }

    /// Map an existing segment read-only. Non-master side; call after the
    /// node barrier that orders creation before attachment.
    pub fn attach(tag: &str, node_id: usize, len: usize) -> Result<Self> {
        let name = segment_name(tag, node_id)?;
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0o600) };
        if fd < 0 {
            return Err(errno_detail("shm_open", &name));
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            return Err(errno_detail("mmap", &name));
        }
        Ok(Self {
            name,
            addr,
            len,
            owner: false,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    /// Writable view; only meaningful on the creating rank's mapping.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.owner {
            return Err(StageError::Invariant(
                "write access to a read-only shm mapping".to_string(),
            ));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.addr as *mut u8, self.len) })
    }

    /// A zero-copy `Bytes` over `[offset, offset + len)` of the mapping,
    /// keeping the segment alive for as long as the bytes are.
    pub fn slice(self: &Arc<Self>, offset: usize, len: usize) -> Result<Bytes> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(StageError::Invariant(format!(
                "shm slice [{}, {}+{}) outside segment of {} bytes",
                offset, offset, len, self.len
            )));
        }
        Ok(Bytes::from_owner(SegmentSlice {
            segment: Arc::clone(self),
            offset,
            len,
        }))
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

struct SegmentSlice {
    segment: Arc<SharedSegment>,
    offset: usize,
    len: usize,
}

impl AsRef<[u8]> for SegmentSlice {
    fn as_ref(&self) -> &[u8] {
        &self.segment.as_slice()[self.offset..self.offset + self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fill_attach_read() {
        let mut seg = SharedSegment::create("test_cfar", std::process::id() as usize, 64).unwrap();
        seg.as_mut_slice().unwrap()[..5].copy_from_slice(b"hello");

        let peer = SharedSegment::attach("test_cfar", std::process::id() as usize, 64).unwrap();
        assert_eq!(&peer.as_slice()[..5], b"hello");
        assert!(SharedSegment::attach("test_cfar", std::process::id() as usize, 64)
            .unwrap()
            .len()
            == 64);
    }

    #[test]
    fn slices_are_zero_copy_views() {
        let mut seg =
            SharedSegment::create("test_slice", std::process::id() as usize, 16).unwrap();
        seg.as_mut_slice().unwrap().copy_from_slice(&[7u8; 16]);
        let seg = Arc::new(seg);
        let b = seg.slice(4, 8).unwrap();
        assert_eq!(b.as_ref(), &[7u8; 8]);
        assert!(seg.slice(10, 10).is_err());
    }

    #[test]
    fn readonly_mapping_rejects_writes() {
        let _seg =
            SharedSegment::create("test_ro", std::process::id() as usize, 8).unwrap();
        let mut peer = SharedSegment::attach("test_ro", std::process::id() as usize, 8).unwrap();
        assert!(peer.as_mut_slice().is_err());
    }
}
