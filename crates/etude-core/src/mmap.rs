// src/mmap.rs
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};

/// Read-only private mapping of a whole file.
///
/// The mapping is released exactly once: either by an explicit
/// [`release`](Self::release) or when the guard is dropped.
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
    mapped: bool,
}

// SAFETY: the region is mapped PROT_READ and never written through, and the
// guard is the only owner of the mapping.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large to map"))?;

        // mmap rejects zero-length regions
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
                mapped: false,
            });
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self {
            ptr,
            len,
            mapped: true,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live PROT_READ mapping (or an empty
        // dangling slice), valid until `release`, which takes `&mut self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Unmap now. Safe to call more than once.
    pub fn release(&mut self) {
        if self.mapped {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
            self.mapped = false;
        }
        self.ptr = NonNull::dangling();
        self.len = 0;
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("len", &self.len)
            .field("mapped", &self.mapped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_maps_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"<html>mapped</html>").unwrap();

        let mut map = MappedFile::open(file.path()).unwrap();
        assert_eq!(map.as_slice(), b"<html>mapped</html>");

        map.release();
        assert!(map.is_empty());
        map.release();
    }

    #[test]
    fn test_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let map = MappedFile::open(file.path()).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.as_slice(), b"");
    }

    #[test]
    fn test_missing_file() {
        let err = MappedFile::open(Path::new("/definitely/not/here.html")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
