//! Named POSIX shared-memory objects mapped read-write.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr::NonNull;

use shm_primitives::Region;

use crate::error::ShmError;

/// One `mmap` of a named shared-memory object.
///
/// The fd is closed as soon as the mapping exists. Dropping unmaps; only
/// [`ShmMapping::unlink`] removes the name.
#[derive(Debug)]
pub struct ShmMapping {
    name: String,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; synchronization is the job of
// whatever lives inside it.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    /// Create `name` exclusively, size it to `len` and map it.
    ///
    /// Fails with `io::ErrorKind::AlreadyExists` if the name is taken.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };

        let mapped = file
            .set_len(len as u64)
            .and_then(|()| map_file(&file, len));
        match mapped {
            Ok(base) => Ok(Self {
                name: name.to_string(),
                base,
                len,
            }),
            Err(e) => {
                // SAFETY: we created this name above.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Open an existing object and map all of it.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by shm_open.
        let file = unsafe { File::from_raw_fd(fd) };

        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "segment too large"))?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment is empty",
            ));
        }
        let base = map_file(&file, len)?;
        Ok(Self {
            name: name.to_string(),
            base,
            len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
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
    pub fn region(&self) -> Region {
        // SAFETY: base..base+len stays mapped until self is dropped.
        unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
    }

    /// Remove the name. Existing mappings (in any process) stay valid.
    pub fn unlink(&self) -> Result<(), ShmError> {
        let unavailable = |source| ShmError::Unavailable {
            name: self.name.clone(),
            source,
        };
        let c_name = c_name(&self.name).map_err(unavailable)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            return Err(unavailable(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: base and len came from a successful mmap.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn map_file(file: &File, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: fd is open read-write; the kernel picks the address.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr as *mut u8)
        .ok_or_else(|| io::Error::other("mmap returned null"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_name() -> String {
        format!(
            "/shmp-mapping-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn create_open_share_bytes() {
        let name = unique_name();
        let owner = ShmMapping::create(&name, 4096).unwrap();
        unsafe { owner.region().offset(100).write(0xAB) };

        let other = ShmMapping::open(&name).unwrap();
        assert_eq!(other.len(), 4096);
        assert_eq!(unsafe { other.region().offset(100).read() }, 0xAB);

        owner.unlink().unwrap();
        // The attached mapping survives the unlink.
        assert_eq!(unsafe { other.region().offset(100).read() }, 0xAB);
        assert_eq!(
            ShmMapping::open(&name).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique_name();
        let first = ShmMapping::create(&name, 4096).unwrap();
        let err = ShmMapping::create(&name, 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        first.unlink().unwrap();
    }
}
