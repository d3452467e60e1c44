//! Read-only memory mapping of a backing file.

use std::fs::File;
use std::io;

/// A read-only shared mapping, unmapped on drop.
#[cfg(unix)]
pub struct MappedRegion {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
}

// The mapping is never written through and the pointer is owned.
#[cfg(unix)]
unsafe impl Send for MappedRegion {}
#[cfg(unix)]
unsafe impl Sync for MappedRegion {}

#[cfg(unix)]
impl MappedRegion {
    /// Map the whole of `file` at its current size.
    pub fn map(file: &File) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "backing file too large"))?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "backing file is empty",
            ));
        }

        // SAFETY: fd is valid for the duration of the call; a null hint lets
        // the kernel choose the address. The result is checked below.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = std::ptr::NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(MappedRegion { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(unix)]
impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: the region was returned by mmap with exactly this length
        // and is unmapped only here.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len);
        }
    }
}

#[cfg(unix)]
impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len).finish()
    }
}

/// Without mmap the region is a copy taken at attach time.
#[cfg(not(unix))]
#[derive(Debug)]
pub struct MappedRegion {
    bytes: Vec<u8>,
}

#[cfg(not(unix))]
impl MappedRegion {
    pub fn map(file: &File) -> io::Result<Self> {
        use std::io::Read;

        let mut bytes = Vec::new();
        let mut file = file;
        file.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "backing file is empty",
            ));
        }
        Ok(MappedRegion { bytes })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_reads_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\xca\xfe\xc0\xc0rest").unwrap();
        file.flush().unwrap();

        let region = MappedRegion::map(file.as_file()).unwrap();
        assert_eq!(region.len(), 8);
        assert_eq!(&region.as_slice()[..4], &[0xca, 0xfe, 0xc0, 0xc0]);
    }

    #[test]
    fn test_map_empty_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = MappedRegion::map(file.as_file()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(unix)]
    #[test]
    fn test_mapping_sees_in_place_updates() {
        use std::os::unix::fs::FileExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        file.flush().unwrap();

        let region = MappedRegion::map(file.as_file()).unwrap();
        file.as_file().write_at(&[7], 3).unwrap();
        assert_eq!(region.as_slice()[3], 7);
    }
}
