//! Static files under the document root, mapped read-only for zero-copy send.

use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};
use std::ptr::NonNull;

const OTHER_READ: u32 = 0o004;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("no such resource: {0}")]
    Missing(PathBuf),
    #[error("resource not readable: {0}")]
    Forbidden(PathBuf),
    #[error("resource is a directory: {0}")]
    Directory(PathBuf),
    #[error("failed to map {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file's bytes, mapped `PROT_READ`/`MAP_PRIVATE`. Empty files are not
/// mapped at all.
#[derive(Debug)]
pub struct MappedFile {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

// Safety: the mapping is read-only and owned exclusively by this value.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Ok(Self { ptr: None, len: 0 });
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.ptr {
            // Safety: `ptr` maps exactly `len` readable bytes until drop.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            unsafe {
                let result = libc::munmap(ptr.as_ptr() as *mut libc::c_void, self.len);
                debug_assert_eq!(result, 0, "munmap failed");
            }
        }
    }
}

/// Resolve a request path against `root` and map the file.
///
/// Checked in order: `..` components, existence, the other-readable bit,
/// then whether it is a directory.
pub fn resolve(root: &Path, path: &str) -> Result<MappedFile, ResourceError> {
    let relative = Path::new(path.trim_start_matches('/'));
    let full = root.join(relative);

    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ResourceError::Forbidden(full));
    }

    let Ok(meta) = std::fs::metadata(&full) else {
        return Err(ResourceError::Missing(full));
    };
    if meta.permissions().mode() & OTHER_READ == 0 {
        return Err(ResourceError::Forbidden(full));
    }
    if meta.is_dir() {
        return Err(ResourceError::Directory(full));
    }

    let file = match File::open(&full) {
        Ok(file) => file,
        Err(source) => return Err(ResourceError::Io { path: full, source }),
    };
    match MappedFile::map(&file, meta.len() as usize) {
        Ok(mapped) => Ok(mapped),
        Err(source) => Err(ResourceError::Io { path: full, source }),
    }
}
