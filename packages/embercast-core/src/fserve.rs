//! Static file-serving seam.
//!
//! Intro replay and rate-limited fallback files are handled by a file-serve
//! module outside the core; the core calls through this trait. The bundled
//! [`WebrootFileServe`] implements intro reads against a webroot directory
//! and declines fallback-file handoffs (a front end that wants them plugs
//! in its own implementation).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::client::ClientHandle;

/// External file-serving hooks.
pub trait FileServe: Send + Sync {
    /// Reads up to `max` bytes of the named intro file at `offset`.
    ///
    /// An empty buffer means end of file; the caller rewinds and loops.
    fn read_intro(&self, name: &str, offset: u64, max: usize) -> io::Result<Bytes>;

    /// Takes over a listener to serve a static file at `rate_bits` bits/sec.
    ///
    /// Returns true when the client was taken; false leaves the client with
    /// the caller (typically ending in a 404).
    fn serve_fallback_file(&self, _client: &ClientHandle, _mount: &str, _rate_bits: u64) -> bool {
        false
    }

    /// An override was requested for a mount with no live source.
    fn set_override(&self, _from_mount: &str, _to_mount: &str) {}
}

/// File serving rooted at a webroot directory.
pub struct WebrootFileServe {
    root: PathBuf,
}

impl WebrootFileServe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        // Keep lookups inside the webroot.
        let rel = Path::new(name.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path escapes webroot",
            ));
        }
        Ok(self.root.join(rel))
    }
}

impl FileServe for WebrootFileServe {
    fn read_intro(&self, name: &str, offset: u64, max: usize) -> io::Result<Bytes> {
        let path = self.resolve(name)?;
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; max];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

/// File serving disabled entirely.
pub struct NoFileServe;

impl FileServe for NoFileServe {
    fn read_intro(&self, _name: &str, _offset: u64, _max: usize) -> io::Result<Bytes> {
        Err(io::ErrorKind::NotFound.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn intro_reads_are_offset_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intro.mp3");
        File::create(&path)
            .unwrap()
            .write_all(b"abcdefghij")
            .unwrap();
        let fs = WebrootFileServe::new(dir.path());
        assert_eq!(&fs.read_intro("intro.mp3", 0, 4).unwrap()[..], b"abcd");
        assert_eq!(&fs.read_intro("intro.mp3", 8, 4).unwrap()[..], b"ij");
        assert!(fs.read_intro("intro.mp3", 10, 4).unwrap().is_empty());
    }

    #[test]
    fn parent_traversal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let fs = WebrootFileServe::new(dir.path());
        assert!(fs.read_intro("../etc/passwd", 0, 16).is_err());
    }
}
