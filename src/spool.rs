//! Scratch-file spool backing every open handle. MTP moves whole objects, so
//! reads and writes are served from a local copy in a per-mount temporary
//! directory; writers are flushed back to the device on release.

use derivative::Derivative;
use log::{error, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};

/// Prefix of the per-mount scratch directory under the system temp location.
const SCRATCH_DIR_PREFIX: &str = "pymtpfs";

/// How often a zero-byte read is retried before partial data is returned.
const SHORT_READ_RETRIES: u32 = 2;

/// One open handle: the scratch file, where it lives, and which remote path it
/// mirrors.
#[derive(Debug)]
pub struct OpenFile {
    pub fh: u64,
    pub file: File,
    pub scratch_path: PathBuf,
    pub remote_path: String,
    pub readonly: bool,
}

impl OpenFile {
    /// Positional read with the short-read retry policy: a read that comes up
    /// short is retried a bounded number of times, then whatever was read is
    /// returned without error.
    pub fn read_at(&self, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        let mut retries = 0;

        while filled < size {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                retries += 1;
                if retries > SHORT_READ_RETRIES {
                    warn!(
                        "short read (expected {} got {} for {})",
                        size, filled, self.remote_path
                    );
                    break;
                }
            } else {
                filled += n;
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<u32> {
        self.file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Close the handle and delete its scratch file.
    pub fn discard(self) {
        drop(self.file);
        if let Err(err) = std::fs::remove_file(&self.scratch_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("could not remove scratch file {:?}: {}", self.scratch_path, err);
            }
        }
    }
}

/// The per-mount scratch directory and open-handle table.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Spool {
    #[derivative(Debug = "ignore")]
    tempdir: Option<TempDir>,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
}

impl Spool {
    pub fn new() -> io::Result<Self> {
        let tempdir = Builder::new().prefix(SCRATCH_DIR_PREFIX).tempdir()?;
        Ok(Spool {
            tempdir: Some(tempdir),
            handles: HashMap::new(),
            next_fh: 1,
        })
    }

    pub fn dir(&self) -> &Path {
        self.tempdir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new("/tmp"))
    }

    /// Allocate a scratch file for `remote_path`, keeping the original stem and
    /// extension so tools that sniff by extension keep working, and register an
    /// open handle for it.
    pub fn allocate(&mut self, remote_path: &str, readonly: bool) -> io::Result<u64> {
        let (file, scratch_path) = self.scratch_file(remote_path)?;

        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(
            fh,
            OpenFile {
                fh,
                file,
                scratch_path,
                remote_path: remote_path.to_string(),
                readonly,
            },
        );
        Ok(fh)
    }

    /// Allocate an anonymous-ish scratch file that is not tracked in the handle
    /// table (rename backups, utimens round-trips, offline truncates).
    pub fn scratch_file(&self, remote_path: &str) -> io::Result<(File, PathBuf)> {
        let name = remote_path.rsplit('/').next().unwrap_or("");
        let (stem, ext) = match name.rfind('.') {
            Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
            _ => (name, ".tmp"),
        };
        let stem = stem.trim_matches('.');
        let stem = if stem.is_empty() { "tmp" } else { stem };

        let named = Builder::new()
            .prefix(stem)
            .suffix(ext)
            .tempfile_in(self.dir())?;
        // Deletion is managed explicitly: the scratch file has to outlive this
        // call until release or an error path removes it.
        let (file, temp_path) = named.into_parts();
        let path = temp_path.keep().map_err(|err| err.error)?;

        // Reopen read-write; NamedTempFile's handle is already read-write, but
        // readers opened via this handle also need read access after O_WRONLY
        // materialisation, so make it explicit.
        drop(file);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;
        Ok((file, path))
    }

    pub fn get(&self, fh: u64) -> Option<&OpenFile> {
        self.handles.get(&fh)
    }

    pub fn get_mut(&mut self, fh: u64) -> Option<&mut OpenFile> {
        self.handles.get_mut(&fh)
    }

    /// The open handle currently backing `remote_path`, if any. At most one
    /// writer exists per remote path.
    pub fn by_path(&self, remote_path: &str) -> Option<&OpenFile> {
        self.handles.values().find(|of| of.remote_path == remote_path)
    }

    pub fn remove(&mut self, fh: u64) -> Option<OpenFile> {
        self.handles.remove(&fh)
    }

    /// Force-close every handle and delete the scratch directory. Called on
    /// unmount.
    pub fn shutdown(&mut self) {
        for (_, open_file) in self.handles.drain() {
            open_file.discard();
        }
        if let Some(tempdir) = self.tempdir.take() {
            if let Err(err) = tempdir.close() {
                error!("could not remove scratch directory: {}", err);
            }
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scratch_files_preserve_stem_and_extension() {
        let spool = Spool::new().unwrap();
        let (_file, path) = spool.scratch_file("/Internal/Music/song.mp3").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("song"), "{}", name);
        assert!(name.ends_with(".mp3"), "{}", name);
    }

    #[test]
    fn extensionless_names_get_a_tmp_suffix() {
        let spool = Spool::new().unwrap();
        let (_file, path) = spool.scratch_file("/Internal/LICENSE").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("LICENSE"), "{}", name);
        assert!(name.ends_with(".tmp"), "{}", name);
    }

    #[test]
    fn distinct_opens_use_distinct_scratch_files() {
        let mut spool = Spool::new().unwrap();
        let a = spool.allocate("/Internal/a.txt", false).unwrap();
        let b = spool.allocate("/Internal/b.txt", false).unwrap();
        assert_ne!(a, b);
        assert_ne!(
            spool.get(a).unwrap().scratch_path,
            spool.get(b).unwrap().scratch_path
        );
    }

    #[test]
    fn read_at_returns_partial_data_at_eof() -> anyhow::Result<()> {
        let mut spool = Spool::new()?;
        let fh = spool.allocate("/Internal/x.txt", false)?;
        {
            let of = spool.get_mut(fh).unwrap();
            of.file.write_all(b"hello")?;
        }

        let of = spool.get(fh).unwrap();
        assert_eq!(of.read_at(0, 5)?, b"hello");
        assert_eq!(of.read_at(0, 64)?, b"hello");
        assert_eq!(of.read_at(3, 64)?, b"lo");
        assert!(of.read_at(10, 4)?.is_empty());
        Ok(())
    }

    #[test]
    fn by_path_finds_the_backing_handle() {
        let mut spool = Spool::new().unwrap();
        let fh = spool.allocate("/Internal/x.txt", false).unwrap();
        assert_eq!(spool.by_path("/Internal/x.txt").unwrap().fh, fh);
        assert!(spool.by_path("/Internal/y.txt").is_none());
    }

    #[test]
    fn shutdown_removes_scratch_state() {
        let mut spool = Spool::new().unwrap();
        let fh = spool.allocate("/Internal/x.txt", false).unwrap();
        let scratch = spool.get(fh).unwrap().scratch_path.clone();
        let dir = spool.dir().to_path_buf();

        spool.shutdown();
        assert!(!scratch.exists());
        assert!(!dir.exists());
    }
}
