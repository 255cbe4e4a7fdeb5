//! The FUSE dispatcher: translates the path-keyed callbacks delivered by the
//! kernel bridge into tree lookups, spool I/O and device transfers.
//!
//! Every callback funnels through one lock around the whole filesystem state.
//! The underlying MTP session is single-session and must never see concurrent
//! calls, so the bridge is mounted with a single worker and the lock enforces
//! serialisation even for callbacks the bridge dispatches elsewhere.

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileAttr, FileType, FilesystemMT, RequestInfo,
    ResultCreate, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice, ResultStatfs,
    ResultWrite, ResultXattr, Statfs, Xattr,
};
use log::{debug, error, warn};
use lru::LruCache;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;
use crate::session::{EntryInfo, MtpSession};
use crate::spool::Spool;
use crate::tree::sanitize_path;
use crate::Result;

/// Attribute validity handed to the kernel. Short, because another host agent
/// can change the device behind our back.
const TTL: Duration = Duration::from_secs(1);

/// Capacity of the created-but-unflushed cache.
const CREATED_CACHE_SIZE: usize = 1000;

const BLOCK_SIZE: u64 = 512;

struct FsState {
    session: MtpSession,
    spool: Spool,
    created: LruCache<String, EntryInfo>,
}

/// The mounted filesystem.
pub struct MtpFs {
    state: Mutex<FsState>,
}

impl MtpFs {
    pub fn new(session: MtpSession) -> Result<Self> {
        let spool = Spool::new()?;
        Ok(MtpFs {
            state: Mutex::new(FsState {
                session,
                spool,
                created: LruCache::new(
                    NonZeroUsize::new(CREATED_CACHE_SIZE).expect("nonzero cache size"),
                ),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Normalise a path from the bridge: UTF-8 (lossy) with device-hostile
/// characters replaced.
fn fs_path(path: &Path) -> String {
    sanitize_path(&path.to_string_lossy()).into_owned()
}

fn joined(parent: &Path, name: &OsStr) -> String {
    fs_path(&parent.join(name))
}

fn readonly_flags(flags: u32) -> bool {
    (flags as i32 & libc::O_ACCMODE) == libc::O_RDONLY
}

fn systime(secs: i64) -> SystemTime {
    if secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    }
}

fn epoch_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Directory and file attributes. MTP has no modes or owners, so everything is
/// 0755 and owned by the caller.
fn entry_attr(req: &RequestInfo, entry: &EntryInfo) -> FileAttr {
    let kind = if entry.is_dir {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    sized_attr(req, kind, entry.size, entry.mtime)
}

fn sized_attr(req: &RequestInfo, kind: FileType, size: u64, mtime: i64) -> FileAttr {
    let time = systime(mtime);
    FileAttr {
        size,
        blocks: (size + BLOCK_SIZE - 1) / BLOCK_SIZE,
        atime: time,
        mtime: time,
        ctime: time,
        crtime: time,
        kind,
        perm: 0o755,
        nlink: 1,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        flags: 0,
    }
}

fn errno(err: Error) -> libc::c_int {
    debug!("{}", err);
    err.errno()
}

impl FilesystemMT for MtpFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        Ok(())
    }

    fn destroy(&self) {
        let mut state = self.lock();
        state.spool.shutdown();
        state.session.close();
    }

    fn getattr(&self, req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        let mut state = self.lock();
        let path = fs_path(path);

        match state.session.resolve(&path) {
            Ok(Some(entry)) => return Ok((TTL, entry_attr(&req, &entry))),
            Ok(None) => {}
            Err(err) => return Err(errno(err)),
        }

        if let Some(entry) = state.created.get(&path) {
            return Ok((TTL, entry_attr(&req, entry)));
        }

        // An open writer knows its current size even though the device does
        // not, yet.
        if let Some(open_file) = fh.and_then(|fh| state.spool.get(fh)) {
            let size = open_file.len().map_err(|err| errno(err.into()))?;
            return Ok((TTL, sized_attr(&req, FileType::RegularFile, size, epoch_secs(SystemTime::now()))));
        }

        Err(libc::ENOENT)
    }

    fn chmod(&self, _req: RequestInfo, _path: &Path, _fh: Option<u64>, _mode: u32) -> ResultEmpty {
        Ok(())
    }

    fn chown(
        &self,
        _req: RequestInfo,
        _path: &Path,
        _fh: Option<u64>,
        _uid: Option<u32>,
        _gid: Option<u32>,
    ) -> ResultEmpty {
        Ok(())
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        let mut state = self.lock();
        let path = fs_path(path);

        if let Some(open_file) = fh.and_then(|fh| state.spool.get(fh)) {
            return open_file.file.set_len(size).map_err(|err| errno(err.into()));
        }

        // truncate often arrives with no handle right after an open for write.
        if let Some(open_file) = state.spool.by_path(&path) {
            return open_file.file.set_len(size).map_err(|err| errno(err.into()));
        }

        let state = &mut *state;
        let entry = state.session.resolve(&path).map_err(errno)?;
        let is_created = state.created.contains(&path);
        match &entry {
            Some(entry) if entry.is_dir => return Err(libc::EISDIR),
            Some(_) => {}
            None if is_created => {}
            None => return Err(libc::ENOENT),
        }

        let (file, scratch) = state.spool.scratch_file(&path).map_err(|_| libc::EIO)?;
        let result = (|| -> Result<()> {
            if entry.is_some() && !is_created {
                state.session.copy_from(&path, file.as_raw_fd())?;
            }
            file.set_len(size)?;
            file.sync_all()?;
            state.session.copy_to(&scratch, &path, None)
        })();

        // Close and unlink unconditionally; a leaked scratch file outlives the
        // mount otherwise.
        drop(file);
        if let Err(err) = std::fs::remove_file(&scratch) {
            warn!("could not remove scratch file {:?}: {}", scratch, err);
        }

        result.map_err(errno)
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        _atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        let mut state = self.lock();
        let path = fs_path(path);

        let state = &mut *state;
        let entry = match state.session.resolve(&path).map_err(errno)? {
            Some(entry) => entry,
            None if state.created.contains(&path) => return Ok(()),
            None => return Err(libc::ENOENT),
        };

        // Folders carry no timestamps on MTP.
        if entry.is_dir {
            return Ok(());
        }

        // The only way to restamp an object is a full round trip.
        let (file, scratch) = state.spool.scratch_file(&path).map_err(|_| libc::EIO)?;
        let result = (|| -> Result<()> {
            state.session.copy_from(&path, file.as_raw_fd())?;
            file.sync_all()?;
            let timestamp = mtime.map(epoch_secs).unwrap_or_else(|| epoch_secs(SystemTime::now()));
            state.session.copy_to(&scratch, &path, Some(timestamp))
        })();

        drop(file);
        if let Err(err) = std::fs::remove_file(&scratch) {
            warn!("could not remove scratch file {:?}: {}", scratch, err);
        }

        result.map_err(errno)
    }

    fn mknod(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        _rdev: u32,
    ) -> ResultEntry {
        if mode & libc::S_IFMT as u32 != libc::S_IFREG as u32 {
            return Err(libc::EINVAL);
        }

        let path = joined(parent, name);
        let mut state = self.lock();
        let state = &mut *state;

        // create-then-release: an empty object lands on the device at once.
        let entry = state.session.create_placeholder(&path).map_err(errno)?;
        let (file, scratch) = state.spool.scratch_file(&path).map_err(|_| libc::EIO)?;
        let result = state.session.copy_to(&scratch, &path, None);

        drop(file);
        if let Err(err) = std::fs::remove_file(&scratch) {
            warn!("could not remove scratch file {:?}: {}", scratch, err);
        }

        result.map_err(errno)?;
        Ok((TTL, entry_attr(&req, &entry)))
    }

    fn mkdir(&self, req: RequestInfo, parent: &Path, name: &OsStr, _mode: u32) -> ResultEntry {
        let path = joined(parent, name);
        let mut state = self.lock();

        state.session.mkdir(&path).map_err(errno)?;

        match state.session.resolve(&path) {
            Ok(Some(entry)) => Ok((TTL, entry_attr(&req, &entry))),
            // The device may have adjusted the name; report a plain directory
            // and let the next lookup find the real one.
            _ => Ok((TTL, sized_attr(&req, FileType::Directory, 0, epoch_secs(SystemTime::now())))),
        }
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let path = joined(parent, name);
        let mut state = self.lock();
        let removed = state.session.remove_file(&path).map_err(errno);
        if removed.is_ok() {
            state.created.pop(&path);
        }
        removed
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let path = joined(parent, name);
        self.lock().session.rmdir(&path).map_err(errno)
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        let old_path = joined(parent, name);
        let new_path = joined(newparent, newname);
        let mut state = self.lock();
        let state = &mut *state;

        let old_entry = state
            .session
            .resolve(&old_path)
            .map_err(errno)?
            .ok_or(libc::ENOENT)?;
        let new_entry = state.session.resolve(&new_path).map_err(errno)?;

        if let Some(new_entry) = &new_entry {
            if old_entry.is_dir && new_entry.is_dir && new_entry.child_count > 0 {
                return Err(libc::ENOTEMPTY);
            }
        }

        // MTP cannot rename over an existing object: the target is deleted
        // first, with a local backup so a failed rename can put it back.
        let mut backup = None;
        if let Some(new_entry) = &new_entry {
            if !new_entry.is_dir && new_entry.item_id >= 0 {
                match state.spool.scratch_file(&new_path) {
                    Ok((file, scratch)) => {
                        match state.session.copy_from(&new_path, file.as_raw_fd()) {
                            Ok(()) => backup = Some((file, scratch)),
                            Err(err) => {
                                warn!("could not back up {} before rename: {}", new_path, err);
                                drop(file);
                                let _ = std::fs::remove_file(&scratch);
                            }
                        }
                    }
                    Err(err) => warn!("could not allocate rename backup: {}", err),
                }
                state.session.remove_file(&new_path).map_err(errno)?;
            }
        }

        let result = state.session.rename(&old_path, &new_path);

        if let Some((file, scratch)) = backup {
            if result.is_err() {
                if let Err(err) = state.session.copy_to(&scratch, &new_path, None) {
                    error!("could not restore {} after failed rename: {}", new_path, err);
                }
            }
            drop(file);
            let _ = std::fs::remove_file(&scratch);
        }

        if result.is_ok() {
            if let Some(entry) = state.created.pop(&old_path) {
                state.created.put(new_path.clone(), entry);
            }
        }
        result.map_err(errno)
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        let path = fs_path(path);
        let readonly = readonly_flags(flags);
        let mut state = self.lock();
        let state = &mut *state;

        let entry = state.session.resolve(&path).map_err(errno)?;

        match &entry {
            Some(entry) if entry.is_dir => return Err(libc::EISDIR),
            Some(_) => {}
            None => {
                // A freshly created, still unflushed file has nothing to
                // materialise yet.
                if state.created.contains(&path) {
                    let fh = state.spool.allocate(&path, readonly).map_err(|_| libc::EIO)?;
                    return Ok((fh, 0));
                }
                if readonly {
                    return Err(libc::ENOENT);
                }
            }
        }

        let fh = state.spool.allocate(&path, readonly).map_err(|_| libc::EIO)?;
        let descriptor = state
            .spool
            .get(fh)
            .map(|open_file| open_file.file.as_raw_fd())
            .ok_or(libc::EIO)?;

        if entry.is_some() {
            if let Err(err) = state.session.copy_from(&path, descriptor) {
                let missing_writer = matches!(err, Error::NotFound(_)) && !readonly;
                if !missing_writer {
                    if let Some(open_file) = state.spool.remove(fh) {
                        open_file.discard();
                    }
                    return Err(errno(err));
                }
            }
        }

        Ok((fh, 0))
    }

    fn read(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        let state = self.lock();

        let open_file = match state.spool.get(fh) {
            Some(open_file) => open_file,
            None => {
                error!("handle {} not found in open handles", fh);
                return callback(Err(libc::EBADF));
            }
        };

        match open_file.read_at(offset, size as usize) {
            Ok(data) => callback(Ok(&data)),
            Err(err) => callback(Err(errno(err.into()))),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        let state = self.lock();

        let open_file = match state.spool.get(fh) {
            Some(open_file) if !open_file.readonly => open_file,
            Some(_) | None => {
                error!("handle {} not found in open handles or read only", fh);
                return Err(libc::EBADF);
            }
        };

        open_file.write_at(offset, &data).map_err(|err| errno(err.into()))
    }

    fn flush(&self, _req: RequestInfo, _path: &Path, fh: u64, _lock_owner: u64) -> ResultEmpty {
        let state = self.lock();
        let open_file = state.spool.get(fh).ok_or(libc::EBADF)?;
        open_file.file.sync_all().map_err(|err| errno(err.into()))
    }

    fn fsync(&self, _req: RequestInfo, _path: &Path, fh: u64, datasync: bool) -> ResultEmpty {
        let state = self.lock();
        let open_file = state.spool.get(fh).ok_or(libc::EBADF)?;
        let result = if datasync {
            open_file.file.sync_data()
        } else {
            open_file.file.sync_all()
        };
        result.map_err(|err| errno(err.into()))
    }

    fn release(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        let mut state = self.lock();
        let state = &mut *state;

        let open_file = state.spool.remove(fh).ok_or_else(|| {
            error!("handle {} not found in open handles", fh);
            libc::EBADF
        })?;

        if open_file.readonly {
            open_file.discard();
            return Ok(());
        }

        let result = (|| -> Result<()> {
            open_file.file.sync_all()?;
            state
                .session
                .copy_to(&open_file.scratch_path, &open_file.remote_path, None)
        })();

        if result.is_ok() {
            state.created.pop(&open_file.remote_path);
        } else {
            error!(
                "error copying {:?} to {}",
                open_file.scratch_path, open_file.remote_path
            );
        }

        open_file.discard();
        result.map_err(errno)
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, _flags: u32) -> ResultOpen {
        let mut state = self.lock();
        let path = fs_path(path);

        match state.session.resolve(&path).map_err(errno)? {
            Some(entry) if entry.is_dir => Ok((0, 0)),
            Some(_) => Err(libc::ENOTDIR),
            None => Err(libc::ENOENT),
        }
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, _fh: u64) -> ResultReaddir {
        let mut state = self.lock();
        let path = fs_path(path);

        let children = state.session.readdir(&path).map_err(errno)?;

        let mut entries = vec![
            DirectoryEntry {
                name: OsString::from("."),
                kind: FileType::Directory,
            },
            DirectoryEntry {
                name: OsString::from(".."),
                kind: FileType::Directory,
            },
        ];
        entries.extend(children.into_iter().map(|(name, is_dir)| DirectoryEntry {
            name: OsString::from(name),
            kind: if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
        }));

        Ok(entries)
    }

    fn releasedir(&self, _req: RequestInfo, _path: &Path, _fh: u64, _flags: u32) -> ResultEmpty {
        Ok(())
    }

    fn statfs(&self, _req: RequestInfo, path: &Path) -> ResultStatfs {
        let state = self.lock();
        let (capacity, free) = state.session.statfs(&fs_path(path));

        Ok(Statfs {
            blocks: capacity / BLOCK_SIZE,
            bfree: free / BLOCK_SIZE,
            bavail: free / BLOCK_SIZE,
            files: 0,
            ffree: 0,
            bsize: BLOCK_SIZE as u32,
            namelen: 255,
            frsize: BLOCK_SIZE as u32,
        })
    }

    fn setxattr(
        &self,
        _req: RequestInfo,
        _path: &Path,
        _name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> ResultEmpty {
        Ok(())
    }

    fn getxattr(&self, _req: RequestInfo, _path: &Path, _name: &OsStr, size: u32) -> ResultXattr {
        if size == 0 {
            Ok(Xattr::Size(0))
        } else {
            Ok(Xattr::Data(Vec::new()))
        }
    }

    fn listxattr(&self, _req: RequestInfo, _path: &Path, size: u32) -> ResultXattr {
        if size == 0 {
            Ok(Xattr::Size(0))
        } else {
            Ok(Xattr::Data(Vec::new()))
        }
    }

    fn access(&self, _req: RequestInfo, _path: &Path, _mask: u32) -> ResultEmpty {
        Ok(())
    }

    fn create(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> ResultCreate {
        let path = joined(parent, name);
        let mut state = self.lock();
        let state = &mut *state;

        let entry = match state.session.create_placeholder(&path) {
            Ok(entry) => entry,
            Err(err) => return Err(errno(err)),
        };

        let fh = state.spool.allocate(&path, false).map_err(|_| libc::EIO)?;
        state.created.put(path, entry.clone());

        Ok(CreatedEntry {
            ttl: TTL,
            attr: entry_attr(&req, &entry),
            fh,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filetypes::Filetype;

    fn req() -> RequestInfo {
        RequestInfo {
            unique: 1,
            uid: 1000,
            gid: 1000,
            pid: 4242,
        }
    }

    fn file_entry() -> EntryInfo {
        EntryInfo {
            path: "/Internal/hello.txt".to_string(),
            is_dir: false,
            size: 2,
            mtime: 1_600_000_000,
            item_id: 42,
            storage_id: 65537,
            child_count: 0,
            filetype: Filetype::Text,
        }
    }

    #[test]
    fn paths_from_the_bridge_are_sanitized() {
        assert_eq!(fs_path(Path::new("/Internal/a:b.txt")), "/Internal/a-b.txt");
        assert_eq!(
            joined(Path::new("/Internal"), OsStr::new("what?.txt")),
            "/Internal/what-.txt"
        );
    }

    #[test]
    fn only_plain_o_rdonly_counts_as_readonly() {
        assert!(readonly_flags(libc::O_RDONLY as u32));
        assert!(!readonly_flags(libc::O_WRONLY as u32));
        assert!(!readonly_flags(libc::O_RDWR as u32));
        assert!(!readonly_flags((libc::O_WRONLY | libc::O_TRUNC) as u32));
    }

    #[test]
    fn file_attributes_report_caller_and_0755() {
        let attr = entry_attr(&req(), &file_entry());
        assert_eq!(attr.size, 2);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.gid, 1000);
        assert_eq!(attr.nlink, 1);
        assert!(matches!(attr.kind, FileType::RegularFile));
        assert_eq!(attr.mtime, systime(1_600_000_000));
    }

    #[test]
    fn directory_attributes_have_zero_size() {
        let mut entry = file_entry();
        entry.is_dir = true;
        entry.size = 0;
        let attr = entry_attr(&req(), &entry);
        assert!(matches!(attr.kind, FileType::Directory));
        assert_eq!(attr.size, 0);
    }

    #[test]
    fn pre_epoch_times_clamp_to_epoch() {
        assert_eq!(systime(-5), UNIX_EPOCH);
        assert_eq!(systime(0), UNIX_EPOCH);
        assert_eq!(epoch_secs(UNIX_EPOCH), 0);
    }
}
