//! One open MTP device plus the in-memory trees of its storages. All device
//! traffic funnels through here, so the recovery state machine can cycle the
//! session underneath any operation without the dispatcher noticing.

use chrono::Utc;
use derivative::Derivative;
use log::{error, info, warn};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::device::raw::{detect_raw_devices, DeviceSelector};
use crate::device::{upload_metadata, MtpDevice, ObjectInfo, Parent};
use crate::error::Error;
use crate::filetypes::Filetype;
use crate::recovery::{read_timeout, write_timeout, Recovery, RecoveryLevel, TransferAlarm};
use crate::tree::{split_path, Node, StorageTree};
use crate::Result;

/// Per-session knobs. The per-byte factors follow the transfer deadline rule
/// `max(10, factor * object_size)` seconds.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub read_timeout_per_byte: u64,
    pub write_timeout_per_byte: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            read_timeout_per_byte: 2,
            write_timeout_per_byte: 2,
        }
    }
}

/// Owned snapshot of a resolved entry, handed to the dispatcher. Open handles
/// keep these instead of tree references, so cache eviction never invalidates
/// them.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: i64,
    /// MTP object id; 0 for a storage root, negative for virtual or
    /// not-yet-uploaded entries.
    pub item_id: i64,
    pub storage_id: u32,
    pub child_count: usize,
    pub filetype: Filetype,
}

impl EntryInfo {
    fn virtual_dir(path: &str, child_count: usize) -> Self {
        EntryInfo {
            path: path.to_string(),
            is_dir: true,
            size: 0,
            mtime: 0,
            item_id: -3,
            storage_id: 0,
            child_count,
            filetype: Filetype::Folder,
        }
    }

    fn from_node(tree: &StorageTree, node: &Node) -> Self {
        EntryInfo {
            path: node.path.clone(),
            is_dir: node.is_folder(),
            size: node.size(),
            mtime: node.mtime,
            item_id: node.item_id,
            storage_id: tree.storage_id(),
            child_count: node.child_count(),
            filetype: node.filetype(),
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MtpSession {
    selector: DeviceSelector,
    #[derivative(Debug = "ignore")]
    device: Option<MtpDevice>,
    storages: Vec<StorageTree>,
    config: SessionConfig,
}

impl MtpSession {
    /// Detect devices, open the selected one uncached and enumerate its
    /// storages. The session remembers the USB id so later reconnects find the
    /// same device even if enumeration order changed.
    pub fn open(selector: DeviceSelector, config: SessionConfig) -> Result<Self> {
        let raw_devices = detect_raw_devices()?;
        let raw = selector.pick(&raw_devices).ok_or(Error::NoDevice)?;
        let resolved = DeviceSelector::UsbId {
            vendor: raw.vendor_id(),
            product: raw.product_id(),
        };

        let device = raw.open_uncached().ok_or(Error::NoDevice)?;
        let infos = device.storage_list()?;
        let storages = infos.iter().map(StorageTree::new).collect();

        info!("opened MTP device {:04x}:{:04x}", raw.vendor_id(), raw.product_id());
        Ok(MtpSession {
            selector: resolved,
            device: Some(device),
            storages,
            config,
        })
    }

    /// One line identifying the mounted device for banners and logs.
    pub fn describe(&self) -> String {
        let usb_id = match self.selector {
            DeviceSelector::UsbId { vendor, product } => format!("{:04x}:{:04x}", vendor, product),
            _ => String::new(),
        };

        match &self.device {
            Some(device) => {
                let name = device.get_friendly_name().ok().filter(|n| !n.is_empty()).unwrap_or_else(|| {
                    let manufacturer = device.manufacturer_name().unwrap_or_default();
                    let model = device.model_name().unwrap_or_default();
                    format!("{} {}", manufacturer, model).trim().to_string()
                });
                format!("{} ({})", name, usb_id)
            }
            None => format!("disconnected ({})", usb_id),
        }
    }

    /// Release the device. Further operations answer `NoDevice` until a
    /// successful reconnect.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            info!("releasing device");
        }
    }

    /// Liveness probe: ask for the storage list and see whether the device
    /// answers.
    pub fn probe(&self) -> bool {
        match &self.device {
            Some(device) => device.storage_list().is_ok(),
            None => false,
        }
    }

    fn reopen(&mut self, rescan: bool) -> Result<()> {
        self.close();

        let raw_devices = detect_raw_devices()?;
        let raw = self.selector.pick(&raw_devices).ok_or(Error::NoDevice)?;
        let device = raw.open_uncached().ok_or(Error::NoDevice)?;
        let infos = device.storage_list()?;

        if rescan {
            self.storages = infos.iter().map(StorageTree::new).collect();
        }
        self.device = Some(device);
        Ok(())
    }

    fn device(&self) -> Result<&MtpDevice> {
        self.device.as_ref().ok_or(Error::NoDevice)
    }

    pub fn storage_descriptions(&self) -> Vec<String> {
        self.storages.iter().map(|s| s.description().to_string()).collect()
    }

    /// `(capacity, free)` byte counts for the storage holding `path`; the
    /// pseudo-root aggregates every storage.
    pub fn statfs(&self, path: &str) -> (u64, u64) {
        if path == "/" {
            return self.storages.iter().fold((0, 0), |(cap, free), s| {
                (cap + s.max_capacity(), free + s.free_space_bytes())
            });
        }
        match self.storage_index(path) {
            Some(idx) => (
                self.storages[idx].max_capacity(),
                self.storages[idx].free_space_bytes(),
            ),
            None => (0, 0),
        }
    }

    fn storage_index(&self, path: &str) -> Option<usize> {
        let first = path.trim_start_matches('/').split('/').next()?;
        self.storages.iter().position(|s| s.description() == first)
    }

    /// Resolve an absolute POSIX path to an owned entry snapshot. `Ok(None)`
    /// means the path does not exist on the device.
    pub fn resolve(&mut self, path: &str) -> Result<Option<EntryInfo>> {
        if path == "/" {
            return Ok(Some(EntryInfo::virtual_dir("/", self.storages.len())));
        }

        let idx = match self.storage_index(path) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let device = self.device.as_ref().ok_or(Error::NoDevice)?;
        let tree = &mut self.storages[idx];
        let mut lister =
            |storage_id: u32, item_id: i64| device.list_folder(storage_id, Parent::from_item_id(item_id));

        match tree.resolve(path, &mut lister)? {
            Some(id) => {
                let node = tree.node(id).ok_or_else(|| Error::NotFound(path.to_string()))?;
                Ok(Some(EntryInfo::from_node(tree, node)))
            }
            None => Ok(None),
        }
    }

    /// Directory listing as `(name, is_directory)` pairs, freshly re-listed if
    /// the folder was flagged.
    pub fn readdir(&mut self, path: &str) -> Result<Vec<(String, bool)>> {
        if path == "/" {
            return Ok(self
                .storage_descriptions()
                .into_iter()
                .map(|name| (name, true))
                .collect());
        }

        let idx = self
            .storage_index(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        let device = self.device.as_ref().ok_or(Error::NoDevice)?;
        let tree = &mut self.storages[idx];
        let mut lister =
            |storage_id: u32, item_id: i64| device.list_folder(storage_id, Parent::from_item_id(item_id));

        let node = tree
            .resolve(path, &mut lister)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        tree.children(node, &mut lister)
    }

    /// Insert the in-memory zero-length placeholder behind `create()`.
    pub fn create_placeholder(&mut self, path: &str) -> Result<EntryInfo> {
        let (dir_path, name) = split_path(path);
        let parent = self
            .resolve(dir_path)?
            .ok_or_else(|| Error::NotADirectory(dir_path.to_string()))?;
        if !parent.is_dir {
            return Err(Error::NotADirectory(dir_path.to_string()));
        }
        if parent.item_id < 0 {
            // The pseudo-root holds storages, not files.
            return Err(Error::InvalidArgument);
        }

        let idx = self
            .storage_index(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let tree = &mut self.storages[idx];
        let parent_node = tree
            .lookup_cached(dir_path)
            .ok_or_else(|| Error::NotADirectory(dir_path.to_string()))?;
        let id = tree
            .insert_placeholder(parent_node, name, Utc::now().timestamp())
            .ok_or_else(|| Error::NotADirectory(dir_path.to_string()))?;

        let node = tree.node(id).ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(EntryInfo::from_node(tree, node))
    }

    /// Materialise a remote object into a local descriptor, cycling the device
    /// on stalls. The scratch file is rewound and truncated before every
    /// attempt so a half transfer never survives a retry.
    pub fn copy_from(&mut self, path: &str, descriptor: RawFd) -> Result<()> {
        let entry = self
            .resolve(path)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if entry.is_dir {
            return Err(Error::IsADirectory(path.to_string()));
        }
        if entry.item_id < 0 {
            return Err(Error::NotFound(path.to_string()));
        }

        let timeout = read_timeout(self.config.read_timeout_per_byte, entry.size);
        self.with_recovery(Some(timeout), |session| {
            let entry = session
                .resolve(path)?
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            if entry.item_id < 0 {
                return Err(Error::NotFound(path.to_string()));
            }

            rewind_and_truncate(descriptor)?;
            session.device()?.get_object_to_fd(entry.item_id as u32, descriptor)
        })
    }

    /// Flush a scratch file to the device at `target`, replacing any existing
    /// object there (MTP has no in-place overwrite). The parent folder is
    /// flagged so the next listing resolves the device-assigned id.
    pub fn copy_to(&mut self, scratch: &Path, target: &str, timestamp: Option<i64>) -> Result<()> {
        let length = std::fs::metadata(scratch)?.len();
        let timeout = write_timeout(self.config.write_timeout_per_byte, length);

        let scratch = scratch.to_path_buf();
        self.with_recovery(Some(timeout), move |session| {
            if let Some(existing) = session.resolve(target)? {
                if existing.is_dir {
                    return Err(Error::IsADirectory(target.to_string()));
                }
                if existing.item_id >= 0 {
                    session.device()?.delete_object(existing.item_id as u32)?;
                }
                session.forget_path(target);
            }

            let (dir_path, name) = split_path(target);
            let parent = session
                .resolve(dir_path)?
                .ok_or_else(|| Error::NotADirectory(dir_path.to_string()))?;
            if !parent.is_dir {
                return Err(Error::NotADirectory(dir_path.to_string()));
            }
            if parent.item_id < 0 {
                return Err(Error::InvalidArgument);
            }

            let file = File::open(&scratch)?;
            let metadata = upload_metadata(
                name,
                length,
                parent.item_id as u32,
                parent.storage_id,
                timestamp,
            );
            session.device()?.send_object_from_fd(file.as_raw_fd(), &metadata)?;

            session.mark_parent(target);
            Ok(())
        })
    }

    /// Create a folder on the device, inside the recovery wrapper.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        if self.resolve(path)?.is_some() {
            return Err(Error::AlreadyExists(path.to_string()));
        }

        let (dir_path, name) = split_path(path);
        let parent = self
            .resolve(dir_path)?
            .ok_or_else(|| Error::NotADirectory(dir_path.to_string()))?;
        if !parent.is_dir {
            return Err(Error::NotADirectory(dir_path.to_string()));
        }
        if parent.item_id < 0 {
            return Err(Error::InvalidArgument);
        }

        self.with_recovery(None, |session| {
            let parent = session
                .resolve(dir_path)?
                .ok_or_else(|| Error::NotADirectory(dir_path.to_string()))?;
            session.device()?.create_folder(
                name,
                Parent::from_item_id(parent.item_id),
                parent.storage_id,
            )?;
            Ok(())
        })?;

        self.mark_parent(path);
        Ok(())
    }

    /// Delete an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let entry = self
            .resolve(path)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if !entry.is_dir {
            return Err(Error::NotADirectory(path.to_string()));
        }
        if entry.child_count > 0 {
            return Err(Error::NotEmpty(path.to_string()));
        }
        if entry.item_id <= 0 {
            // Storages and the pseudo-root cannot be removed.
            return Err(Error::InvalidArgument);
        }

        self.device()?.delete_object(entry.item_id as u32)?;
        self.forget_path(path);
        self.mark_parent(path);
        Ok(())
    }

    /// Delete a file object.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let entry = self
            .resolve(path)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if entry.is_dir {
            return Err(Error::IsADirectory(path.to_string()));
        }

        if entry.item_id >= 0 {
            self.device()?.delete_object(entry.item_id as u32)?;
        }
        self.forget_path(path);
        self.mark_parent(path);
        Ok(())
    }

    /// Rename and, when the parents differ, move an object. Both parents are
    /// flagged and the old path is dropped from the cache.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let entry = self
            .resolve(old_path)?
            .ok_or_else(|| Error::NotFound(old_path.to_string()))?;
        if entry.item_id <= 0 {
            return Err(Error::InvalidArgument);
        }

        let (old_dir, old_name) = split_path(old_path);
        let (new_dir, new_name) = split_path(new_path);

        let old_parent = self
            .resolve(old_dir)?
            .ok_or_else(|| Error::NotADirectory(old_dir.to_string()))?;

        if old_dir != new_dir {
            let new_parent = self
                .resolve(new_dir)?
                .ok_or_else(|| Error::NotADirectory(new_dir.to_string()))?;
            if !new_parent.is_dir {
                return Err(Error::NotADirectory(new_dir.to_string()));
            }
            if new_parent.item_id < 0 {
                return Err(Error::InvalidArgument);
            }

            self.device()?.move_object(
                entry.item_id as u32,
                new_parent.storage_id,
                Parent::from_item_id(new_parent.item_id),
            )?;
        }

        if old_name != new_name {
            let object = ObjectInfo {
                item_id: entry.item_id as u32,
                parent_id: old_parent.item_id.max(0) as u32,
                storage_id: entry.storage_id,
                name: old_name.to_string(),
                size: entry.size,
                mtime: entry.mtime,
                filetype: entry.filetype,
            };

            if entry.is_dir {
                self.device()?.set_folder_name(&object, new_name)?;
            } else {
                self.device()?.set_file_name(&object, new_name)?;
            }
        }

        self.forget_path(old_path);
        self.mark_parent(old_path);
        self.mark_parent(new_path);
        Ok(())
    }

    fn mark_parent(&mut self, path: &str) {
        if let Some(idx) = self.storage_index(path) {
            self.storages[idx].mark_parent_refresh(path);
        }
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(idx) = self.storage_index(path) {
            self.storages[idx].remove_path(path);
        }
    }

    /// Run `op` under an optional alarm deadline, escalating through the
    /// recovery ladder on transport failures: reopen, then reconnect with a
    /// full rescan, then give up. A failure with a live device (probe still
    /// answering) is a genuine error and is returned without cycling.
    fn with_recovery<T>(
        &mut self,
        timeout: Option<u32>,
        mut op: impl FnMut(&mut MtpSession) -> Result<T>,
    ) -> Result<T> {
        let mut recovery = Recovery::new();

        loop {
            if let Some(device) = &self.device {
                device.clear_errorstack();
            }

            let alarm = timeout.map(TransferAlarm::arm);
            let result = op(self);
            let timed_out = alarm.as_ref().map_or(false, TransferAlarm::fired);
            drop(alarm);

            let err = match result {
                Ok(value) if !timed_out => return Ok(value),
                Ok(_) => Error::Timeout {
                    seconds: timeout.unwrap_or(0),
                },
                Err(err) => err,
            };

            if !err.is_transport() && !timed_out {
                return Err(err);
            }

            if timed_out {
                error!("transfer timed out after {:?} seconds, cycling device", timeout);
            } else if self.probe() {
                // Device still answers: the operation itself failed.
                return Err(err);
            }

            loop {
                match recovery.escalate() {
                    Some(RecoveryLevel::Reopen) => {
                        warn!("reopening device");
                        if self.reopen(false).is_ok() && self.probe() {
                            break;
                        }
                    }
                    Some(RecoveryLevel::Reconnect) => {
                        warn!("reopen failed, reconnecting with full rescan");
                        if self.reopen(true).is_ok() && self.probe() {
                            break;
                        }
                    }
                    None => {
                        error!("could not recover device, giving up");
                        self.close();
                        return Err(if timed_out {
                            Error::Timeout {
                                seconds: timeout.unwrap_or(0),
                            }
                        } else {
                            err
                        });
                    }
                }
            }
        }
    }
}

fn rewind_and_truncate(descriptor: RawFd) -> Result<()> {
    let res = unsafe { libc::ftruncate(descriptor, 0) };
    if res != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let res = unsafe { libc::lseek(descriptor, 0, libc::SEEK_SET) };
    if res < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
