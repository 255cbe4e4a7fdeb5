//! Typed wrapper over the native `libmtp` device handle. This module exposes the
//! minimal operation set the filesystem needs: storage enumeration, folder
//! listing, whole-object transfers in and out of local descriptors, folder
//! creation, object deletion and renames.
//!
//! All strings cross the FFI boundary as UTF-8 bytes and every name returned
//! from a listing is copied into an owned `String` before it is surfaced, so
//! nothing borrowed outlives the native handle.

pub mod raw;

use chrono::{DateTime, TimeZone, Utc};
use libmtp_sys as ffi;
use log::warn;
use num_traits::{FromPrimitive, ToPrimitive};
use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;

use crate::error::Error;
use crate::filetypes::Filetype;
use crate::Result;

/// Represents the parent folder of an object, the top-most parent is called the
/// "root" as in *nix like systems.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parent {
    Root,
    Folder(u32),
}

impl Parent {
    pub(crate) fn faf_id(self) -> u32 {
        match self {
            Parent::Root => ffi::LIBMTP_FILES_AND_FOLDERS_ROOT,
            Parent::Folder(id) => id,
        }
    }

    pub(crate) fn to_id(self) -> u32 {
        match self {
            Parent::Root => 0,
            Parent::Folder(id) => id,
        }
    }

    pub fn from_item_id(id: i64) -> Parent {
        if id <= 0 {
            Parent::Root
        } else {
            Parent::Folder(id as u32)
        }
    }
}

/// Owned snapshot of one storage descriptor.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub id: u32,
    pub description: String,
    pub max_capacity: u64,
    pub free_space_bytes: u64,
    pub free_space_objects: u64,
}

/// Owned snapshot of one object (file or folder) returned by a folder listing.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub item_id: u32,
    pub parent_id: u32,
    pub storage_id: u32,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub filetype: Filetype,
}

impl ObjectInfo {
    pub fn is_folder(&self) -> bool {
        self.filetype.is_folder()
    }

    unsafe fn from_raw(file_t: *const ffi::LIBMTP_file_t) -> Self {
        let name = if (*file_t).filename.is_null() {
            String::new()
        } else {
            CStr::from_ptr((*file_t).filename)
                .to_string_lossy()
                .into_owned()
        };

        ObjectInfo {
            item_id: (*file_t).item_id,
            parent_id: (*file_t).parent_id,
            storage_id: (*file_t).storage_id,
            name,
            size: (*file_t).filesize,
            mtime: (*file_t).modificationdate as i64,
            filetype: Filetype::from_u32((*file_t).filetype).unwrap_or(Filetype::Unknown),
        }
    }
}

/// Convenience struct used as a parameter to send local data to an MTP device.
#[derive(Debug, Clone)]
pub struct ObjectMetadata<'a> {
    pub file_size: u64,
    pub file_name: &'a str,
    pub file_type: Filetype,
    pub parent_id: u32,
    pub storage_id: u32,
    pub modification_date: DateTime<Utc>,
}

/// An open MTP device. The binding owns the native handle; dropping this struct
/// releases the device.
pub struct MtpDevice {
    pub(crate) inner: *mut ffi::LIBMTP_mtpdevice_t,
}

// The handle is only ever touched by the thread currently holding the
// filesystem lock; libmtp itself keeps no thread affinity.
unsafe impl Send for MtpDevice {}

impl Drop for MtpDevice {
    fn drop(&mut self) {
        unsafe {
            ffi::LIBMTP_Release_Device(self.inner);
        }
    }
}

impl MtpDevice {
    pub(crate) fn latest_error(&self) -> Option<Error> {
        unsafe {
            let list = ffi::LIBMTP_Get_Errorstack(self.inner);
            let err = Error::from_latest_error(list)?;
            ffi::LIBMTP_Clear_Errorstack(self.inner);
            Some(err)
        }
    }

    pub fn clear_errorstack(&self) {
        unsafe {
            ffi::LIBMTP_Clear_Errorstack(self.inner);
        }
    }

    /// Gets the friendly name of this device, e.g. "Kevin's Android".
    pub fn get_friendly_name(&self) -> Result<String> {
        unsafe {
            let friendly_name = ffi::LIBMTP_Get_Friendlyname(self.inner);

            if friendly_name.is_null() {
                Err(self.latest_error().unwrap_or_default())
            } else {
                Ok(take_libmtp_string(friendly_name))
            }
        }
    }

    /// Returns the manufacturer name of this device.
    pub fn manufacturer_name(&self) -> Result<String> {
        unsafe {
            let manufacturer = ffi::LIBMTP_Get_Manufacturername(self.inner);

            if manufacturer.is_null() {
                Err(self.latest_error().unwrap_or_default())
            } else {
                Ok(take_libmtp_string(manufacturer))
            }
        }
    }

    /// Returns the model name of this device.
    pub fn model_name(&self) -> Result<String> {
        unsafe {
            let model = ffi::LIBMTP_Get_Modelname(self.inner);

            if model.is_null() {
                Err(self.latest_error().unwrap_or_default())
            } else {
                Ok(take_libmtp_string(model))
            }
        }
    }

    /// Re-reads the storage descriptors from the device and returns owned
    /// snapshots. Doubles as the liveness probe: a stalled or detached device
    /// fails here.
    pub fn storage_list(&self) -> Result<Vec<StorageInfo>> {
        unsafe {
            let res = ffi::LIBMTP_Get_Storage(self.inner, 0);
            if res != 0 {
                return Err(self.latest_error().unwrap_or_default());
            }

            let mut storages = Vec::new();
            let mut ptr = (*self.inner).storage;
            while !ptr.is_null() {
                let description = if (*ptr).StorageDescription.is_null() {
                    format!("Storage {}", (*ptr).id)
                } else {
                    CStr::from_ptr((*ptr).StorageDescription)
                        .to_string_lossy()
                        .into_owned()
                };

                storages.push(StorageInfo {
                    id: (*ptr).id,
                    description,
                    max_capacity: (*ptr).MaxCapacity,
                    free_space_bytes: (*ptr).FreeSpaceInBytes,
                    free_space_objects: (*ptr).FreeSpaceInObjects,
                });

                ptr = (*ptr).next;
            }

            Ok(storages)
        }
    }

    /// Retrieves the contents of a certain folder (`parent`) in one storage, the
    /// result contains both files and folders. This always performs I/O with the
    /// device.
    pub fn list_folder(&self, storage_id: u32, parent: Parent) -> Result<Vec<ObjectInfo>> {
        let mut head =
            unsafe { ffi::LIBMTP_Get_Files_And_Folders(self.inner, storage_id, parent.faf_id()) };

        if head.is_null() {
            // Empty folders return null too; only the error stack tells the
            // difference.
            if let Some(err) = self.latest_error() {
                return Err(err);
            }
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        while !head.is_null() {
            let next = unsafe { (*head).next };
            entries.push(unsafe { ObjectInfo::from_raw(head) });
            unsafe { ffi::LIBMTP_destroy_file_t(head) };
            head = next;
        }

        Ok(entries)
    }

    /// Retrieves an object from the device into a local file descriptor.
    pub fn get_object_to_fd(&self, object_id: u32, descriptor: RawFd) -> Result<()> {
        let res = unsafe {
            ffi::LIBMTP_Get_File_To_File_Descriptor(
                self.inner,
                object_id,
                descriptor,
                None,
                std::ptr::null(),
            )
        };

        if res != 0 {
            Err(self.latest_error().unwrap_or_default())
        } else {
            Ok(())
        }
    }

    /// Sends the contents of a local file descriptor to the device as a new
    /// object described by `metadata`, returning the id the device assigned.
    pub fn send_object_from_fd(&self, descriptor: RawFd, metadata: &ObjectMetadata<'_>) -> Result<u32> {
        let file_t = unsafe { self.new_file_t(metadata)? };

        let res = unsafe {
            ffi::LIBMTP_Send_File_From_File_Descriptor(
                self.inner,
                descriptor,
                file_t,
                None,
                std::ptr::null(),
            )
        };

        let new_id = unsafe { (*file_t).item_id };
        unsafe { ffi::LIBMTP_destroy_file_t(file_t) };

        if res != 0 {
            Err(self.latest_error().unwrap_or_default())
        } else {
            Ok(new_id)
        }
    }

    /// Tries to create a new folder, returns the id of the new folder. The
    /// device may silently adjust the name to fit its own file system rules; a
    /// subsequent listing of the parent picks that up.
    pub fn create_folder(&self, name: &str, parent: Parent, storage_id: u32) -> Result<u32> {
        let name_cstr = CString::new(name).map_err(|_| Error::InvalidArgument)?;

        // LIBMTP_Create_Folder may free and replace the name, so it must be
        // allocated with the C allocator.
        let name_in_c = unsafe { libc::strdup(name_cstr.as_ptr()) };
        // Unlike the listing calls, Create_Folder wants plain 0 for the root.
        let folder_id = unsafe {
            ffi::LIBMTP_Create_Folder(self.inner, name_in_c, parent.to_id(), storage_id)
        };

        unsafe {
            let name_from_c = CStr::from_ptr(name_in_c);
            if name_from_c.to_bytes() != name_cstr.as_bytes() {
                warn!(
                    "device adjusted folder name {:?} to {:?}",
                    name,
                    name_from_c.to_string_lossy()
                );
            }
            libc::free(name_in_c as *mut _);
        }

        if folder_id == 0 {
            Err(self.latest_error().unwrap_or_default())
        } else {
            Ok(folder_id)
        }
    }

    /// Deletes a single object (file or empty folder) off the device.
    pub fn delete_object(&self, object_id: u32) -> Result<()> {
        let res = unsafe { ffi::LIBMTP_Delete_Object(self.inner, object_id) };

        if res != 0 {
            Err(self.latest_error().unwrap_or_default())
        } else {
            Ok(())
        }
    }

    /// Renames a file object in place.
    pub fn set_file_name(&self, object: &ObjectInfo, new_name: &str) -> Result<()> {
        let new_name = CString::new(new_name).map_err(|_| Error::InvalidArgument)?;

        let file_t = unsafe { ffi::LIBMTP_new_file_t() };
        unsafe {
            (*file_t).item_id = object.item_id;
            (*file_t).parent_id = object.parent_id;
            (*file_t).storage_id = object.storage_id;
            (*file_t).filesize = object.size;
            (*file_t).filetype = object.filetype.to_u32().expect("raw filetype");
            // Set_File_Name frees the old name and strdups the new one.
            let old_name = CString::new(object.name.as_str()).map_err(|_| Error::InvalidArgument)?;
            (*file_t).filename = libc::strdup(old_name.as_ptr());
        }

        let res =
            unsafe { ffi::LIBMTP_Set_File_Name(self.inner, file_t, new_name.as_ptr() as *const _) };
        unsafe { ffi::LIBMTP_destroy_file_t(file_t) };

        if res != 0 {
            Err(self.latest_error().unwrap_or_default())
        } else {
            Ok(())
        }
    }

    /// Renames a folder object in place.
    pub fn set_folder_name(&self, object: &ObjectInfo, new_name: &str) -> Result<()> {
        let new_name = CString::new(new_name).map_err(|_| Error::InvalidArgument)?;

        let folder_t = unsafe { ffi::LIBMTP_new_folder_t() };
        unsafe {
            (*folder_t).folder_id = object.item_id;
            (*folder_t).parent_id = object.parent_id;
            (*folder_t).storage_id = object.storage_id;
            let old_name = CString::new(object.name.as_str()).map_err(|_| Error::InvalidArgument)?;
            (*folder_t).name = libc::strdup(old_name.as_ptr());
        }

        let res = unsafe { ffi::LIBMTP_Set_Folder_Name(self.inner, folder_t, new_name.as_ptr()) };
        unsafe { ffi::LIBMTP_destroy_folder_t(folder_t) };

        if res != 0 {
            Err(self.latest_error().unwrap_or_default())
        } else {
            Ok(())
        }
    }

    /// Moves an object to another parent folder. Not every device supports
    /// this; unsupported moves come back as a transport error.
    pub fn move_object(&self, object_id: u32, storage_id: u32, parent: Parent) -> Result<()> {
        let res =
            unsafe { ffi::LIBMTP_Move_Object(self.inner, object_id, storage_id, parent.to_id()) };

        if res != 0 {
            Err(self.latest_error().unwrap_or_default())
        } else {
            Ok(())
        }
    }

    unsafe fn new_file_t(&self, metadata: &ObjectMetadata<'_>) -> Result<*mut ffi::LIBMTP_file_t> {
        let name = CString::new(metadata.file_name).map_err(|_| Error::InvalidArgument)?;

        let file_t = ffi::LIBMTP_new_file_t();
        // item_id 0 asks the device to assign one; destroy_file_t frees the
        // strdup'ed name.
        (*file_t).item_id = 0;
        (*file_t).parent_id = metadata.parent_id;
        (*file_t).storage_id = metadata.storage_id;
        (*file_t).filesize = metadata.file_size;
        (*file_t).filetype = metadata.file_type.to_u32().expect("raw filetype");
        (*file_t).filename = libc::strdup(name.as_ptr());
        (*file_t).modificationdate = metadata.modification_date.timestamp();

        Ok(file_t)
    }
}

/// Take ownership of a malloc'ed string handed out by libmtp: copy it into an
/// owned `String` (invalid UTF-8 degraded, never propagated) and free the
/// original.
///
/// `ptr` must be non-null and must not be used after this call.
unsafe fn take_libmtp_string(ptr: *mut libc::c_char) -> String {
    let owned = CStr::from_ptr(ptr).to_string_lossy().into_owned();
    libc::free(ptr as *mut _);
    owned
}

/// Build upload metadata for a local scratch file heading to `parent` under the
/// given name.
pub fn upload_metadata<'a>(
    file_name: &'a str,
    file_size: u64,
    parent_id: u32,
    storage_id: u32,
    timestamp: Option<i64>,
) -> ObjectMetadata<'a> {
    let modification_date = timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now);

    ObjectMetadata {
        file_size,
        file_name,
        file_type: Filetype::from_path(file_name),
        parent_id,
        storage_id,
        modification_date,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_ids_round_trip() {
        assert_eq!(Parent::Root.to_id(), 0);
        assert_eq!(Parent::Folder(42).to_id(), 42);
        assert_eq!(Parent::from_item_id(0), Parent::Root);
        assert_eq!(Parent::from_item_id(-9999), Parent::Root);
        assert_eq!(Parent::from_item_id(7), Parent::Folder(7));
    }

    #[test]
    fn upload_metadata_guesses_filetype_and_clamps_timestamp() {
        let meta = upload_metadata("song.mp3", 1234, 3, 65537, Some(1_600_000_000));
        assert_eq!(meta.file_type, Filetype::Mp3);
        assert_eq!(meta.modification_date.timestamp(), 1_600_000_000);
        assert_eq!(meta.parent_id, 3);
        assert_eq!(meta.storage_id, 65537);

        let now = Utc::now().timestamp();
        let meta = upload_metadata("noext", 0, 0, 1, None);
        assert_eq!(meta.file_type, Filetype::Unknown);
        assert!(meta.modification_date.timestamp() >= now);
    }
}
