//! This module contains information about possible errors, both POSIX precondition
//! failures surfaced to the kernel bridge and internal `libmtp` errors.

use libmtp_sys as ffi;
use std::ffi::CStr;
use thiserror::Error as ErrorTrait;

/// Enumeration of possible `libmtp` errors, check
/// [`Error::Transport`](enum.Error.html#variant.Transport) for more information.
#[derive(Debug, Clone, Copy)]
pub enum MtpErrorKind {
    General,
    PtpLayer,
    UsbLayer,
    MemoryAllocation,
    NoDeviceAttached,
    StorageFull,
    Connecting,
    Cancelled,
}

impl MtpErrorKind {
    pub(crate) fn from_error_number(error_code: ffi::LIBMTP_error_number_t) -> Option<Self> {
        match error_code {
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_NONE => None,
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_GENERAL => Some(Self::General),
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_PTP_LAYER => Some(Self::PtpLayer),
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_USB_LAYER => Some(Self::UsbLayer),
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_MEMORY_ALLOCATION => {
                Some(Self::MemoryAllocation)
            }
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_NO_DEVICE_ATTACHED => {
                Some(Self::NoDeviceAttached)
            }
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_STORAGE_FULL => Some(Self::StorageFull),
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_CONNECTING => Some(Self::Connecting),
            ffi::LIBMTP_error_number_t_LIBMTP_ERROR_CANCELLED => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Main error type. POSIX precondition failures carry the offending path and map
/// to their errno; transport level failures are opaque to callers and only decide
/// whether the recovery state machine runs.
#[derive(Debug, ErrorTrait)]
pub enum Error {
    /// Unknown error, probably some `libmtp` undocumented error.
    #[error("Unknown error (possibly a libmtp undocumented error)")]
    Unknown,

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Unknown file handle {0}")]
    BadHandle(u64),

    /// No device is currently open, either because none was found or because a
    /// failed reconnect left the session closed.
    #[error("No open MTP device")]
    NoDevice,

    /// Specific `libmtp` error, contains the kind of the error and extra information
    /// about what went wrong.
    #[error("Internal libmtp ({kind:?}): {text}")]
    Transport { kind: MtpErrorKind, text: String },

    /// A bulk transfer exceeded its alarm deadline.
    #[error("Transfer timed out after {seconds} seconds")]
    Timeout { seconds: u32 },

    /// Local scratch file I/O failure.
    #[error("I/O error ({source})")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Default for Error {
    fn default() -> Self {
        Error::Unknown
    }
}

impl Error {
    pub(crate) unsafe fn from_latest_error(mut list: *const ffi::LIBMTP_error_t) -> Option<Self> {
        if list.is_null() {
            None
        } else {
            while !(*list).next.is_null() {
                list = (*list).next;
            }

            let error_t = &*list;

            let kind = MtpErrorKind::from_error_number(error_t.errornumber)?;
            // Devices sometimes leave the text slot empty.
            let text = if error_t.error_text.is_null() {
                format!("libmtp reported {:?} with no error text", kind)
            } else {
                CStr::from_ptr(error_t.error_text).to_string_lossy().into_owned()
            };

            Some(Error::Transport { kind, text })
        }
    }

    /// Whether this error should send the session through the recovery state
    /// machine instead of being reported to the caller as-is.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout { .. } | Error::NoDevice | Error::Unknown
        )
    }

    /// The errno reported to the kernel bridge for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::InvalidArgument => libc::EINVAL,
            Error::BadHandle(_) => libc::EBADF,
            Error::Timeout { .. } => libc::EINTR,
            Error::Io { source } => source.raw_os_error().unwrap_or(libc::EIO),
            Error::NoDevice | Error::Transport { .. } | Error::Unknown => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_errors_map_to_their_errno() {
        assert_eq!(Error::NotFound("/x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::NotADirectory("/x".into()).errno(), libc::ENOTDIR);
        assert_eq!(Error::IsADirectory("/x".into()).errno(), libc::EISDIR);
        assert_eq!(Error::NotEmpty("/x".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(Error::AlreadyExists("/x".into()).errno(), libc::EEXIST);
        assert_eq!(Error::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(Error::BadHandle(7).errno(), libc::EBADF);
    }

    #[test]
    fn timeouts_surface_as_eintr_and_transport_as_eio() {
        assert_eq!(Error::Timeout { seconds: 10 }.errno(), libc::EINTR);
        assert_eq!(
            Error::Transport {
                kind: MtpErrorKind::UsbLayer,
                text: "stall".into()
            }
            .errno(),
            libc::EIO
        );
        assert_eq!(Error::NoDevice.errno(), libc::EIO);
    }

    #[test]
    fn only_transport_class_errors_trigger_recovery() {
        assert!(Error::Timeout { seconds: 1 }.is_transport());
        assert!(Error::NoDevice.is_transport());
        assert!(!Error::NotFound("/x".into()).is_transport());
        assert!(!Error::Io {
            source: std::io::Error::from_raw_os_error(libc::ENOSPC)
        }
        .is_transport());
    }

    #[test]
    fn io_errors_keep_their_os_errno() {
        let err = Error::Io {
            source: std::io::Error::from_raw_os_error(libc::ENOSPC),
        };
        assert_eq!(err.errno(), libc::ENOSPC);
    }
}
