//! Module to manage some internal functionality of `libmtp` like the one-time
//! library initialisation and debug levels.

use bitflags::bitflags;
use libmtp_sys as ffi;
use std::sync::Once;

static INIT: Once = Once::new();

/// `LIBMTP_Init` must run exactly once per process, before any other call into
/// the native library.
pub(crate) fn maybe_init() {
    INIT.call_once(|| unsafe {
        ffi::LIBMTP_Init();
    });
}

bitflags! {
    /// Bitflags to activate different levels of debugging inside `libmtp`, multiple levels
    /// are activated by using a bitwise or.
    pub struct DebugLevel: i32 {
        const NONE = ffi::LIBMTP_DEBUG_NONE as i32;
        const PTP = ffi::LIBMTP_DEBUG_PTP as i32;
        const PLST = ffi::LIBMTP_DEBUG_PLST as i32;
        const USB = ffi::LIBMTP_DEBUG_USB as i32;
        const DATA = ffi::LIBMTP_DEBUG_DATA as i32;
        const ALL = ffi::LIBMTP_DEBUG_ALL as i32;
    }
}

/// Set the internal debug level of libmtp (C library) using bitflags.
///
/// ## Example
/// ```no_run
/// use mtpfs::internals::{set_debug, DebugLevel};
///
/// set_debug(DebugLevel::PTP | DebugLevel::USB);
/// ```
pub fn set_debug(level: DebugLevel) {
    maybe_init();

    unsafe {
        ffi::LIBMTP_Set_Debug(level.bits());
    }
}
