//! Module to handle raw devices, the entrypoint to enumerate and open connected
//! USB devices.

use libmtp_sys as ffi;
use std::ffi::CStr;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use crate::device::MtpDevice;
use crate::error::{Error, MtpErrorKind};
use crate::internals::maybe_init;
use crate::Result;

/// This struct handles a raw device, which should be opened with `open_uncached`
/// if you want to manage the proper MTP device.
pub struct RawDevice {
    pub(crate) inner: ffi::LIBMTP_raw_device_struct,
}

impl Debug for RawDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDevice")
            .field("bus_number", &self.bus_number())
            .field("dev_number", &self.dev_number())
            .field("vendor_id", &self.vendor_id())
            .field("product_id", &self.product_id())
            .finish()
    }
}

impl Display for RawDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}  {:<20} {:<40}",
            self.vendor_id(),
            self.product_id(),
            self.vendor(),
            self.product(),
        )
    }
}

impl RawDevice {
    /// Open an MTP device from this raw device descriptor, uncached version.
    pub fn open_uncached(&self) -> Option<MtpDevice> {
        unsafe {
            let ptr = &self.inner as *const _;
            let device = ffi::LIBMTP_Open_Raw_Device_Uncached(ptr as *mut _);

            if device.is_null() {
                None
            } else {
                Some(MtpDevice { inner: device })
            }
        }
    }

    /// Returns the bus number of this raw device.
    pub fn bus_number(&self) -> u32 {
        self.inner.bus_location
    }

    /// Returns the device number of this raw device.
    pub fn dev_number(&self) -> u8 {
        self.inner.devnum
    }

    pub fn vendor_id(&self) -> u16 {
        self.inner.device_entry.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.inner.device_entry.product_id
    }

    /// Vendor name from the static device table, copied into an owned string.
    /// Devices missing from `music-players.h` have no name.
    pub fn vendor(&self) -> String {
        copy_entry_string(self.inner.device_entry.vendor)
    }

    /// Product name from the static device table, copied into an owned string.
    pub fn product(&self) -> String {
        copy_entry_string(self.inner.device_entry.product)
    }
}

fn copy_entry_string(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        "UNKNOWN".to_string()
    } else {
        unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }
    }
}

/// Detect the raw device descriptors of every connected MTP device.
pub fn detect_raw_devices() -> Result<Vec<RawDevice>> {
    maybe_init();

    let mut list = std::ptr::null_mut();
    let mut count = 0;

    let res = unsafe { ffi::LIBMTP_Detect_Raw_Devices(&mut list, &mut count) };
    if let Some(kind) = MtpErrorKind::from_error_number(res) {
        return Err(Error::Transport {
            kind,
            text: format!("USB scan for MTP devices failed ({:?})", kind),
        });
    }

    // The descriptors are plain data inside one malloc'ed array; copy each out
    // before the array is handed back to the C allocator.
    let devices = (0..count as usize)
        .map(|offset| RawDevice {
            inner: unsafe { std::ptr::read(list.add(offset)) },
        })
        .collect();

    if !list.is_null() {
        unsafe { libc::free(list as *mut _) };
    }

    Ok(devices)
}

/// How the user identified the device to mount: a decimal index into the
/// detected device list, or a `vvvv:pppp` hex USB vendor:product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    First,
    Index(usize),
    UsbId { vendor: u16, product: u16 },
}

impl DeviceSelector {
    /// Pick the matching device out of a detected list.
    pub fn pick<'a>(&self, devices: &'a [RawDevice]) -> Option<&'a RawDevice> {
        match *self {
            DeviceSelector::First => devices.first(),
            DeviceSelector::Index(idx) => devices.get(idx),
            DeviceSelector::UsbId { vendor, product } => devices
                .iter()
                .find(|dev| dev.vendor_id() == vendor && dev.product_id() == product),
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((vendor, product)) = s.split_once(':') {
            let vendor = u16::from_str_radix(vendor.trim(), 16).map_err(|_| Error::InvalidArgument)?;
            let product =
                u16::from_str_radix(product.trim(), 16).map_err(|_| Error::InvalidArgument)?;
            Ok(DeviceSelector::UsbId { vendor, product })
        } else {
            let idx: usize = s.parse().map_err(|_| Error::InvalidArgument)?;
            Ok(DeviceSelector::Index(idx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parses_decimal_index() {
        assert_eq!("0".parse::<DeviceSelector>().unwrap(), DeviceSelector::Index(0));
        assert_eq!("12".parse::<DeviceSelector>().unwrap(), DeviceSelector::Index(12));
    }

    #[test]
    fn selector_parses_hex_usb_id() {
        assert_eq!(
            "091e:4b54".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::UsbId {
                vendor: 0x091e,
                product: 0x4b54
            }
        );
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!("affe".parse::<DeviceSelector>().is_err());
        assert!("zz:11".parse::<DeviceSelector>().is_err());
        assert!("1:2:3".parse::<DeviceSelector>().is_err());
    }
}
