pub mod sim;
pub mod system;

use std::sync::Arc;
use std::time::Duration;

use crate::pjrc::teensyboot::Result;

// Device descriptor ------------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DeviceType {
    Hid,
    Serial,
}

///
/// Immutable descriptor of one enumerated USB interface.
///
/// `location` identifies the physical USB port and is shared by every interface of one
/// physical device; it is what groups interfaces into boards. `path` identifies this single
/// interface and is unique on the bus at any point in time.
///
#[derive(Debug, Clone)]
pub struct Device {
    pub location: String,
    pub path: String,
    pub vid: u16,
    pub pid: u16,
    pub dev_type: DeviceType,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// HID usage page and usage, zero for serial devices.
    pub usage_page: u16,
    pub usage: u16,
    pub bcd_device: u16,
    pub iface_number: u8,
}

// Hotplug stream ---------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(Arc<Device>),
    /// Carries the `path` of the interface which disappeared.
    Removed(String),
}

// Port and bus traits ----------------------------------------------------------------------------

///
/// Open handle onto a device, serial or HID.
///
/// Reads and writes block up to the given deadline and return `Ok(0)` on timeout. HID
/// reports carry the report id in byte 0 of the buffer. Operations which do not apply to
/// the device type return an `Unsupported` error.
///
pub trait DevicePort: Send {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;
    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize>;

    fn hid_write(&mut self, report: &[u8]) -> Result<usize>;
    fn send_feature_report(&mut self, report: &[u8]) -> Result<usize>;

    /// Only used by the serial reboot trick (baud rate 134).
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;
}

/// Opens ports for devices of one bus. Shared between the monitor and interfaces, which
/// may open ports from worker threads long after enumeration.
pub trait PortOpener: Send + Sync {
    fn open(&self, dev: &Device) -> Result<Box<dyn DevicePort>>;
}

///
/// Enumeration side of the platform device layer.
///
/// `refresh` performs one enumeration pass and returns the hotplug events observed since
/// the previous call; the first call reports every present device as `Added`.
///
pub trait DeviceBus: Send {
    fn refresh(&mut self) -> Result<Vec<DeviceEvent>>;
    fn opener(&self) -> Arc<dyn PortOpener>;
}

// Path comparison --------------------------------------------------------------------------------

/// Compare two device paths: case-insensitive on Windows, stat-equality (with a plain
/// string fallback) on POSIX, so `/dev/serial/by-id/...` aliases match their target.
pub fn compare_paths(path1: &str, path2: &str) -> bool {
    if path1 == path2 {
        return true;
    }

    #[cfg(windows)]
    {
        path1.eq_ignore_ascii_case(path2)
    }

    #[cfg(not(windows))]
    {
        use std::os::unix::fs::MetadataExt;

        match (std::fs::metadata(path1), std::fs::metadata(path2)) {
            (Ok(st1), Ok(st2)) => st1.dev() == st2.dev() && st1.ino() == st2.ino(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_paths_match() {
        assert!(compare_paths("/dev/ttyACM0", "/dev/ttyACM0"));
        assert!(!compare_paths("/dev/ttyACM0", "/dev/ttyACM1"));
    }

    #[cfg(not(windows))]
    #[test]
    fn stat_equality_resolves_aliases() {
        use std::os::unix::fs as unix_fs;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ttyACM0");
        let link = dir.path().join("usb-Teensyduino_1234");
        std::fs::write(&target, b"").unwrap();
        unix_fs::symlink(&target, &link).unwrap();

        assert!(compare_paths(target.to_str().unwrap(), link.to_str().unwrap()));
    }
}
