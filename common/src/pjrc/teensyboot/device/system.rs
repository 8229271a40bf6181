use std::collections::HashMap;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hidapi::{HidApi, HidDevice, HidError};
use serialport::{SerialPort, SerialPortType};

use crate::pjrc::teensyboot::device::{Device, DeviceBus, DeviceEvent, DevicePort, DeviceType, PortOpener};
use crate::pjrc::teensyboot::message::report;
use crate::pjrc::teensyboot::{Error, Result};

const SERIAL_OPEN_BAUD_RATE: u32 = 115200;

// The serialport crate has no "block forever", a day is close enough
const NO_TIMEOUT: Duration = Duration::from_secs(86400);

// Error translation ------------------------------------------------------------------------------

fn translate_hid_error(err: HidError) -> Error {
    match err {
        HidError::IoError { error } => Error::Io(error.to_string()),
        HidError::OpenHidDeviceWithDeviceInfoError { .. } => {
            Error::Access("Failed to open HID device".to_string())
        }
        err => Error::System(err.to_string()),
    }
}

fn translate_serial_error(err: serialport::Error) -> Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice => Error::NotFound(err.to_string()),
        serialport::ErrorKind::Io(_) => Error::Io(err.to_string()),
        _ => Error::System(err.to_string()),
    }
}

// Physical location ------------------------------------------------------------------------------

/// Physical USB location of an interface node, used to group the interfaces of one device
/// into a single board. On Linux the sysfs device link encodes the port path (`3-2:1.0`),
/// which survives the runtime/bootloader renumeration. Elsewhere this falls back to the
/// device path itself, which makes every interface its own board.
fn usb_location(path: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        if let Some(node) = path.strip_prefix("/dev/") {
            let class = if node.starts_with("hidraw") { "hidraw" } else { "tty" };
            let sysfs = format!("/sys/class/{}/{}/device", class, node);
            if let Ok(target) = std::fs::read_link(&sysfs) {
                // The interface component looks like "3-2:1.0"; its prefix before ':' is
                // the stable port path.
                for component in target.iter().rev() {
                    let component = component.to_string_lossy();
                    if let Some((port, _)) = component.split_once(':') {
                        if port.contains('-') {
                            return format!("usb-{}", port);
                        }
                    }
                }
            }
        }
    }

    path.to_string()
}

// Ports ------------------------------------------------------------------------------------------

struct SystemHidPort {
    dev: HidDevice,
    path: String,
}

impl DevicePort for SystemHidPort {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let millis = match timeout {
            Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        self.dev.read_timeout(buf, millis).map_err(|err| report(translate_hid_error(err)))
    }

    fn write(&mut self, _buf: &[u8], _timeout: Option<Duration>) -> Result<usize> {
        Err(report(Error::Unsupported(format!(
            "Serial write is not available on HID device '{}'",
            self.path
        ))))
    }

    fn hid_write(&mut self, report_buf: &[u8]) -> Result<usize> {
        self.dev.write(report_buf).map_err(|err| report(translate_hid_error(err)))
    }

    fn send_feature_report(&mut self, report_buf: &[u8]) -> Result<usize> {
        self.dev
            .send_feature_report(report_buf)
            .map_err(|err| report(translate_hid_error(err)))?;
        Ok(report_buf.len())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
        Err(report(Error::Unsupported(format!(
            "Cannot set serial parameters on HID device '{}'",
            self.path
        ))))
    }
}

struct SystemSerialPort {
    port: Box<dyn SerialPort>,
    path: String,
}

impl DevicePort for SystemSerialPort {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let timeout = timeout.unwrap_or(NO_TIMEOUT);
        self.port
            .set_timeout(timeout)
            .map_err(|err| report(translate_serial_error(err)))?;

        match self.port.read(buf) {
            Ok(len) => Ok(len),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(report(Error::Io(format!("Failed to read from '{}': {}", self.path, err)))),
        }
    }

    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let timeout = timeout.unwrap_or(NO_TIMEOUT);
        self.port
            .set_timeout(timeout)
            .map_err(|err| report(translate_serial_error(err)))?;

        match self.port.write(buf) {
            Ok(len) => Ok(len),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(report(Error::Io(format!("Failed to write to '{}': {}", self.path, err)))),
        }
    }

    fn hid_write(&mut self, _report: &[u8]) -> Result<usize> {
        Err(report(Error::Unsupported(format!(
            "HID report write is not available on serial device '{}'",
            self.path
        ))))
    }

    fn send_feature_report(&mut self, _report: &[u8]) -> Result<usize> {
        Err(report(Error::Unsupported(format!(
            "HID feature report is not available on serial device '{}'",
            self.path
        ))))
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud).map_err(|err| report(translate_serial_error(err)))
    }
}

// Opener -----------------------------------------------------------------------------------------

struct SystemOpener {
    api: Mutex<HidApi>,
}

impl PortOpener for SystemOpener {
    fn open(&self, dev: &Device) -> Result<Box<dyn DevicePort>> {
        match dev.dev_type {
            DeviceType::Hid => {
                let path = CString::new(dev.path.as_str())
                    .map_err(|_| report(Error::Param(format!("Invalid device path '{}'", dev.path))))?;
                let hid = self
                    .api
                    .lock()
                    .unwrap()
                    .open_path(&path)
                    .map_err(|err| report(translate_hid_error(err)))?;
                Ok(Box::new(SystemHidPort { dev: hid, path: dev.path.clone() }))
            }
            DeviceType::Serial => {
                let port = serialport::new(dev.path.as_str(), SERIAL_OPEN_BAUD_RATE)
                    .timeout(Duration::from_millis(500))
                    .open()
                    .map_err(|err| report(translate_serial_error(err)))?;
                Ok(Box::new(SystemSerialPort { port, path: dev.path.clone() }))
            }
        }
    }
}

// Bus --------------------------------------------------------------------------------------------

///
/// Production device bus.
///
/// Merges the HID enumeration from hidapi with the USB serial ports reported by the
/// serialport crate and synthesizes hotplug events by diffing successive enumeration
/// passes. There is no OS hotplug subscription here, the monitor simply refreshes at a
/// short interval.
///
pub struct SystemBus {
    opener: Arc<SystemOpener>,
    known: HashMap<String, Arc<Device>>,
}

impl SystemBus {
    pub fn new() -> Result<SystemBus> {
        let api = HidApi::new().map_err(|err| report(translate_hid_error(err)))?;

        Ok(SystemBus {
            opener: Arc::new(SystemOpener { api: Mutex::new(api) }),
            known: HashMap::new(),
        })
    }

    fn enumerate(&self) -> Result<HashMap<String, Arc<Device>>> {
        let mut devices = HashMap::new();

        {
            let mut api = self.opener.api.lock().unwrap();
            api.refresh_devices().map_err(|err| report(translate_hid_error(err)))?;

            for info in api.device_list() {
                let path = info.path().to_string_lossy().into_owned();
                let dev = Device {
                    location: usb_location(&path),
                    path: path.clone(),
                    vid: info.vendor_id(),
                    pid: info.product_id(),
                    dev_type: DeviceType::Hid,
                    serial_number: info.serial_number().map(str::to_string).filter(|s| !s.is_empty()),
                    manufacturer: info.manufacturer_string().map(str::to_string),
                    product: info.product_string().map(str::to_string),
                    usage_page: info.usage_page(),
                    usage: info.usage(),
                    bcd_device: info.release_number(),
                    iface_number: info.interface_number().max(0) as u8,
                };
                devices.insert(path, Arc::new(dev));
            }
        }

        let ports = serialport::available_ports().map_err(|err| report(translate_serial_error(err)))?;
        for port in ports {
            let usb = match port.port_type {
                SerialPortType::UsbPort(usb) => usb,
                _ => continue,
            };

            let dev = Device {
                location: usb_location(&port.port_name),
                path: port.port_name.clone(),
                vid: usb.vid,
                pid: usb.pid,
                dev_type: DeviceType::Serial,
                serial_number: usb.serial_number.filter(|s| !s.is_empty()),
                manufacturer: usb.manufacturer,
                product: usb.product,
                usage_page: 0,
                usage: 0,
                // Not reported through the serialport crate; runtime model detection falls
                // back to the family sentinel until a HID interface narrows it.
                bcd_device: 0,
                iface_number: 0,
            };
            devices.insert(port.port_name, Arc::new(dev));
        }

        Ok(devices)
    }
}

impl DeviceBus for SystemBus {
    fn refresh(&mut self) -> Result<Vec<DeviceEvent>> {
        let current = self.enumerate()?;
        let mut events = Vec::new();

        for path in self.known.keys() {
            if !current.contains_key(path) {
                events.push(DeviceEvent::Removed(path.clone()));
            }
        }
        for (path, dev) in &current {
            if !self.known.contains_key(path) {
                events.push(DeviceEvent::Added(dev.clone()));
            }
        }

        self.known = current;
        Ok(events)
    }

    fn opener(&self) -> Arc<dyn PortOpener> {
        self.opener.clone()
    }
}
