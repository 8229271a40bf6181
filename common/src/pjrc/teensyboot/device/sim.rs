use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::pjrc::teensyboot::device::{Device, DeviceBus, DeviceEvent, DevicePort, PortOpener};
use crate::pjrc::teensyboot::message::report;
use crate::pjrc::teensyboot::{Error, Result};

/// Feature report sent to Seremu interfaces to enter the bootloader.
const SEREMU_REBOOT_REPORT: [u8; 5] = [0x00, 0xA9, 0x45, 0xC2, 0x6B];

/// Magic baud rate which reboots a Teensy serial interface.
const SERIAL_REBOOT_BAUD_RATE: u32 = 134;

// Scripted device swaps --------------------------------------------------------------------------

///
/// Interfaces to exchange when a scripted trigger fires, e.g. a runtime interface being
/// replaced by the HalfKay interface after a reboot command.
///
#[derive(Default, Clone)]
pub struct SimSwap {
    pub remove: Vec<String>,
    pub add: Vec<Device>,
}

// Per-device records -----------------------------------------------------------------------------

#[derive(Default)]
struct DeviceRecord {
    reports: Vec<Vec<u8>>,
    feature_reports: Vec<Vec<u8>>,
    reads: VecDeque<Vec<u8>>,
    serial_written: Vec<u8>,
    baud_changes: Vec<u32>,
    fail_writes: u32,
}

#[derive(Default)]
struct SimState {
    devices: HashMap<String, Arc<Device>>,
    pending: Vec<DeviceEvent>,
    records: HashMap<String, DeviceRecord>,
    reboot_swaps: HashMap<String, SimSwap>,
    reset_swaps: HashMap<String, SimSwap>,
}

impl SimState {
    fn apply_swap(&mut self, swap: &SimSwap) {
        for path in &swap.remove {
            if self.devices.remove(path).is_some() {
                self.pending.push(DeviceEvent::Removed(path.clone()));
            }
        }
        for dev in &swap.add {
            let dev = Arc::new(dev.clone());
            self.devices.insert(dev.path.clone(), dev.clone());
            self.pending.push(DeviceEvent::Added(dev));
        }
    }

    fn record(&mut self, path: &str) -> &mut DeviceRecord {
        self.records.entry(path.to_string()).or_default()
    }
}

// Port -------------------------------------------------------------------------------------------

struct SimPort {
    state: Arc<Mutex<SimState>>,
    path: String,
}

impl SimPort {
    fn check_attached(state: &SimState, path: &str) -> Result<()> {
        if state.devices.contains_key(path) {
            Ok(())
        } else {
            Err(report(Error::Io(format!("Device '{}' is gone", path))))
        }
    }

    fn check_write(state: &mut SimState, path: &str) -> Result<()> {
        Self::check_attached(state, path)?;
        let record = state.record(path);
        if record.fail_writes > 0 {
            record.fail_writes -= 1;
            return Err(report(Error::Io(format!("Simulated I/O failure on '{}'", path))));
        }
        Ok(())
    }
}

impl DevicePort for SimPort {
    fn read(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        Self::check_attached(&state, &self.path)?;

        match state.record(&self.path).reads.pop_front() {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8], _timeout: Option<Duration>) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        Self::check_write(&mut state, &self.path)?;

        state.record(&self.path).serial_written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn hid_write(&mut self, report_buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        Self::check_write(&mut state, &self.path)?;

        state.record(&self.path).reports.push(report_buf.to_vec());

        // A HalfKay frame with address 0xFFFFFF reboots into the freshly flashed firmware.
        let is_reset_frame = report_buf.len() >= 4 && report_buf[1] == 0xFF && report_buf[2] == 0xFF;
        if is_reset_frame {
            if let Some(swap) = state.reset_swaps.get(&self.path).cloned() {
                state.apply_swap(&swap);
            }
        }

        Ok(report_buf.len())
    }

    fn send_feature_report(&mut self, report_buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        Self::check_write(&mut state, &self.path)?;

        state.record(&self.path).feature_reports.push(report_buf.to_vec());

        if report_buf == SEREMU_REBOOT_REPORT.as_slice() {
            if let Some(swap) = state.reboot_swaps.get(&self.path).cloned() {
                state.apply_swap(&swap);
            }
        }

        Ok(report_buf.len())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_attached(&state, &self.path)?;

        state.record(&self.path).baud_changes.push(baud);

        if baud == SERIAL_REBOOT_BAUD_RATE {
            if let Some(swap) = state.reboot_swaps.get(&self.path).cloned() {
                state.apply_swap(&swap);
            }
        }

        Ok(())
    }
}

// Opener -----------------------------------------------------------------------------------------

struct SimOpener {
    state: Arc<Mutex<SimState>>,
}

impl PortOpener for SimOpener {
    fn open(&self, dev: &Device) -> Result<Box<dyn DevicePort>> {
        let state = self.state.lock().unwrap();
        if !state.devices.contains_key(&dev.path) {
            return Err(report(Error::NotFound(format!("Device '{}' not found", dev.path))));
        }

        Ok(Box::new(SimPort {
            state: self.state.clone(),
            path: dev.path.clone(),
        }))
    }
}

// Bus and control handle -------------------------------------------------------------------------

///
/// Simulated device bus.
///
/// The bus delivers the plug/unplug events scripted through the [`SimHandle`] and models
/// just enough Teensy behavior for end-to-end tests: reboot and reset commands received on
/// a port trigger interface swaps registered beforehand, and every report, serial byte and
/// baud rate change is recorded for inspection.
///
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
    opener: Arc<SimOpener>,
}

#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new() -> (SimBus, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        let bus = SimBus {
            state: state.clone(),
            opener: Arc::new(SimOpener { state: state.clone() }),
        };
        (bus, SimHandle { state })
    }
}

impl DeviceBus for SimBus {
    fn refresh(&mut self) -> Result<Vec<DeviceEvent>> {
        let mut state = self.state.lock().unwrap();
        Ok(std::mem::take(&mut state.pending))
    }

    fn opener(&self) -> Arc<dyn PortOpener> {
        self.opener.clone()
    }
}

impl SimHandle {
    pub fn plug(&self, dev: Device) {
        let mut state = self.state.lock().unwrap();
        let dev = Arc::new(dev);
        state.devices.insert(dev.path.clone(), dev.clone());
        state.pending.push(DeviceEvent::Added(dev));
    }

    pub fn unplug(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        if state.devices.remove(path).is_some() {
            state.pending.push(DeviceEvent::Removed(path.to_string()));
        }
    }

    /// Register the interface swap performed when `path` receives a reboot command.
    pub fn on_reboot(&self, path: &str, swap: SimSwap) {
        self.state.lock().unwrap().reboot_swaps.insert(path.to_string(), swap);
    }

    /// Register the interface swap performed when `path` receives the HalfKay reset frame.
    pub fn on_reset(&self, path: &str, swap: SimSwap) {
        self.state.lock().unwrap().reset_swaps.insert(path.to_string(), swap);
    }

    /// Queue data returned by the next reads on `path`, one chunk per read call.
    pub fn push_read(&self, path: &str, data: &[u8]) {
        self.state.lock().unwrap().record(path).reads.push_back(data.to_vec());
    }

    /// Make the next `count` writes on `path` fail with an I/O error.
    pub fn fail_next_writes(&self, path: &str, count: u32) {
        self.state.lock().unwrap().record(path).fail_writes = count;
    }

    pub fn reports(&self, path: &str) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().record(path).reports.clone()
    }

    pub fn feature_reports(&self, path: &str) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().record(path).feature_reports.clone()
    }

    pub fn serial_written(&self, path: &str) -> Vec<u8> {
        self.state.lock().unwrap().record(path).serial_written.clone()
    }

    pub fn baud_changes(&self, path: &str) -> Vec<u32> {
        self.state.lock().unwrap().record(path).baud_changes.clone()
    }
}
