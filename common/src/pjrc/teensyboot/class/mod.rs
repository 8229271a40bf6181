pub mod generic;
pub mod teensy;

use std::time::Duration;

use bitflags::bitflags;

use crate::pjrc::teensyboot::board::{BoardState, Interface};
use crate::pjrc::teensyboot::device::{Device, DevicePort, DeviceType};
use crate::pjrc::teensyboot::firmware::Firmware;
use crate::pjrc::teensyboot::message::report;
use crate::pjrc::teensyboot::model::Model;
use crate::pjrc::teensyboot::{Error, Result};

// Capabilities -----------------------------------------------------------------------------------

bitflags! {
    ///
    /// Capability bits of an interface or board.
    ///
    /// A board's mask is the union of its interfaces' masks, except UNIQUE which sticks
    /// to the board once a unique serial number has been seen.
    ///
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const UNIQUE = 1 << 0;
        const RUN = 1 << 1;
        const UPLOAD = 1 << 2;
        const RESET = 1 << 3;
        const REBOOT = 1 << 4;
        const SERIAL = 1 << 5;
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Capability {
    Unique,
    Run,
    Upload,
    Reset,
    Reboot,
    Serial,
}

impl Capability {
    pub const COUNT: usize = 6;

    pub const ALL: [Capability; Capability::COUNT] = [
        Capability::Unique,
        Capability::Run,
        Capability::Upload,
        Capability::Reset,
        Capability::Reboot,
        Capability::Serial,
    ];

    pub fn mask(self) -> Capabilities {
        match self {
            Capability::Unique => Capabilities::UNIQUE,
            Capability::Run => Capabilities::RUN,
            Capability::Upload => Capabilities::UPLOAD,
            Capability::Reset => Capabilities::RESET,
            Capability::Reboot => Capabilities::REBOOT,
            Capability::Serial => Capabilities::SERIAL,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Capability::Unique => 0,
            Capability::Run => 1,
            Capability::Upload => 2,
            Capability::Reset => 3,
            Capability::Reboot => 4,
            Capability::Serial => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::Unique => "unique",
            Capability::Run => "run",
            Capability::Upload => "upload",
            Capability::Reset => "reset",
            Capability::Reboot => "reboot",
            Capability::Serial => "serial",
        }
    }
}

// Class trait ------------------------------------------------------------------------------------

/// Filled by [`DeviceClass::load_interface`] when a device is recognized.
pub struct InterfaceDetails {
    pub name: &'static str,
    pub capabilities: Capabilities,
    pub model: Model,
}

///
/// Per-class behavior of recognized devices.
///
/// A class decides whether a device belongs to it, how its interfaces merge into boards,
/// and implements the board operations for its interfaces. Classes are stateless statics,
/// the match table binds devices to them.
///
pub trait DeviceClass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect a device; return interface details to accept it, `None` to ignore it.
    fn load_interface(&self, dev: &Device) -> Result<Option<InterfaceDetails>>;

    ///
    /// Decide whether `iface` belongs to the board described by `state` and merge its
    /// identity (model, serial number, description, id) into it. Returns `Ok(false)` when
    /// the interface is incompatible, in which case the monitor replaces the board.
    ///
    fn update_board(&self, iface: &Interface, state: &mut BoardState, new_board: bool) -> Result<bool>;

    /// Scan a firmware image for models it was probably built for.
    fn identify_models(&self, fw: &Firmware, max_models: usize) -> Vec<Model> {
        let _ = (fw, max_models);
        Vec::new()
    }

    fn open_interface(&self, iface: &Interface) -> Result<Box<dyn DevicePort>>;

    fn serial_read(&self, iface: &Interface, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let _ = (buf, timeout);
        Err(report(Error::Unsupported(format!(
            "Serial I/O is not supported on '{}'",
            iface.path()
        ))))
    }

    fn serial_write(&self, iface: &Interface, buf: &[u8]) -> Result<usize> {
        let _ = buf;
        Err(report(Error::Unsupported(format!(
            "Serial I/O is not supported on '{}'",
            iface.path()
        ))))
    }

    fn upload(
        &self,
        iface: &Interface,
        fw: &Firmware,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let _ = (fw, progress);
        Err(report(Error::Unsupported(format!(
            "Firmware upload is not supported on '{}'",
            iface.path()
        ))))
    }

    fn reset(&self, iface: &Interface) -> Result<()> {
        Err(report(Error::Unsupported(format!(
            "Reset is not supported on '{}'",
            iface.path()
        ))))
    }

    fn reboot(&self, iface: &Interface) -> Result<()> {
        Err(report(Error::Unsupported(format!(
            "Reboot is not supported on '{}'",
            iface.path()
        ))))
    }
}

// Class registry ---------------------------------------------------------------------------------

static CLASSES: [&dyn DeviceClass; 2] = [&generic::GenericClass, &teensy::TeensyClass];

/// All registered classes, in identification order.
pub fn classes() -> &'static [&'static dyn DeviceClass] {
    &CLASSES
}

pub fn find_class(name: &str) -> Option<&'static dyn DeviceClass> {
    CLASSES.iter().find(|class| class.name() == name).copied()
}

// Match table ------------------------------------------------------------------------------------

///
/// One (vid, pid, type) pattern routing matching devices to a class.
///
/// `None` fields match anything; a `None` class disables matching devices entirely,
/// which lets user configuration turn off specific VID:PID pairs.
///
#[derive(Clone, Copy)]
pub struct MatchSpec {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub dev_type: Option<DeviceType>,
    pub class: Option<&'static dyn DeviceClass>,
}

impl MatchSpec {
    pub const fn vid_pid(vid: u16, pid: u16, class: &'static dyn DeviceClass) -> MatchSpec {
        MatchSpec {
            vid: Some(vid),
            pid: Some(pid),
            dev_type: None,
            class: Some(class),
        }
    }

    pub fn matches(&self, dev: &Device) -> bool {
        self.vid.is_none_or(|vid| vid == dev.vid)
            && self.pid.is_none_or(|pid| pid == dev.pid)
            && self.dev_type.is_none_or(|dev_type| dev_type == dev.dev_type)
    }
}

const TEENSY_PIDS: [u16; 17] = [
    0x0476, 0x0478, 0x0482, 0x0483, 0x0484, 0x0485, 0x0486, 0x0487, 0x0488, 0x0489, 0x048A,
    0x04D0, 0x04D1, 0x04D2, 0x04D3, 0x04D4, 0x04D9,
];

///
/// Ordered device matching policy, first match wins.
///
/// The default table routes the PJRC VID:PID pairs to the Teensy class and any other
/// serial device to the Generic class.
///
pub struct MatchTable {
    specs: Vec<MatchSpec>,
}

impl Default for MatchTable {
    fn default() -> Self {
        let mut specs: Vec<MatchSpec> = TEENSY_PIDS
            .iter()
            .map(|pid| MatchSpec::vid_pid(0x16C0, *pid, &teensy::TeensyClass))
            .collect();
        specs.push(MatchSpec {
            vid: None,
            pid: None,
            dev_type: Some(DeviceType::Serial),
            class: Some(&generic::GenericClass),
        });

        MatchTable { specs }
    }
}

impl MatchTable {
    pub fn new(specs: Vec<MatchSpec>) -> MatchTable {
        MatchTable { specs }
    }

    pub fn empty() -> MatchTable {
        MatchTable { specs: Vec::new() }
    }

    /// Insert a spec in front of the default entries, overriding them.
    pub fn prepend(&mut self, spec: MatchSpec) {
        self.specs.insert(0, spec);
    }

    /// Disable every entry matching the given VID:PID pair.
    pub fn disable(&mut self, vid: u16, pid: u16) {
        self.prepend(MatchSpec {
            vid: Some(vid),
            pid: Some(pid),
            dev_type: None,
            class: None,
        });
    }

    /// First spec matching the device, disabled entries included.
    pub fn find(&self, dev: &Device) -> Option<&MatchSpec> {
        self.specs.iter().find(|spec| spec.matches(dev))
    }
}
