use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::pjrc::teensyboot::class::{Capabilities, Capability, DeviceClass};
use crate::pjrc::teensyboot::device::{compare_paths, Device, DevicePort, PortOpener};
use crate::pjrc::teensyboot::firmware::Firmware;
use crate::pjrc::teensyboot::message::{self, report, LogLevel};
use crate::pjrc::teensyboot::model::Model;
use crate::pjrc::teensyboot::monitor::MonitorShared;
use crate::pjrc::teensyboot::task::Task;
use crate::pjrc::teensyboot::{adjust_timeout, Error, Result};

#[cfg(windows)]
pub(crate) const MANUAL_REBOOT_DELAY: Duration = Duration::from_millis(15000);
#[cfg(not(windows))]
pub(crate) const MANUAL_REBOOT_DELAY: Duration = Duration::from_millis(8000);

const FINAL_TASK_TIMEOUT: Duration = Duration::from_millis(8000);

const UPLOAD_MAX_FIRMWARES: usize = 256;
const SEND_BLOCK_SIZE: usize = 1024;

// Interface --------------------------------------------------------------------------------------

pub type SharedPort = Arc<Mutex<Box<dyn DevicePort>>>;

struct OpenPort {
    count: usize,
    port: Option<SharedPort>,
}

///
/// One classified USB interface of a board.
///
/// Opening is reference counted so concurrent users (serial readers, upload tasks) share
/// a single OS handle; the port is closed when the last user is done.
///
pub struct Interface {
    class: &'static dyn DeviceClass,
    dev: Arc<Device>,
    name: &'static str,
    model: Model,
    caps: Mutex<Capabilities>,
    board: Mutex<Weak<Board>>,
    open_lock: Mutex<OpenPort>,
    opener: Arc<dyn PortOpener>,
}

impl Interface {
    pub(crate) fn new(
        class: &'static dyn DeviceClass,
        dev: Arc<Device>,
        name: &'static str,
        capabilities: Capabilities,
        model: Model,
        opener: Arc<dyn PortOpener>,
    ) -> Arc<Interface> {
        Arc::new(Interface {
            class,
            dev,
            name,
            model,
            caps: Mutex::new(capabilities),
            board: Mutex::new(Weak::new()),
            open_lock: Mutex::new(OpenPort { count: 0, port: None }),
            opener,
        })
    }

    pub fn class(&self) -> &'static dyn DeviceClass {
        self.class
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    pub fn path(&self) -> &str {
        &self.dev.path
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.caps.lock().unwrap()
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().contains(cap.mask())
    }

    pub(crate) fn add_capabilities(&self, caps: Capabilities) {
        *self.caps.lock().unwrap() |= caps;
    }

    /// The board currently aggregating this interface, if it is still around.
    pub fn board(&self) -> Option<Arc<Board>> {
        self.board.lock().unwrap().upgrade()
    }

    pub(crate) fn set_board(&self, board: &Arc<Board>) {
        *self.board.lock().unwrap() = Arc::downgrade(board);
    }

    pub(crate) fn opener(&self) -> &Arc<dyn PortOpener> {
        &self.opener
    }

    ///
    /// Open the interface, or join an existing open. Every `open` must be matched by one
    /// `close`; [`Board::open_interface`] wraps the pair into a guard.
    ///
    pub fn open(&self) -> Result<()> {
        let mut open = self.open_lock.lock().unwrap();

        if open.port.is_none() {
            let port = self.class.open_interface(self)?;
            open.port = Some(Arc::new(Mutex::new(port)));
        }
        open.count += 1;

        Ok(())
    }

    pub fn close(&self) {
        let mut open = self.open_lock.lock().unwrap();

        if open.count > 0 {
            open.count -= 1;
            if open.count == 0 {
                open.port = None;
            }
        }
    }

    /// Shared OS handle of an opened interface, used by class implementations.
    pub fn port(&self) -> Result<SharedPort> {
        let open = self.open_lock.lock().unwrap();
        match &open.port {
            Some(port) => Ok(port.clone()),
            None => Err(report(Error::Other(format!(
                "Interface '{}' is not open",
                self.dev.path
            )))),
        }
    }

}

///
/// RAII guard pairing [`Interface::open`] with its close.
///
pub struct OpenInterface {
    iface: Arc<Interface>,
}

impl std::ops::Deref for OpenInterface {
    type Target = Interface;

    fn deref(&self) -> &Interface {
        &self.iface
    }
}

impl Drop for OpenInterface {
    fn drop(&mut self) {
        self.iface.close();
    }
}

// Board ------------------------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BoardStatus {
    /// Terminal, the board is gone and will never come back.
    Dropped,
    /// All interfaces disappeared, the drop timer is running.
    Missing,
    Online,
}

///
/// Mutable state of a board, protected by the board lock.
///
/// Classes mutate the identity fields from `update_board`, the monitor mutates the
/// interface list and capability map.
///
pub struct BoardState {
    pub(crate) status: BoardStatus,
    pub(crate) missing_since: Option<Instant>,

    pub(crate) model: Model,
    pub(crate) id: String,
    /// User override, `None` means the tag follows the id.
    pub(crate) tag: Option<String>,
    pub(crate) vid: u16,
    pub(crate) pid: u16,
    pub(crate) serial_number: Option<String>,
    pub(crate) description: Option<String>,

    pub(crate) ifaces: Vec<Arc<Interface>>,
    pub(crate) capabilities: Capabilities,
    pub(crate) cap2iface: [Option<Arc<Interface>>; Capability::COUNT],

    pub(crate) current_task: Option<String>,
}

impl BoardState {
    pub(crate) fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.id)
    }
}

///
/// Logical board aggregating every interface at one USB location.
///
/// A board keeps its identity across bootloader/runtime transitions; it goes MISSING when
/// its interfaces disappear and is DROPPED for good once the drop delay expires.
///
pub struct Board {
    location: String,
    shared: Arc<MonitorShared>,
    pub(crate) state: Mutex<BoardState>,
}

impl Board {
    pub(crate) fn new(location: &str, vid: u16, pid: u16, shared: Arc<MonitorShared>) -> Arc<Board> {
        Arc::new(Board {
            location: location.to_string(),
            shared,
            state: Mutex::new(BoardState {
                status: BoardStatus::Online,
                missing_since: None,
                model: Model::Generic,
                id: String::new(),
                tag: None,
                vid,
                pid,
                serial_number: None,
                description: None,
                ifaces: Vec::new(),
                capabilities: Capabilities::empty(),
                cap2iface: Default::default(),
                current_task: None,
            }),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn id(&self) -> String {
        self.state.lock().unwrap().id.clone()
    }

    pub fn tag(&self) -> String {
        self.state.lock().unwrap().tag().to_string()
    }

    /// Override the user-visible tag; `None` reverts to the board id.
    pub fn set_tag(&self, tag: Option<&str>) {
        self.state.lock().unwrap().tag = tag.map(str::to_string);
    }

    pub fn status(&self) -> BoardStatus {
        self.state.lock().unwrap().status
    }

    pub fn model(&self) -> Model {
        self.state.lock().unwrap().model
    }

    pub fn vid(&self) -> u16 {
        self.state.lock().unwrap().vid
    }

    pub fn pid(&self) -> u16 {
        self.state.lock().unwrap().pid
    }

    pub fn serial_number(&self) -> Option<String> {
        self.state.lock().unwrap().serial_number.clone()
    }

    pub fn description(&self) -> Option<String> {
        self.state.lock().unwrap().description.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state.lock().unwrap().capabilities
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().contains(cap.mask())
    }

    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.state.lock().unwrap().ifaces.clone()
    }

    pub fn missing_since(&self) -> Option<Instant> {
        self.state.lock().unwrap().missing_since
    }

    ///
    /// Match this board against a `<serial>[-<manufacturer>][@<path>]` filter.
    ///
    /// Empty filter parts match anything; the path part matches the board location or any
    /// interface path. A filter equal to the explicit user tag always matches.
    ///
    pub fn matches_tag(&self, filter: &str) -> bool {
        let st = self.state.lock().unwrap();

        if let Some(tag) = &st.tag {
            if filter == tag {
                return true;
            }
        }

        let (id_part, path_part) = match filter.split_once('@') {
            Some((id_part, path_part)) => (id_part, Some(path_part)),
            None => (filter, None),
        };
        let (serial_part, family_part) = match id_part.split_once('-') {
            Some((serial_part, family_part)) => (serial_part, Some(family_part)),
            None => (id_part, None),
        };

        let (board_serial, board_family) = match st.id.split_once('-') {
            Some((serial, family)) => (serial, Some(family)),
            None => (st.id.as_str(), None),
        };

        if !serial_part.is_empty() && serial_part != board_serial {
            return false;
        }
        if let Some(family_part) = family_part {
            if !family_part.is_empty() && Some(family_part) != board_family {
                return false;
            }
        }
        if let Some(path_part) = path_part {
            if !path_part.is_empty()
                && !compare_paths(path_part, &self.location)
                && !st.ifaces.iter().any(|iface| compare_paths(path_part, iface.path()))
            {
                return false;
            }
        }

        true
    }

    ///
    /// Block until the board exposes `cap`, it is dropped, or the timeout expires.
    ///
    /// Must be called from a thread other than the one driving the monitor; that thread
    /// uses [`crate::pjrc::teensyboot::monitor::Monitor::wait_for`] instead, which pumps
    /// hotplug events while waiting.
    ///
    pub fn wait_for(&self, cap: Capability, timeout: Option<Duration>) -> Result<bool> {
        if std::thread::current().id() == self.shared.owner() {
            return Err(report(Error::Param(format!(
                "Cannot wait for board '{}' from the monitor thread",
                self.tag()
            ))));
        }

        let start = Instant::now();
        let mut generation = self.shared.generation_lock();

        loop {
            {
                let st = self.state.lock().unwrap();
                if st.status == BoardStatus::Dropped {
                    let tag = st.tag().to_string();
                    drop(st);
                    return Err(report(Error::NotFound(format!("Board '{}' has disappeared", tag))));
                }
                if st.capabilities.contains(cap.mask()) {
                    return Ok(true);
                }
            }
            if !self.shared.is_alive() {
                return Err(report(Error::NotFound(format!(
                    "Cannot wait on unmonitored board '{}'",
                    self.tag()
                ))));
            }

            let current = *generation;
            while *generation == current {
                let remaining = adjust_timeout(timeout, start);
                if remaining == Some(Duration::ZERO) {
                    return Ok(false);
                }

                generation = self.shared.wait_generation(generation, remaining);
            }
        }
    }

    ///
    /// Open the interface providing `cap`, shared with any other current user.
    ///
    /// Returns `Ok(None)` when no interface provides the capability right now.
    ///
    pub fn open_interface(&self, cap: Capability) -> Result<Option<OpenInterface>> {
        let iface = {
            let st = self.state.lock().unwrap();
            match &st.cap2iface[cap.index()] {
                Some(iface) => iface.clone(),
                None => return Ok(None),
            }
        };

        iface.open()?;
        Ok(Some(OpenInterface { iface }))
    }

    pub fn serial_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let iface = self.open_interface(Capability::Serial)?.ok_or_else(|| {
            report(Error::Mode(format!(
                "Board '{}' is not available for serial I/O",
                self.tag()
            )))
        })?;

        iface.class().serial_read(&iface, buf, timeout)
    }

    pub fn serial_write(&self, buf: &[u8]) -> Result<usize> {
        let iface = self.open_interface(Capability::Serial)?.ok_or_else(|| {
            report(Error::Mode(format!(
                "Board '{}' is not available for serial I/O",
                self.tag()
            )))
        })?;

        iface.class().serial_write(&iface, buf)
    }

    pub fn upload(&self, fw: &Firmware, progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
        let iface = self.open_interface(Capability::Upload)?.ok_or_else(|| {
            report(Error::Mode(format!("Cannot upload to board '{}'", self.tag())))
        })?;

        iface.class().upload(&iface, fw, progress)
    }

    pub fn reset(&self) -> Result<()> {
        let iface = self.open_interface(Capability::Reset)?.ok_or_else(|| {
            report(Error::Mode(format!("Cannot reset board '{}'", self.tag())))
        })?;

        iface.class().reset(&iface)
    }

    pub fn reboot(&self) -> Result<()> {
        let iface = self.open_interface(Capability::Reboot)?.ok_or_else(|| {
            report(Error::Mode(format!("Cannot reboot board '{}'", self.tag())))
        })?;

        iface.class().reboot(&iface)
    }
}

// Board tasks ------------------------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UploadFlags: u32 {
        /// Do not reboot the board, wait indefinitely for the bootloader to show up.
        const WAIT = 1;
        /// Leave the board in bootloader mode after flashing.
        const NORESET = 2;
        /// Skip the firmware/model compatibility check, accepts exactly one firmware.
        const NOCHECK = 4;
    }
}

fn new_board_task(
    board: &Arc<Board>,
    action: &str,
    body: impl FnOnce(&Arc<Task>) -> Result<()> + Send + 'static,
) -> Result<Arc<Task>> {
    let name = {
        let mut st = board.state.lock().unwrap();
        if let Some(current) = &st.current_task {
            return Err(report(Error::Busy(format!(
                "Board '{}' is busy on task '{}'",
                st.tag(),
                current
            ))));
        }

        let name = format!("{}@{}", action, st.tag());
        st.current_task = Some(name.clone());
        name
    };

    let task = Task::new(&name, body);
    let board = board.clone();
    task.set_finalize(move || {
        board.state.lock().unwrap().current_task = None;
    });

    Ok(task)
}

fn model_list(models: &[Model]) -> String {
    let mut buf = String::new();
    for (i, model) in models.iter().enumerate() {
        if i > 0 {
            buf.push_str(if i + 1 < models.len() { ", " } else { " and " });
        }
        buf.push_str(model.name());
    }
    buf
}

fn select_compatible_firmware(board: &Board, fws: &[Arc<Firmware>]) -> Result<Arc<Firmware>> {
    let model = board.model();
    let mut fw_models = Vec::new();

    for fw in fws {
        fw_models = fw.identify(64);
        if fw_models.contains(&model) {
            return Ok(fw.clone());
        }
    }

    if fws.len() > 1 {
        Err(report(Error::Unsupported(format!(
            "No firmware is compatible with '{}' ({})",
            board.tag(),
            model.name()
        ))))
    } else if !fw_models.is_empty() {
        Err(report(Error::Unsupported(format!(
            "Firmware '{}' is only compatible with {}",
            fws[0].name(),
            model_list(&fw_models)
        ))))
    } else {
        Err(report(Error::Unsupported(format!(
            "Firmware '{}' is not compatible with '{}'",
            fws[0].name(),
            board.tag()
        ))))
    }
}

fn run_upload(board: &Arc<Board>, task: &Arc<Task>, fws: &[Arc<Firmware>], flags: UploadFlags) -> Result<()> {
    let mut fw = if flags.contains(UploadFlags::NOCHECK) {
        Some(fws[0].clone())
    } else if board.model().is_real() {
        Some(select_compatible_firmware(board, fws)?)
    } else {
        // The model is not known yet, retry after the bootloader has shown up
        None
    };

    message::log(
        LogLevel::Info,
        &format!("Uploading to board '{}' ({})", board.tag(), board.model().name()),
    );

    // Can't upload directly, should we try to reboot or wait?
    let mut wait_forever = flags.contains(UploadFlags::WAIT);
    if !board.has_capability(Capability::Upload) {
        if wait_forever {
            message::log(LogLevel::Info, "Waiting for device (press button to reboot)...");
        } else {
            message::log(LogLevel::Info, "Triggering board reboot");
            if let Err(err) = board.reboot() {
                // A failed reboot is not fatal, the user can still press the button
                message::log(
                    LogLevel::Warning,
                    &format!("Failed to reboot board '{}': {}", board.tag(), err),
                );
                message::log(LogLevel::Info, "Waiting for device (press button to reboot)...");
                wait_forever = true;
            }
        }
    }

    loop {
        let timeout = if wait_forever { None } else { Some(MANUAL_REBOOT_DELAY) };
        if board.wait_for(Capability::Upload, timeout)? {
            break;
        }

        message::log(LogLevel::Info, "Reboot didn't work, press button manually");
        wait_forever = true;
    }

    let fw = match fw.take() {
        Some(fw) => fw,
        None => select_compatible_firmware(board, fws)?,
    };

    let total_size = fw.total_size();
    let name = fw.name().to_string();
    board.upload(&fw, &mut |uploaded, flash_size| {
        if uploaded == 0 {
            message::log(LogLevel::Info, &format!("Firmware: {}", name));
            if total_size >= 1024 {
                message::log(
                    LogLevel::Info,
                    &format!(
                        "Flash usage: {} kiB ({:.1}%)",
                        (total_size + 1023) / 1024,
                        total_size as f64 / flash_size as f64 * 100.0
                    ),
                );
            } else {
                message::log(
                    LogLevel::Info,
                    &format!(
                        "Flash usage: {} bytes ({:.1}%)",
                        total_size,
                        total_size as f64 / flash_size as f64 * 100.0
                    ),
                );
            }
        }
        message::progress("Uploading", uploaded.min(total_size) as u64, total_size as u64);
    })?;

    if !flags.contains(UploadFlags::NORESET) {
        message::log(LogLevel::Info, "Sending reset command");
        board.reset()?;

        if !board.wait_for(Capability::Run, Some(FINAL_TASK_TIMEOUT))? {
            return Err(report(Error::Timeout(format!(
                "Failed to reset board '{}'",
                board.tag()
            ))));
        }
    } else {
        message::log(LogLevel::Info, "Firmware uploaded, reset the board to use it");
    }

    task.set_result(fw);
    Ok(())
}

///
/// Create an upload task for the board.
///
/// The task reboots the board into its bootloader if needed, picks the first compatible
/// firmware of `fws`, flashes it and resets the board, honoring `flags`.
///
pub fn upload(board: &Arc<Board>, fws: &[Arc<Firmware>], flags: UploadFlags) -> Result<Arc<Task>> {
    if fws.is_empty() {
        return Err(report(Error::Param("At least one firmware is required".to_string())));
    }

    let mut fws = fws.to_vec();
    if fws.len() > UPLOAD_MAX_FIRMWARES {
        message::log(
            LogLevel::Warning,
            &format!("Cannot select more than {} firmwares per upload", UPLOAD_MAX_FIRMWARES),
        );
        fws.truncate(UPLOAD_MAX_FIRMWARES);
    }
    if flags.contains(UploadFlags::NOCHECK) {
        fws.truncate(1);
    }

    let board = board.clone();
    new_board_task(&board.clone(), "upload", move |task| {
        run_upload(&board, task, &fws, flags)
    })
}

fn run_reset(board: &Arc<Board>) -> Result<()> {
    message::log(
        LogLevel::Info,
        &format!("Resetting board '{}' ({})", board.tag(), board.model().name()),
    );

    if !board.has_capability(Capability::Reset) && board.has_capability(Capability::Reboot) {
        message::log(LogLevel::Info, "Triggering board reboot");
        board.reboot()?;

        if !board.wait_for(Capability::Reset, Some(MANUAL_REBOOT_DELAY))? {
            return Err(report(Error::Timeout(format!(
                "Failed to reboot board '{}'",
                board.tag()
            ))));
        }
    }

    message::log(LogLevel::Info, "Sending reset command");
    board.reset()?;

    if !board.wait_for(Capability::Run, Some(FINAL_TASK_TIMEOUT))? {
        return Err(report(Error::Timeout(format!(
            "Failed to reset board '{}'",
            board.tag()
        ))));
    }

    Ok(())
}

/// Create a reset task, reverting the board to its runtime firmware.
pub fn reset(board: &Arc<Board>) -> Result<Arc<Task>> {
    let board = board.clone();
    new_board_task(&board.clone(), "reset", move |_task| run_reset(&board))
}

fn run_reboot(board: &Arc<Board>) -> Result<()> {
    message::log(
        LogLevel::Info,
        &format!("Rebooting board '{}' ({})", board.tag(), board.model().name()),
    );

    if board.has_capability(Capability::Upload) {
        message::log(LogLevel::Info, "Board is already in bootloader mode");
        return Ok(());
    }

    message::log(LogLevel::Info, "Triggering board reboot");
    board.reboot()?;

    if !board.wait_for(Capability::Upload, Some(FINAL_TASK_TIMEOUT))? {
        return Err(report(Error::Timeout(format!(
            "Failed to reboot board '{}'",
            board.tag()
        ))));
    }

    Ok(())
}

/// Create a reboot task, switching the board to bootloader mode.
pub fn reboot(board: &Arc<Board>) -> Result<Arc<Task>> {
    let board = board.clone();
    new_board_task(&board.clone(), "reboot", move |_task| run_reboot(&board))
}

fn run_send(board: &Arc<Board>, buf: &[u8]) -> Result<()> {
    let mut written = 0;

    while written < buf.len() {
        message::progress("Sending", written as u64, buf.len() as u64);

        let block_size = SEND_BLOCK_SIZE.min(buf.len() - written);
        let sent = board.serial_write(&buf[written..written + block_size])?;
        written += sent;
    }
    message::progress("Sending", buf.len() as u64, buf.len() as u64);

    Ok(())
}

/// Create a task sending `buf` through the board's serial interface.
pub fn send(board: &Arc<Board>, buf: &[u8]) -> Result<Arc<Task>> {
    let board = board.clone();
    let buf = buf.to_vec();
    new_board_task(&board.clone(), "send", move |_task| run_send(&board, &buf))
}

fn run_send_file(board: &Arc<Board>, filename: &str, mut file: std::fs::File, size: u64) -> Result<()> {
    use std::io::Read;

    let mut written = 0u64;
    let mut buf = [0u8; SEND_BLOCK_SIZE];

    while written < size {
        message::progress("Sending", written, size);

        let block_size = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(len) => len,
            Err(err) => {
                return Err(report(Error::Io(format!(
                    "I/O error while reading '{}': {}",
                    filename, err
                ))))
            }
        };

        let mut block_written = 0;
        while block_written < block_size {
            block_written += board.serial_write(&buf[block_written..block_size])?;
        }

        written += block_size as u64;
    }
    message::progress("Sending", size, size);

    Ok(())
}

/// Create a task streaming a file through the board's serial interface.
pub fn send_file(board: &Arc<Board>, filename: &str) -> Result<Arc<Task>> {
    let file = std::fs::File::open(filename).map_err(|err| {
        report(match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("File '{}' does not exist", filename)),
            std::io::ErrorKind::PermissionDenied => {
                Error::Access(format!("Permission denied for '{}'", filename))
            }
            _ => Error::System(format!("Failed to open '{}': {}", filename, err)),
        })
    })?;

    let size = file
        .metadata()
        .map_err(|err| report(Error::System(format!("Failed to stat '{}': {}", filename, err))))?
        .len();
    if size == 0 {
        return Err(report(Error::Unsupported(format!(
            "Failed to read size of '{}', is it a regular file?",
            filename
        ))));
    }

    let board = board.clone();
    let filename = filename.to_string();
    new_board_task(&board.clone(), "send", move |_task| {
        run_send_file(&board, &filename, file, size)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pjrc::teensyboot::class::generic::GenericClass;
    use crate::pjrc::teensyboot::device::sim::SimBus;
    use crate::pjrc::teensyboot::device::{DeviceBus, DeviceType};

    fn test_board(id: &str, location: &str, iface_paths: &[&str]) -> Arc<Board> {
        let (bus, _handle) = SimBus::new();
        let shared = MonitorShared::new_for_tests();
        let board = Board::new(location, 0x16C0, 0x0483, shared);

        {
            let mut st = board.state.lock().unwrap();
            st.id = id.to_string();
            for path in iface_paths {
                let dev = Arc::new(Device {
                    location: location.to_string(),
                    path: path.to_string(),
                    vid: 0x16C0,
                    pid: 0x0483,
                    dev_type: DeviceType::Serial,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                    usage_page: 0,
                    usage: 0,
                    bcd_device: 0,
                    iface_number: 0,
                });
                st.ifaces.push(Interface::new(
                    &GenericClass,
                    dev,
                    "Serial",
                    Capabilities::SERIAL,
                    Model::Generic,
                    bus.opener(),
                ));
            }
        }

        board
    }

    #[test]
    fn tag_matching_follows_the_grammar() {
        let board = test_board("1234567890-Teensy", "/dev/teensy42", &["/dev/ttyACM0"]);

        assert!(board.matches_tag("1234567890"));
        assert!(board.matches_tag("1234567890-Teensy"));
        assert!(board.matches_tag("@/dev/ttyACM0"));
        assert!(!board.matches_tag("@/dev/ttyACM1"));
        assert!(!board.matches_tag("9999"));
        assert!(board.matches_tag("-Teensy@/dev/teensy42"));
    }

    #[test]
    fn empty_parts_match_anything() {
        let board = test_board("1234567890-Teensy", "/dev/teensy42", &[]);

        assert!(board.matches_tag(""));
        assert!(board.matches_tag("-"));
        assert!(board.matches_tag("-Teensy"));
        assert!(!board.matches_tag("-Generic"));
    }

    #[test]
    fn explicit_tag_short_circuits() {
        let board = test_board("1234567890-Teensy", "/dev/teensy42", &[]);
        board.set_tag(Some("bench"));

        assert!(board.matches_tag("bench"));
        assert!(board.matches_tag("1234567890"));
        assert!(!board.matches_tag("workbench"));
    }

    #[test]
    fn busy_board_rejects_second_task() {
        let board = test_board("1-Teensy", "/dev/teensy1", &[]);

        let _task = new_board_task(&board, "upload", |_task| Ok(())).unwrap();
        let err = new_board_task(&board, "reset", |_task| Ok(())).unwrap_err();
        assert_eq!(err.kind(), crate::pjrc::teensyboot::ErrorKind::Busy);
        assert!(err.to_string().contains("upload@1-Teensy"));
    }

    #[test]
    fn model_list_uses_natural_join() {
        assert_eq!(model_list(&[Model::Teensy31]), "Teensy 3.1");
        assert_eq!(model_list(&[Model::Teensy31, Model::Teensy32]), "Teensy 3.1 and Teensy 3.2");
        assert_eq!(
            model_list(&[Model::Teensy30, Model::Teensy31, Model::Teensy32]),
            "Teensy 3.0, Teensy 3.1 and Teensy 3.2"
        );
    }
}
