use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::pjrc::teensyboot::board::{BoardState, Interface};
use crate::pjrc::teensyboot::class::{Capabilities, DeviceClass, InterfaceDetails};
use crate::pjrc::teensyboot::device::{Device, DevicePort, DeviceType};
use crate::pjrc::teensyboot::firmware::Firmware;
use crate::pjrc::teensyboot::message::{self, report, LogLevel};
use crate::pjrc::teensyboot::model::Model;
use crate::pjrc::teensyboot::{Error, ErrorKind, Result};

const USAGE_PAGE_BOOTLOADER: u16 = 0xFF9C;
const USAGE_PAGE_RAWHID: u16 = 0xFFAB;
const USAGE_PAGE_SEREMU: u16 = 0xFFC9;

const SEREMU_TX_SIZE: usize = 32;
const SEREMU_RX_SIZE: usize = 64;

const SERIAL_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Baud rate which makes a running Teensy jump into HalfKay.
const REBOOT_BAUD_RATE: u32 = 134;
const SANE_BAUD_RATE: u32 = 115200;

const SEREMU_REBOOT_REPORT: [u8; 5] = [0x00, 0xA9, 0x45, 0xC2, 0x6B];

const HALFKAY_BLOCK_TIMEOUT: Duration = Duration::from_millis(3000);
const HALFKAY_RESET_TIMEOUT: Duration = Duration::from_millis(250);
const HALFKAY_RETRY_DELAY: Duration = Duration::from_millis(20);
/// The first write erases the whole flash, give the bootloader time to finish.
const HALFKAY_ERASE_DELAY: Duration = Duration::from_millis(200);

/// AVR Teensy boards ship with this serial number, it identifies nothing.
const AVR_DEFAULT_SERIAL: u64 = 12345;

// Model identification ---------------------------------------------------------------------------

fn identify_model_halfkay(usage: u16) -> Option<Model> {
    let model = match usage {
        0x1A => Model::TeensyPp10,
        0x1B => Model::Teensy20,
        0x1C => Model::TeensyPp20,
        0x1D => Model::Teensy30,
        0x1E => Model::Teensy31,
        0x20 => Model::TeensyLc,
        0x21 => Model::Teensy32,
        0x1F => Model::Teensy35,
        0x22 => Model::Teensy36,
        0x23 => Model::Teensy40Beta1,
        0x24 => Model::Teensy40,
        _ => {
            message::log(
                LogLevel::Debug,
                &format!("Unknown Teensy model with usage value {:#x}", usage),
            );
            return None;
        }
    };

    message::log(
        LogLevel::Debug,
        &format!("Identified '{}' with usage value {:#x}", model.name(), usage),
    );
    Some(model)
}

fn identify_model_bcd(bcd_device: u16) -> Option<Model> {
    let model = match bcd_device {
        0x274 => Model::Teensy30,
        0x275 => Model::Teensy31,
        0x273 => Model::TeensyLc,
        0x276 => Model::Teensy35,
        0x277 => Model::Teensy36,
        0x278 => Model::Teensy40Beta1,
        0x279 => Model::Teensy40,
        _ => {
            message::log(
                LogLevel::Debug,
                &format!("Unknown Teensy model with bcdDevice value {:#x}", bcd_device),
            );
            return None;
        }
    };

    message::log(
        LogLevel::Debug,
        &format!("Identified '{}' with bcdDevice value {:#x}", model.name(), bcd_device),
    );
    Some(model)
}

// Serial numbers ---------------------------------------------------------------------------------

/// Parse the leading digits of `s` in the given radix, like strtoull.
fn parse_number_prefix(s: &str, radix: u32) -> u64 {
    let digits: String = s.chars().take_while(|ch| ch.is_digit(radix)).collect();
    u64::from_str_radix(&digits, radix).unwrap_or(0)
}

///
/// Canonicalize a HalfKay serial number string.
///
/// The bootloader reports the serial as zero-prefixed hexadecimal. Running firmware uses
/// decimal, and Teensyduino 1.19 added a trailing zero to work around a Mac OS X CDC-ADM
/// driver bug, so small bootloader values get the same treatment here. Beta K66 boards
/// without a programmed serial report 100, which identifies nothing.
///
fn parse_bootloader_serial_number(serial: Option<&str>) -> u64 {
    // AVR Teensy boards (1.0 and 2.0) report no serial number at all
    let serial = match serial {
        Some(serial) => serial,
        None => return AVR_DEFAULT_SERIAL,
    };

    let value = parse_number_prefix(serial, 16);
    if value == 100 {
        0
    } else if value < 10_000_000 {
        value * 10
    } else {
        value
    }
}

// HalfKay upload protocol ------------------------------------------------------------------------

#[derive(Debug)]
struct HalfKaySettings {
    version: u8,
    block_size: usize,
    min_address: u32,
    max_address: u32,
}

fn experimental_boards_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("HALFKAY_EXPERIMENTAL_BOARDS").is_some())
}

fn halfkay_settings(model: Model) -> Result<HalfKaySettings> {
    if matches!(model, Model::TeensyPp10 | Model::Teensy20) && !experimental_boards_enabled() {
        return Err(report(Error::Unsupported(format!(
            "Support for {} boards is experimental, set environment variable \
             HALFKAY_EXPERIMENTAL_BOARDS to any value to enable upload",
            model.name()
        ))));
    }

    let (version, block_size, min_address, max_address) = match model {
        Model::TeensyPp10 => (1, 256, 0, 0xFC00),
        Model::Teensy20 => (1, 128, 0, 0x7E00),
        Model::TeensyPp20 => (2, 256, 0, 0x1FC00),
        Model::Teensy30 => (3, 1024, 0, 0x20000),
        Model::Teensy31 | Model::Teensy32 => (3, 1024, 0, 0x40000),
        Model::Teensy35 => (3, 1024, 0, 0x80000),
        Model::Teensy36 => (3, 1024, 0, 0x100000),
        Model::TeensyLc => (3, 512, 0, 0xF800),
        Model::Teensy40Beta1 | Model::Teensy40 => (3, 1024, 0x60000000, 0x60180000),
        Model::Generic | Model::Teensy => {
            return Err(report(Error::Unsupported(
                "Cannot use HalfKay with an unidentified model".to_string(),
            )))
        }
    };

    Ok(HalfKaySettings {
        version,
        block_size,
        min_address,
        max_address,
    })
}

/// Build one HalfKay output report, report id included at byte 0.
fn halfkay_frame(version: u8, block_size: usize, addr: u32, data: &[u8]) -> Vec<u8> {
    match version {
        1 => {
            let mut buf = vec![0; block_size + 3];
            buf[1] = (addr & 0xFF) as u8;
            buf[2] = ((addr >> 8) & 0xFF) as u8;
            buf[3..3 + data.len()].copy_from_slice(data);
            buf
        }
        2 => {
            let mut buf = vec![0; block_size + 3];
            buf[1] = ((addr >> 8) & 0xFF) as u8;
            buf[2] = ((addr >> 16) & 0xFF) as u8;
            buf[3..3 + data.len()].copy_from_slice(data);
            buf
        }
        3 => {
            let mut buf = vec![0; block_size + 65];
            buf[1] = (addr & 0xFF) as u8;
            buf[2] = ((addr >> 8) & 0xFF) as u8;
            buf[3] = ((addr >> 16) & 0xFF) as u8;
            buf[65..65 + data.len()].copy_from_slice(data);
            buf
        }
        _ => unreachable!("unknown HalfKay version"),
    }
}

///
/// Send one HalfKay frame, retrying transient I/O errors until the timeout.
///
/// HalfKay stalls the endpoint when pushed too fast (EPIPE on Linux) and the handle may
/// be invalidated mid-erase, so I/O errors here are usually transient.
///
fn halfkay_send(
    port: &mut dyn DevicePort,
    version: u8,
    block_size: usize,
    addr: u32,
    data: &[u8],
    timeout: Duration,
) -> Result<()> {
    let buf = halfkay_frame(version, block_size, addr, data);

    let start = Instant::now();
    let result = {
        let _mask = message::mask(ErrorKind::Io);
        loop {
            match port.hid_write(&buf) {
                Ok(_) => break Ok(()),
                Err(err) if err.kind() == ErrorKind::Io && start.elapsed() < timeout => {
                    std::thread::sleep(HALFKAY_RETRY_DELAY);
                }
                Err(err) => break Err(err),
            }
        }
    };
    result.map_err(|err| report(err))?;

    if addr == 0 {
        std::thread::sleep(HALFKAY_ERASE_DELAY);
    }

    Ok(())
}

// Class ------------------------------------------------------------------------------------------

///
/// Teensy family class.
///
/// Recognizes the HalfKay bootloader, RawHID and Seremu HID interfaces by usage page and
/// the USB serial interface, and implements HalfKay flashing plus the reboot tricks.
///
pub struct TeensyClass;

impl DeviceClass for TeensyClass {
    fn name(&self) -> &'static str {
        "Teensy"
    }

    fn load_interface(&self, dev: &Device) -> Result<Option<InterfaceDetails>> {
        let mut model = None;

        let (name, capabilities) = match dev.dev_type {
            DeviceType::Serial => (
                "Serial",
                Capabilities::RUN | Capabilities::SERIAL | Capabilities::REBOOT,
            ),
            DeviceType::Hid => match dev.usage_page {
                USAGE_PAGE_BOOTLOADER => {
                    model = identify_model_halfkay(dev.usage);
                    let capabilities = if model.is_some() {
                        Capabilities::UPLOAD | Capabilities::RESET
                    } else {
                        Capabilities::empty()
                    };
                    ("HalfKay", capabilities)
                }
                USAGE_PAGE_RAWHID => ("RawHID", Capabilities::RUN),
                USAGE_PAGE_SEREMU => (
                    "Seremu",
                    Capabilities::RUN | Capabilities::SERIAL | Capabilities::REBOOT,
                ),
                _ => return Ok(None),
            },
        };

        let model = model
            .or_else(|| identify_model_bcd(dev.bcd_device))
            .unwrap_or(Model::Teensy);

        Ok(Some(InterfaceDetails {
            name,
            capabilities,
            model,
        }))
    }

    fn update_board(&self, iface: &Interface, state: &mut BoardState, new_board: bool) -> Result<bool> {
        let dev = iface.device();
        let is_bootloader = iface.capabilities().contains(Capabilities::UPLOAD);

        // Check the board model against what this interface reports
        let mut new_model = None;
        if iface.model() != Model::Teensy {
            let model = iface.model();

            if state.model == Model::Teensy31 && model == Model::Teensy32 && is_bootloader {
                // The bcdDevice method detects Teensy 3.2 as 3.1, the bootloader knows better
                new_model = Some(model);
            } else if state.model == Model::Teensy32 && model == Model::Teensy31 && !is_bootloader {
                // Same mismatch the other way around, keep the bootloader information
            } else if !new_board && state.model != Model::Teensy && state.model != model {
                return Ok(false);
            } else {
                new_model = Some(model);
            }
        } else if state.model == Model::Generic {
            new_model = Some(Model::Teensy);
        }

        // Check and canonicalize the serial number
        let mut new_serial = None;
        if dev.serial_number.is_some() || is_bootloader {
            let serial_value = if is_bootloader {
                parse_bootloader_serial_number(dev.serial_number.as_deref())
            } else {
                parse_number_prefix(dev.serial_number.as_deref().unwrap_or(""), 10)
            };

            if serial_value != 0 {
                /* AVR Teensy boards always report 12345 and custom ARM boards without a
                   valid MAC address have nothing unique either. */
                if serial_value != AVR_DEFAULT_SERIAL {
                    iface.add_capabilities(Capabilities::UNIQUE);
                }

                let serial_number = serial_value.to_string();
                if let Some(board_serial) = &state.serial_number {
                    if *board_serial != serial_number {
                        let board_value = parse_number_prefix(board_serial, 10);

                        /* Boards running a pre-1.19 Teensyduino firmware report the serial
                           without the trailing zero the bootloader adds, there is no way
                           to tell the two encodings apart. Tolerate the x10 mismatch in
                           both directions instead of treating it as a different board. */
                        if is_bootloader && serial_value == board_value * 10 {
                            message::log(
                                LogLevel::Warning,
                                &format!("Upgrade board '{}' with recent Teensyduino version", state.tag()),
                            );
                            new_serial = Some(serial_number);
                        } else if !is_bootloader && serial_value * 10 == board_value {
                            message::log(
                                LogLevel::Warning,
                                &format!("Upgrade board '{}' with recent Teensyduino version", state.tag()),
                            );
                            // Keep the bootloader value
                        } else {
                            return Ok(false);
                        }
                    } else {
                        new_serial = Some(serial_number);
                    }
                } else {
                    new_serial = Some(serial_number);
                }
            }
        }

        // Refresh the description
        let mut new_description = None;
        if is_bootloader {
            if state.description.is_none() {
                new_description = Some("HalfKay".to_string());
            }
        } else {
            let product = dev.product.as_deref().unwrap_or("Teensy");
            if state.description.as_deref() != Some(product) {
                new_description = Some(product.to_string());
            }
        }

        // Everything is alright, we can commit the changes
        if let Some(model) = new_model {
            state.model = model;
        }
        if let Some(serial) = &new_serial {
            state.serial_number = Some(serial.clone());
        }
        if let Some(description) = new_description {
            state.description = Some(description);
        }
        if state.id.is_empty() || new_serial.is_some() {
            state.id = format!("{}-Teensy", new_serial.as_deref().unwrap_or("?"));
        }

        Ok(true)
    }

    fn identify_models(&self, fw: &Firmware, max_models: usize) -> Vec<Model> {
        let mut models = Vec::new();
        if max_models == 0 {
            return models;
        }

        // Teensy 4.0 images carry the FlexSPI configuration block magic
        if let Some(segment) = fw.find_segment(0x60000000) {
            if segment.data.len() >= 8 && read_u64_le(&segment.data[0..8]) == 0x5601000042464346 {
                models.push(Model::Teensy40);
                if max_models >= 2 {
                    models.push(Model::Teensy40Beta1);
                }
                return models;
            }
        }

        /* ARM MK models are told apart by the initial stack pointer (the end of the RAM
           address space) combined with the size of the flash vector table. When the reset
           handler was moved out of the startup section (LTO builds), the vector table end
           is found by looking for the 0xFF filler run instead. */
        if let Some(segment) = fw.find_segment(0) {
            const STARTUP_SIZE: usize = 0x400;

            if segment.data.len() >= STARTUP_SIZE {
                let stack_addr = read_u32_le(&segment.data[0..4]);
                let mut end_vector_addr = read_u32_le(&segment.data[4..8]) & !1;

                if end_vector_addr as usize >= STARTUP_SIZE {
                    let mut i = 0;
                    while i < STARTUP_SIZE - 8 {
                        if read_u64_le(&segment.data[i..i + 8]) == u64::MAX {
                            end_vector_addr = i as u32;
                            break;
                        }
                        i += 4;
                    }
                }

                match ((stack_addr as u64) << 32) | end_vector_addr as u64 {
                    0x20002000_000000F8 => models.push(Model::Teensy30),
                    0x20008000_000001BC => {
                        models.push(Model::Teensy31);
                        if max_models >= 2 {
                            // Teensy 3.1 and 3.2 firmwares are identical
                            models.push(Model::Teensy32);
                        }
                    }
                    0x20001800_000000C0 => models.push(Model::TeensyLc),
                    0x20020000_00000198 | 0x2002FFFC_00000198 | 0x2002FFF8_00000198 => {
                        models.push(Model::Teensy35)
                    }
                    0x20030000_000001D0 => models.push(Model::Teensy36),
                    _ => {}
                }
                if !models.is_empty() {
                    return models;
                }
            }
        }

        /* AVR Teensies are recognized by the model-specific machine code of
           _reboot_Teensyduino_(). Not elegant, but it does the work. */
        if fw.max_address() <= 130048 {
            for segment in fw.segments() {
                if segment.data.len() < 8 {
                    continue;
                }

                for window in 0..segment.data.len() - 8 {
                    let value = read_u64_le(&segment.data[window..window + 8]);
                    match value {
                        0x94F8CFFF7E00940C => return vec![Model::TeensyPp10],
                        0x94F8CFFF3F00940C => return vec![Model::Teensy20],
                        0x94F8CFFFFE00940C => return vec![Model::TeensyPp20],
                        _ => {}
                    }
                }
            }
        }

        models
    }

    fn open_interface(&self, iface: &Interface) -> Result<Box<dyn DevicePort>> {
        let mut port = iface.opener().open(iface.device())?;

        /* Restore a sane baud rate, some systems (such as Linux) keep tty settings around
           and reuse them. The device keeps rebooting if 134 is what stays around. */
        if iface.device().dev_type == DeviceType::Serial {
            let _ = port.set_baud_rate(SANE_BAUD_RATE);
        }

        Ok(port)
    }

    fn serial_read(&self, iface: &Interface, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let port = iface.port()?;
        let mut port = port.lock().unwrap();

        match iface.device().dev_type {
            DeviceType::Serial => port.read(buf, timeout),

            DeviceType::Hid => {
                let mut hid_buf = [0u8; SEREMU_RX_SIZE + 1];
                let len = port.read(&mut hid_buf, timeout)?;
                if len < 2 {
                    return Ok(0);
                }

                // Seremu pads reports with NULs, only the prefix is real data
                let payload = &hid_buf[1..len];
                let len = payload.iter().position(|byte| *byte == 0).unwrap_or(payload.len());
                let len = len.min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok(len)
            }
        }
    }

    fn serial_write(&self, iface: &Interface, buf: &[u8]) -> Result<usize> {
        let port = iface.port()?;
        let mut port = port.lock().unwrap();

        match iface.device().dev_type {
            DeviceType::Serial => {
                let sent = port.write(buf, Some(SERIAL_WRITE_TIMEOUT))?;
                if sent == 0 {
                    return Err(report(Error::Io(format!(
                        "Timed out while writing to '{}'",
                        iface.path()
                    ))));
                }
                Ok(sent)
            }

            DeviceType::Hid => {
                /* Seremu expects reports of 32 bytes. The terminating NUL marks the end,
                   so no binary transfers. */
                let mut report_buf = [0u8; SEREMU_TX_SIZE + 1];
                let mut total = 0;

                for chunk in buf.chunks(SEREMU_TX_SIZE) {
                    report_buf.fill(0);
                    report_buf[1..1 + chunk.len()].copy_from_slice(chunk);

                    let sent = port.hid_write(&report_buf)?;
                    if sent == 0 {
                        break;
                    }
                    total += chunk.len();
                }

                Ok(total)
            }
        }
    }

    fn upload(
        &self,
        iface: &Interface,
        fw: &Firmware,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let settings = halfkay_settings(iface.model())?;

        if fw.max_address() > settings.max_address {
            return Err(report(Error::Range(format!(
                "Firmware is too big for {}",
                iface.model().name()
            ))));
        }

        let flash_size = (settings.max_address - settings.min_address) as usize;
        progress(0, flash_size);

        let port = iface.port()?;
        let mut port = port.lock().unwrap();

        let mut uploaded = 0;
        let mut block = vec![0u8; settings.block_size];
        let mut address = settings.min_address;
        while address < fw.max_address() {
            block.fill(0);
            let used = fw.extract(address, &mut block);

            if used > 0 {
                halfkay_send(
                    port.as_mut(),
                    settings.version,
                    settings.block_size,
                    address,
                    &block[..used],
                    HALFKAY_BLOCK_TIMEOUT,
                )?;

                uploaded += used;
                progress(uploaded, flash_size);
            }

            address += settings.block_size as u32;
        }

        Ok(())
    }

    fn reset(&self, iface: &Interface) -> Result<()> {
        let settings = halfkay_settings(iface.model())?;

        let port = iface.port()?;
        let mut port = port.lock().unwrap();

        halfkay_send(
            port.as_mut(),
            settings.version,
            settings.block_size,
            0xFFFFFF,
            &[],
            HALFKAY_RESET_TIMEOUT,
        )
    }

    fn reboot(&self, iface: &Interface) -> Result<()> {
        let port = iface.port()?;
        let mut port = port.lock().unwrap();

        match iface.device().dev_type {
            DeviceType::Serial => {
                port.set_baud_rate(REBOOT_BAUD_RATE)?;

                /* Don't keep these settings, some systems (such as Linux) may reuse them
                   and the device will keep rebooting when opened. */
                let _mask = message::mask(ErrorKind::System);
                let _ = port.set_baud_rate(SANE_BAUD_RATE);
                Ok(())
            }

            DeviceType::Hid => {
                port.send_feature_report(&SEREMU_REBOOT_REPORT)?;
                Ok(())
            }
        }
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pjrc::teensyboot::board::Board;
    use crate::pjrc::teensyboot::device::sim::SimBus;
    use crate::pjrc::teensyboot::device::DeviceBus;
    use crate::pjrc::teensyboot::monitor::MonitorShared;
    use std::sync::Arc;

    fn teensy_device(dev_type: DeviceType, usage_page: u16, usage: u16, serial: Option<&str>) -> Device {
        Device {
            location: "usb-1-4".to_string(),
            path: "/dev/test0".to_string(),
            vid: 0x16C0,
            pid: 0x0483,
            dev_type,
            serial_number: serial.map(str::to_string),
            manufacturer: Some("Teensyduino".to_string()),
            product: Some("USB Serial".to_string()),
            usage_page,
            usage,
            bcd_device: 0x0275,
            iface_number: 0,
        }
    }

    fn make_iface(dev: Device) -> Arc<Interface> {
        let (bus, _handle) = SimBus::new();
        let dev = Arc::new(dev);
        let details = TeensyClass.load_interface(&dev).unwrap().unwrap();
        Interface::new(
            &TeensyClass,
            dev,
            details.name,
            details.capabilities,
            details.model,
            bus.opener(),
        )
    }

    fn make_board() -> Arc<Board> {
        Board::new("usb-1-4", 0x16C0, 0x0483, MonitorShared::new_for_tests())
    }

    #[test]
    fn halfkay_usage_maps_to_models() {
        assert_eq!(identify_model_halfkay(0x1A), Some(Model::TeensyPp10));
        assert_eq!(identify_model_halfkay(0x1D), Some(Model::Teensy30));
        assert_eq!(identify_model_halfkay(0x21), Some(Model::Teensy32));
        assert_eq!(identify_model_halfkay(0x1F), Some(Model::Teensy35));
        assert_eq!(identify_model_halfkay(0x24), Some(Model::Teensy40));
        assert_eq!(identify_model_halfkay(0x42), None);
    }

    #[test]
    fn bcd_device_fallback_maps_to_models() {
        assert_eq!(identify_model_bcd(0x274), Some(Model::Teensy30));
        assert_eq!(identify_model_bcd(0x275), Some(Model::Teensy31));
        assert_eq!(identify_model_bcd(0x273), Some(Model::TeensyLc));
        assert_eq!(identify_model_bcd(0x279), Some(Model::Teensy40));
        assert_eq!(identify_model_bcd(0x1234), None);
    }

    #[test]
    fn bootloader_serial_is_hex_with_workarounds() {
        // Hex parse plus the Teensyduino 1.19 trailing zero
        assert_eq!(parse_bootloader_serial_number(Some("0000007B")), 1230);
        // Unprogrammed beta K66 boards
        assert_eq!(parse_bootloader_serial_number(Some("00000064")), 0);
        // Large values pass through
        assert_eq!(parse_bootloader_serial_number(Some("00989680")), 10_000_000);
        // AVR boards have no serial at all
        assert_eq!(parse_bootloader_serial_number(None), AVR_DEFAULT_SERIAL);
    }

    #[test]
    fn serial_interface_is_loaded_with_runtime_capabilities() {
        let dev = teensy_device(DeviceType::Serial, 0, 0, Some("1230"));
        let details = TeensyClass.load_interface(&dev).unwrap().unwrap();

        assert_eq!(details.name, "Serial");
        assert_eq!(
            details.capabilities,
            Capabilities::RUN | Capabilities::SERIAL | Capabilities::REBOOT
        );
        // bcdDevice 0x275
        assert_eq!(details.model, Model::Teensy31);
    }

    #[test]
    fn bootloader_interface_is_loaded_with_upload_capabilities() {
        let mut dev = teensy_device(DeviceType::Hid, USAGE_PAGE_BOOTLOADER, 0x21, Some("0000007B"));
        dev.pid = 0x0478;
        let details = TeensyClass.load_interface(&dev).unwrap().unwrap();

        assert_eq!(details.name, "HalfKay");
        assert_eq!(details.capabilities, Capabilities::UPLOAD | Capabilities::RESET);
        assert_eq!(details.model, Model::Teensy32);
    }

    #[test]
    fn unknown_usage_page_is_ignored() {
        let dev = teensy_device(DeviceType::Hid, 0xFF00, 0x01, None);
        assert!(TeensyClass.load_interface(&dev).unwrap().is_none());
    }

    #[test]
    fn update_board_commits_identity() {
        let iface = make_iface(teensy_device(DeviceType::Serial, 0, 0, Some("1230")));
        let board = make_board();
        let mut st = board.state.lock().unwrap();

        assert!(TeensyClass.update_board(&iface, &mut st, true).unwrap());
        assert_eq!(st.model, Model::Teensy31);
        assert_eq!(st.serial_number.as_deref(), Some("1230"));
        assert_eq!(st.description.as_deref(), Some("USB Serial"));
        assert_eq!(st.id, "1230-Teensy");
        assert!(iface.capabilities().contains(Capabilities::UNIQUE));
    }

    #[test]
    fn avr_default_serial_is_not_unique() {
        // AVR bootloaders report no serial string, which stands for the 12345 default
        let mut dev = teensy_device(DeviceType::Hid, USAGE_PAGE_BOOTLOADER, 0x1B, None);
        dev.bcd_device = 0;
        let iface = make_iface(dev);
        let board = make_board();
        let mut st = board.state.lock().unwrap();

        assert!(TeensyClass.update_board(&iface, &mut st, true).unwrap());
        assert_eq!(st.serial_number.as_deref(), Some("12345"));
        assert!(!iface.capabilities().contains(Capabilities::UNIQUE));
        assert_eq!(st.id, "12345-Teensy");
    }

    #[test]
    fn bootloader_model_is_authoritative_over_bcd() {
        let board = make_board();

        // Runtime interface detected 3.1 via bcdDevice
        let runtime = make_iface(teensy_device(DeviceType::Serial, 0, 0, Some("1230")));
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&runtime, &mut st, true).unwrap());
            assert_eq!(st.model, Model::Teensy31);
        }

        // The bootloader shows up and knows it is a 3.2
        let bootloader = make_iface(teensy_device(
            DeviceType::Hid,
            USAGE_PAGE_BOOTLOADER,
            0x21,
            Some("0000007B"),
        ));
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&bootloader, &mut st, false).unwrap());
            assert_eq!(st.model, Model::Teensy32);
        }

        // A runtime interface reporting 3.1 again must not downgrade the model
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&runtime, &mut st, false).unwrap());
            assert_eq!(st.model, Model::Teensy32);
        }
    }

    #[test]
    fn incompatible_model_is_rejected() {
        let board = make_board();

        let t30 = make_iface({
            let mut dev = teensy_device(DeviceType::Hid, USAGE_PAGE_BOOTLOADER, 0x1D, Some("0001E240"));
            dev.bcd_device = 0;
            dev
        });
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&t30, &mut st, true).unwrap());
            assert_eq!(st.model, Model::Teensy30);
        }

        let t36 = make_iface({
            let mut dev = teensy_device(DeviceType::Hid, USAGE_PAGE_BOOTLOADER, 0x22, Some("0001E240"));
            dev.bcd_device = 0;
            dev
        });
        {
            let mut st = board.state.lock().unwrap();
            assert!(!TeensyClass.update_board(&t36, &mut st, false).unwrap());
        }
    }

    #[test]
    fn legacy_serial_mismatch_is_tolerated() {
        let board = make_board();

        // Pre-1.19 firmware reports the bare value
        let runtime = make_iface({
            let mut dev = teensy_device(DeviceType::Serial, 0, 0, Some("123"));
            dev.bcd_device = 0x275;
            dev
        });
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&runtime, &mut st, true).unwrap());
            assert_eq!(st.serial_number.as_deref(), Some("123"));
        }

        // The bootloader appends the zero: accept with a warning, adopt the new value
        let bootloader = make_iface(teensy_device(
            DeviceType::Hid,
            USAGE_PAGE_BOOTLOADER,
            0x1E,
            Some("0000007B"),
        ));
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&bootloader, &mut st, false).unwrap());
            assert_eq!(st.serial_number.as_deref(), Some("1230"));
            assert_eq!(st.id, "1230-Teensy");
        }

        // And the runtime value keeps matching afterwards
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&runtime, &mut st, false).unwrap());
            assert_eq!(st.serial_number.as_deref(), Some("1230"));
        }
    }

    #[test]
    fn different_serial_is_a_different_board() {
        let board = make_board();

        let first = make_iface(teensy_device(DeviceType::Serial, 0, 0, Some("1230")));
        {
            let mut st = board.state.lock().unwrap();
            assert!(TeensyClass.update_board(&first, &mut st, true).unwrap());
        }

        let second = make_iface(teensy_device(DeviceType::Serial, 0, 0, Some("5550")));
        {
            let mut st = board.state.lock().unwrap();
            assert!(!TeensyClass.update_board(&second, &mut st, false).unwrap());
        }
    }

    #[test]
    fn halfkay_v1_frame_layout() {
        let frame = halfkay_frame(1, 128, 0x1A80, &[0xAB; 16]);

        assert_eq!(frame.len(), 131);
        assert_eq!(frame[0], 0); // report id
        assert_eq!(frame[1], 0x80);
        assert_eq!(frame[2], 0x1A);
        assert_eq!(frame[3], 0xAB);
        assert_eq!(frame[19], 0);
    }

    #[test]
    fn halfkay_v2_frame_uses_page_address() {
        let frame = halfkay_frame(2, 256, 0x1FC00, &[0xCD; 4]);

        assert_eq!(frame.len(), 259);
        assert_eq!(frame[1], 0xFC);
        assert_eq!(frame[2], 0x01);
        assert_eq!(frame[3], 0xCD);
    }

    #[test]
    fn halfkay_v3_frame_has_long_header() {
        let frame = halfkay_frame(3, 1024, 0x60012345, &[0xEF; 8]);

        assert_eq!(frame.len(), 1089);
        assert_eq!(frame[1], 0x45);
        assert_eq!(frame[2], 0x23);
        assert_eq!(frame[3], 0x01);
        assert_eq!(frame[64], 0);
        assert_eq!(frame[65], 0xEF);
    }

    #[test]
    fn halfkay_settings_match_the_models() {
        let settings = halfkay_settings(Model::Teensy32).unwrap();
        assert_eq!(settings.version, 3);
        assert_eq!(settings.block_size, 1024);
        assert_eq!(settings.max_address, 0x40000);

        let settings = halfkay_settings(Model::TeensyLc).unwrap();
        assert_eq!(settings.block_size, 512);
        assert_eq!(settings.max_address, 0xF800);

        let settings = halfkay_settings(Model::Teensy40).unwrap();
        assert_eq!(settings.min_address, 0x60000000);
        assert_eq!(settings.max_address, 0x60180000);

        assert!(halfkay_settings(Model::Teensy).is_err());
    }

    #[test]
    fn experimental_models_are_gated_for_upload() {
        if std::env::var_os("HALFKAY_EXPERIMENTAL_BOARDS").is_none() {
            let err = halfkay_settings(Model::Teensy20).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unsupported);
        }
    }

    // Firmware identification ------------------------------------------------------------

    fn arm_firmware(stack_addr: u32, end_vector_addr: u32) -> Arc<Firmware> {
        let mut data = vec![0xFF; 0x400];
        data[0..4].copy_from_slice(&stack_addr.to_le_bytes());
        data[4..8].copy_from_slice(&(end_vector_addr | 1).to_le_bytes());
        // Fake vectors so the 0xFF filler scan does not trigger early
        for i in (8..end_vector_addr as usize).step_by(4) {
            data[i..i + 4].copy_from_slice(&0x0000_04C1u32.to_le_bytes());
        }

        firmware_from_segments(&[(0, &data)])
    }

    fn firmware_from_segments(segments: &[(u32, &[u8])]) -> Arc<Firmware> {
        // Assemble through the IHEX loader to stay on the public path
        let mut hex = String::new();
        for (address, data) in segments {
            if *address > 0xFFFF {
                let upper = (address >> 16) as u16;
                let sum = 2u32 + 4 + (upper >> 8) as u32 + (upper & 0xFF) as u32;
                hex.push_str(&format!(
                    ":02000004{:04X}{:02X}\n",
                    upper,
                    (0x100 - (sum & 0xFF)) & 0xFF
                ));
            }
            for (i, chunk) in data.chunks(16).enumerate() {
                let offset = (address & 0xFFFF) as u32 + (i as u32) * 16;
                let mut sum = chunk.len() as u32 + (offset >> 8 & 0xFF) + (offset & 0xFF);
                let mut line = format!(":{:02X}{:04X}00", chunk.len(), offset);
                for byte in chunk {
                    line.push_str(&format!("{:02X}", byte));
                    sum += *byte as u32;
                }
                line.push_str(&format!("{:02X}\n", (0x100 - (sum & 0xFF)) & 0xFF));
                hex.push_str(&line);
            }
        }
        hex.push_str(":00000001FF\n");

        Firmware::load_mem("test.hex", hex.as_bytes(), None).unwrap()
    }

    #[test]
    fn teensy32_image_identifies_as_31_and_32() {
        let fw = arm_firmware(0x20008000, 0x1BC);

        assert_eq!(
            TeensyClass.identify_models(&fw, 16),
            vec![Model::Teensy31, Model::Teensy32]
        );
        assert_eq!(TeensyClass.identify_models(&fw, 1), vec![Model::Teensy31]);
    }

    #[test]
    fn other_arm_models_identify_uniquely() {
        assert_eq!(
            TeensyClass.identify_models(&arm_firmware(0x20002000, 0xF8), 16),
            vec![Model::Teensy30]
        );
        assert_eq!(
            TeensyClass.identify_models(&arm_firmware(0x20001800, 0xC0), 16),
            vec![Model::TeensyLc]
        );
        assert_eq!(
            TeensyClass.identify_models(&arm_firmware(0x2002FFF8, 0x198), 16),
            vec![Model::Teensy35]
        );
        assert_eq!(
            TeensyClass.identify_models(&arm_firmware(0x20030000, 0x1D0), 16),
            vec![Model::Teensy36]
        );
    }

    #[test]
    fn imxrt_flash_config_identifies_teensy_40() {
        let mut data = vec![0u8; 64];
        data[0..8].copy_from_slice(&0x5601000042464346u64.to_le_bytes());
        let fw = firmware_from_segments(&[(0x60000000, &data)]);

        assert_eq!(
            TeensyClass.identify_models(&fw, 16),
            vec![Model::Teensy40, Model::Teensy40Beta1]
        );
        assert_eq!(TeensyClass.identify_models(&fw, 1), vec![Model::Teensy40]);
    }

    #[test]
    fn avr_reboot_code_identifies_the_model() {
        let mut data = vec![0u8; 256];
        data[100..108].copy_from_slice(&0x94F8CFFF3F00940Cu64.to_le_bytes());
        let fw = firmware_from_segments(&[(0, &data)]);

        assert_eq!(TeensyClass.identify_models(&fw, 16), vec![Model::Teensy20]);
    }

    #[test]
    fn unrecognized_image_identifies_nothing() {
        let data = vec![0x42u8; 64];
        let fw = firmware_from_segments(&[(0x8000, &data)]);

        assert!(TeensyClass.identify_models(&fw, 16).is_empty());
    }
}
