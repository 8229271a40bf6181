#![allow(dead_code)]

use halfkay_fw_update_common::pjrc::teensyboot::device::{Device, DeviceType};

pub const TEENSY_VID: u16 = 0x16C0;
pub const SERIAL_PID: u16 = 0x0483;
pub const HALFKAY_PID: u16 = 0x0478;
pub const SEREMU_PID: u16 = 0x0487;

pub const USAGE_PAGE_BOOTLOADER: u16 = 0xFF9C;
pub const USAGE_PAGE_SEREMU: u16 = 0xFFC9;

/// Teensy USB serial interface, as seen while the firmware is running.
pub fn teensy_serial(location: &str, path: &str, serial: &str) -> Device {
    Device {
        location: location.to_string(),
        path: path.to_string(),
        vid: TEENSY_VID,
        pid: SERIAL_PID,
        dev_type: DeviceType::Serial,
        serial_number: Some(serial.to_string()),
        manufacturer: Some("Teensyduino".to_string()),
        product: Some("USB Serial".to_string()),
        usage_page: 0,
        usage: 0,
        bcd_device: 0x0275,
        iface_number: 0,
    }
}

/// Teensy Seremu interface (HID-emulated serial).
pub fn teensy_seremu(location: &str, path: &str, serial: &str) -> Device {
    Device {
        location: location.to_string(),
        path: path.to_string(),
        vid: TEENSY_VID,
        pid: SEREMU_PID,
        dev_type: DeviceType::Hid,
        serial_number: Some(serial.to_string()),
        manufacturer: Some("Teensyduino".to_string()),
        product: Some("Teensy Keyboard".to_string()),
        usage_page: USAGE_PAGE_SEREMU,
        usage: 0x0100,
        bcd_device: 0x0275,
        iface_number: 1,
    }
}

/// HalfKay bootloader interface. `usage` selects the model, `serial` is hex-encoded.
pub fn teensy_halfkay(location: &str, path: &str, usage: u16, serial: &str) -> Device {
    Device {
        location: location.to_string(),
        path: path.to_string(),
        vid: TEENSY_VID,
        pid: HALFKAY_PID,
        dev_type: DeviceType::Hid,
        serial_number: Some(serial.to_string()),
        manufacturer: Some("PJRC.COM".to_string()),
        product: Some("HalfKay Bootloader".to_string()),
        usage_page: USAGE_PAGE_BOOTLOADER,
        usage,
        bcd_device: 0x0101,
        iface_number: 0,
    }
}

/// Plain USB serial adapter handled by the generic class.
pub fn generic_serial(location: &str, path: &str, serial: &str) -> Device {
    Device {
        location: location.to_string(),
        path: path.to_string(),
        vid: 0x0403,
        pid: 0x6001,
        dev_type: DeviceType::Serial,
        serial_number: Some(serial.to_string()),
        manufacturer: Some("FTDI".to_string()),
        product: Some("FT232R USB UART".to_string()),
        usage_page: 0,
        usage: 0,
        bcd_device: 0x0600,
        iface_number: 0,
    }
}

/// Minimal little-endian ELF32 with one loadable segment per entry.
pub fn make_elf32(segments: &[(u32, &[u8])]) -> Vec<u8> {
    const EHDR_SIZE: u32 = 52;
    const PHDR_SIZE: u32 = 32;
    const PT_LOAD: u32 = 1;

    let phnum = segments.len() as u32;
    let mut data_offset = EHDR_SIZE + phnum * PHDR_SIZE;

    let mut buf = Vec::new();
    buf.extend_from_slice(b"\x7fELF");
    buf.push(1); // ELFCLASS32
    buf.push(1); // little-endian
    buf.push(1); // EV_CURRENT
    buf.resize(16, 0);

    let push_u16 = |buf: &mut Vec<u8>, value: u16| buf.extend_from_slice(&value.to_le_bytes());
    let push_u32 = |buf: &mut Vec<u8>, value: u32| buf.extend_from_slice(&value.to_le_bytes());

    push_u16(&mut buf, 2); // e_type: ET_EXEC
    push_u16(&mut buf, 40); // e_machine: EM_ARM
    push_u32(&mut buf, 1); // e_version
    push_u32(&mut buf, 0); // e_entry
    push_u32(&mut buf, EHDR_SIZE); // e_phoff
    push_u32(&mut buf, 0); // e_shoff
    push_u32(&mut buf, 0); // e_flags
    push_u16(&mut buf, EHDR_SIZE as u16);
    push_u16(&mut buf, PHDR_SIZE as u16);
    push_u16(&mut buf, phnum as u16);
    push_u16(&mut buf, 0); // e_shentsize
    push_u16(&mut buf, 0); // e_shnum
    push_u16(&mut buf, 0); // e_shstrndx

    for (paddr, data) in segments {
        push_u32(&mut buf, PT_LOAD);
        push_u32(&mut buf, data_offset);
        push_u32(&mut buf, *paddr); // p_vaddr
        push_u32(&mut buf, *paddr); // p_paddr
        push_u32(&mut buf, data.len() as u32);
        push_u32(&mut buf, data.len() as u32);
        push_u32(&mut buf, 5); // p_flags
        push_u32(&mut buf, 4); // p_align
        data_offset += data.len() as u32;
    }
    for (_, data) in segments {
        buf.extend_from_slice(data);
    }

    buf
}

/// Image the Teensy identification recognizes as a 3.1/3.2 build, `size` bytes long.
pub fn teensy32_image(size: usize) -> Vec<u8> {
    assert!(size >= 0x400);

    let mut data = vec![0xFF; size];
    data[0..4].copy_from_slice(&0x20008000u32.to_le_bytes());
    data[4..8].copy_from_slice(&0x000001BDu32.to_le_bytes());
    for i in (8..0x1BC).step_by(4) {
        data[i..i + 4].copy_from_slice(&0x000004C1u32.to_le_bytes());
    }
    data
}
