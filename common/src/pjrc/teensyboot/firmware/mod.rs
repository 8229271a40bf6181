pub mod elf;
pub mod ihex;

use std::io::Read;
use std::sync::Arc;

use crate::pjrc::teensyboot::class;
use crate::pjrc::teensyboot::message::report;
use crate::pjrc::teensyboot::model::Model;
use crate::pjrc::teensyboot::{Error, Result};

pub const FIRMWARE_MAX_SEGMENTS: usize = 16;
pub const FIRMWARE_MAX_SIZE: usize = 32 * 1024 * 1024;

// Firmware image ---------------------------------------------------------------------------------

///
/// One contiguous block of firmware data at a fixed address.
///
#[derive(Debug, Clone)]
pub struct FirmwareSegment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl FirmwareSegment {
    pub fn end_address(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

///
/// Loaded firmware image.
///
/// A firmware is a set of non-overlapping segments produced by one of the supported file
/// formats (see [`FIRMWARE_FORMATS`]). Immutable once loaded and shared via `Arc`.
///
#[derive(Debug)]
pub struct Firmware {
    name: String,
    filename: String,
    segments: Vec<FirmwareSegment>,
    max_address: u32,
    total_size: usize,
}

// Formats ----------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct FirmwareFormat {
    pub name: &'static str,
    pub ext: &'static str,
    load: fn(&mut Firmware, &[u8]) -> Result<()>,
}

pub static FIRMWARE_FORMATS: [FirmwareFormat; 2] = [
    FirmwareFormat { name: "elf", ext: ".elf", load: elf::load },
    FirmwareFormat { name: "ihex", ext: ".hex", load: ihex::load },
];

fn find_format(filename: &str, format_name: Option<&str>) -> Result<&'static FirmwareFormat> {
    if let Some(format_name) = format_name {
        FIRMWARE_FORMATS
            .iter()
            .find(|format| format.name.eq_ignore_ascii_case(format_name))
            .ok_or_else(|| {
                report(Error::Unsupported(format!(
                    "Firmware file format '{}' unknown",
                    format_name
                )))
            })
    } else {
        let ext = match filename.rfind('.') {
            Some(pos) => &filename[pos..],
            None => {
                return Err(report(Error::Unsupported(format!(
                    "Firmware '{}' has no file extension",
                    filename
                ))))
            }
        };

        FIRMWARE_FORMATS
            .iter()
            .find(|format| format.ext.eq_ignore_ascii_case(ext))
            .ok_or_else(|| {
                report(Error::Unsupported(format!(
                    "Firmware '{}' uses unrecognized extension",
                    filename
                )))
            })
    }
}

fn file_basename(filename: &str) -> &str {
    filename
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
}

fn read_file(filename: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();

    if filename == "-" {
        std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(|err| report(Error::Io(format!("I/O error while reading from stdin: {}", err))))?;
    } else {
        let mut file = std::fs::File::open(filename).map_err(|err| {
            report(match err.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(format!("File '{}' does not exist", filename)),
                std::io::ErrorKind::PermissionDenied => {
                    Error::Access(format!("Permission denied for '{}'", filename))
                }
                _ => Error::System(format!("Failed to open '{}': {}", filename, err)),
            })
        })?;
        file.read_to_end(&mut buf)
            .map_err(|err| report(Error::Io(format!("I/O error while reading from '{}': {}", filename, err))))?;
    }

    if buf.len() > FIRMWARE_MAX_SIZE {
        return Err(report(Error::Range(format!("Firmware '{}' is too big to load", filename))));
    }

    Ok(buf)
}

impl Firmware {
    fn new(filename: &str) -> Firmware {
        Firmware {
            name: file_basename(filename).to_string(),
            filename: filename.to_string(),
            segments: Vec::new(),
            max_address: 0,
            total_size: 0,
        }
    }

    ///
    /// Load a firmware from a file.
    ///
    /// The format is taken from `format_name` when given, from the file extension
    /// otherwise. The special filename `-` reads standard input and requires an explicit
    /// format name.
    ///
    pub fn load_file(filename: &str, format_name: Option<&str>) -> Result<Arc<Firmware>> {
        if filename == "-" && format_name.is_none() {
            return Err(report(Error::Param(
                "Firmware format must be specified to read from standard input".to_string(),
            )));
        }

        let format = find_format(filename, format_name)?;
        let buf = read_file(filename)?;

        let mut fw = Firmware::new(filename);
        (format.load)(&mut fw, &buf)?;

        Ok(Arc::new(fw))
    }

    /// Load a firmware from memory, with the same format selection as [`Firmware::load_file`].
    pub fn load_mem(filename: &str, mem: &[u8], format_name: Option<&str>) -> Result<Arc<Firmware>> {
        let format = find_format(filename, format_name)?;

        let mut fw = Firmware::new(filename);
        (format.load)(&mut fw, mem)?;

        Ok(Arc::new(fw))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn segments(&self) -> &[FirmwareSegment] {
        &self.segments
    }

    /// Highest address one past the last byte of any segment.
    pub fn max_address(&self) -> u32 {
        self.max_address
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// The segment containing `address`, if any.
    pub fn find_segment(&self, address: u32) -> Option<&FirmwareSegment> {
        self.segments
            .iter()
            .find(|segment| address >= segment.address && address < segment.end_address())
    }

    ///
    /// Copy firmware data overlapping `[address, address + buf.len())` into `buf`.
    ///
    /// Bytes without segment data are left untouched (callers pass zeroed buffers).
    /// Returns one past the offset of the last byte written, or 0 when no segment
    /// overlaps the range.
    ///
    pub fn extract(&self, address: u32, buf: &mut [u8]) -> usize {
        let range_end = address as u64 + buf.len() as u64;
        let mut used = 0;

        for segment in &self.segments {
            let start = (segment.address as u64).max(address as u64);
            let end = (segment.end_address() as u64).min(range_end);
            if start >= end {
                continue;
            }

            let buf_offset = (start - address as u64) as usize;
            let seg_offset = (start - segment.address as u64) as usize;
            let len = (end - start) as usize;
            buf[buf_offset..buf_offset + len]
                .copy_from_slice(&segment.data[seg_offset..seg_offset + len]);
            used = used.max(buf_offset + len);
        }

        used
    }

    fn check_overlap(&self, address: u32, len: usize, skip: Option<usize>) -> Result<()> {
        let end = address as u64 + len as u64;

        for (i, segment) in self.segments.iter().enumerate() {
            if skip == Some(i) {
                continue;
            }
            if (address as u64) < segment.end_address() as u64 && (segment.address as u64) < end {
                return Err(report(Error::Parse(format!(
                    "Overlapping segments in firmware '{}'",
                    self.filename
                ))));
            }
        }

        Ok(())
    }

    fn check_size(&self, additional: usize) -> Result<()> {
        if self.total_size + additional > FIRMWARE_MAX_SIZE {
            return Err(report(Error::Range(format!(
                "Firmware too big (max {} bytes) in '{}'",
                FIRMWARE_MAX_SIZE, self.filename
            ))));
        }
        Ok(())
    }

    pub(super) fn add_segment(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if self.segments.len() >= FIRMWARE_MAX_SEGMENTS {
            return Err(report(Error::Range(format!(
                "Too many segments (max {}) in firmware '{}'",
                FIRMWARE_MAX_SEGMENTS, self.filename
            ))));
        }
        self.check_overlap(address, data.len(), None)?;
        self.check_size(data.len())?;

        self.segments.push(FirmwareSegment {
            address,
            data: data.to_vec(),
        });
        self.total_size += data.len();
        self.max_address = self.max_address.max(address + data.len() as u32);

        Ok(())
    }

    /// Append data to the segment ending exactly at `address`, or start a new segment.
    pub(super) fn append_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let adjacent = self.segments.iter().position(|segment| segment.end_address() == address);

        match adjacent {
            Some(i) => {
                self.check_overlap(address, data.len(), Some(i))?;
                self.check_size(data.len())?;

                self.segments[i].data.extend_from_slice(data);
                self.total_size += data.len();
                self.max_address = self.max_address.max(self.segments[i].end_address());
                Ok(())
            }
            None => self.add_segment(address, data),
        }
    }

    ///
    /// Guess which board models this firmware was built for.
    ///
    /// Every registered device class contributes its candidates in registration order,
    /// capped at `max_models` entries overall.
    ///
    pub fn identify(&self, max_models: usize) -> Vec<Model> {
        let mut models = Vec::new();

        for class in class::classes() {
            if models.len() >= max_models {
                break;
            }
            let partial = class.identify_models(self, max_models - models.len());
            models.extend(partial);
        }

        models.truncate(max_models);
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_firmware() -> Firmware {
        Firmware::new("test.hex")
    }

    #[test]
    fn format_selected_by_extension() {
        assert_eq!(find_format("blink.hex", None).unwrap().name, "ihex");
        assert_eq!(find_format("blink.HEX", None).unwrap().name, "ihex");
        assert_eq!(find_format("blink.elf", None).unwrap().name, "elf");
        assert_eq!(find_format("blink.bin", None).unwrap_err().kind(), crate::pjrc::teensyboot::ErrorKind::Unsupported);
        assert_eq!(find_format("blink", None).unwrap_err().kind(), crate::pjrc::teensyboot::ErrorKind::Unsupported);
    }

    #[test]
    fn format_selected_by_name() {
        assert_eq!(find_format("whatever", Some("IHEX")).unwrap().name, "ihex");
        assert_eq!(find_format("whatever", Some("elf")).unwrap().name, "elf");
        assert!(find_format("whatever", Some("uf2")).is_err());
    }

    #[test]
    fn stdin_requires_format_name() {
        let err = Firmware::load_file("-", None).unwrap_err();
        assert_eq!(err.kind(), crate::pjrc::teensyboot::ErrorKind::Param);
    }

    #[test]
    fn segment_limit_is_enforced() {
        let mut fw = empty_firmware();
        for i in 0..FIRMWARE_MAX_SEGMENTS {
            fw.add_segment(i as u32 * 0x1000, &[0xAA]).unwrap();
        }
        let err = fw.add_segment(0x100000, &[0xAA]).unwrap_err();
        assert_eq!(err.kind(), crate::pjrc::teensyboot::ErrorKind::Range);
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let mut fw = empty_firmware();
        fw.add_segment(0x100, &[0; 0x10]).unwrap();
        let err = fw.add_segment(0x108, &[0; 0x10]).unwrap_err();
        assert_eq!(err.kind(), crate::pjrc::teensyboot::ErrorKind::Parse);
    }

    #[test]
    fn append_extends_adjacent_segment() {
        let mut fw = empty_firmware();
        fw.append_data(0x100, &[1, 2]).unwrap();
        fw.append_data(0x102, &[3, 4]).unwrap();
        fw.append_data(0x200, &[5]).unwrap();

        assert_eq!(fw.segments().len(), 2);
        assert_eq!(fw.segments()[0].data, vec![1, 2, 3, 4]);
        assert_eq!(fw.total_size(), 5);
        assert_eq!(fw.max_address(), 0x201);
    }

    #[test]
    fn extract_pads_gaps_and_reports_extent() {
        let mut fw = empty_firmware();
        fw.add_segment(0x100, &[0xAA, 0xBB]).unwrap();
        fw.add_segment(0x110, &[0xCC, 0xDD]).unwrap();

        let mut buf = [0u8; 0x20];
        let used = fw.extract(0x100, &mut buf);

        assert_eq!(used, 0x12);
        assert_eq!(&buf[0..2], &[0xAA, 0xBB]);
        assert_eq!(&buf[2..0x10], &[0u8; 0xE]);
        assert_eq!(&buf[0x10..0x12], &[0xCC, 0xDD]);
    }

    #[test]
    fn extract_outside_segments_returns_zero() {
        let mut fw = empty_firmware();
        fw.add_segment(0x100, &[0xAA]).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(fw.extract(0x1000, &mut buf), 0);
    }

    #[test]
    fn find_segment_matches_containing_range() {
        let mut fw = empty_firmware();
        fw.add_segment(0x60000000, &[0; 32]).unwrap();

        assert!(fw.find_segment(0x60000000).is_some());
        assert!(fw.find_segment(0x6000001F).is_some());
        assert!(fw.find_segment(0x60000020).is_none());
        assert!(fw.find_segment(0).is_none());
    }
}
