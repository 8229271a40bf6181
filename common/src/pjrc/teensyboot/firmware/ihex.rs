use crate::pjrc::teensyboot::firmware::Firmware;
use crate::pjrc::teensyboot::message::report;
use crate::pjrc::teensyboot::{Error, Result};

// Record types, see the Intel HEX specification.
const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const RECORD_START_SEGMENT_ADDRESS: u8 = 0x03;
const RECORD_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const RECORD_START_LINEAR_ADDRESS: u8 = 0x05;

fn parse_error(filename: &str, line: usize) -> Error {
    report(Error::Parse(format!(
        "IHEX parse error on line {} in '{}'",
        line, filename
    )))
}

fn decode_record(line: &str) -> Option<Vec<u8>> {
    if line.len() % 2 != 0 {
        return None;
    }

    let mut bytes = Vec::with_capacity(line.len() / 2);
    for i in (0..line.len()).step_by(2) {
        bytes.push(u8::from_str_radix(line.get(i..i + 2)?, 16).ok()?);
    }
    Some(bytes)
}

///
/// Intel HEX loader.
///
/// Lines are `:llaaaatt<data>cc` with an additive mod-256 checksum over every byte
/// including `cc`. Data records accumulate into segments relative to the base offset set
/// by extended segment/linear address records; the EOF record terminates the file and is
/// mandatory.
///
pub(super) fn load(fw: &mut Firmware, mem: &[u8]) -> Result<()> {
    let filename = fw.filename().to_string();

    let text = std::str::from_utf8(mem).map_err(|_| parse_error(&filename, 1))?;

    let mut base_offset: u32 = 0;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let line = match line.strip_prefix(':') {
            Some(line) => line,
            None => return Err(parse_error(&filename, line_no)),
        };

        let bytes = decode_record(line).ok_or_else(|| parse_error(&filename, line_no))?;
        if bytes.len() < 5 {
            return Err(parse_error(&filename, line_no));
        }

        let data_len = bytes[0] as usize;
        if bytes.len() != 5 + data_len {
            return Err(parse_error(&filename, line_no));
        }

        let sum = bytes.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));
        if sum != 0 {
            return Err(parse_error(&filename, line_no));
        }

        let address = ((bytes[1] as u32) << 8) | bytes[2] as u32;
        let record_type = bytes[3];
        let data = &bytes[4..4 + data_len];

        match record_type {
            RECORD_DATA => {
                fw.append_data(base_offset.wrapping_add(address), data)?;
            }

            RECORD_EOF => {
                if data_len != 0 {
                    return Err(parse_error(&filename, line_no));
                }
                return Ok(());
            }

            RECORD_EXTENDED_SEGMENT_ADDRESS => {
                if data_len != 2 {
                    return Err(parse_error(&filename, line_no));
                }
                base_offset = (((data[0] as u32) << 8) | data[1] as u32) << 4;
            }

            RECORD_EXTENDED_LINEAR_ADDRESS => {
                if data_len != 2 {
                    return Err(parse_error(&filename, line_no));
                }
                base_offset = (((data[0] as u32) << 8) | data[1] as u32) << 16;
            }

            RECORD_START_SEGMENT_ADDRESS | RECORD_START_LINEAR_ADDRESS => {
                // Start addresses are meaningless for flashing, accepted and ignored
                if data_len != 4 {
                    return Err(parse_error(&filename, line_no));
                }
            }

            _ => return Err(parse_error(&filename, line_no)),
        }
    }

    // Input ended without an EOF record
    Err(parse_error(&filename, text.lines().count().max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pjrc::teensyboot::firmware::Firmware;
    use crate::pjrc::teensyboot::ErrorKind;

    fn load_str(hex: &str) -> crate::pjrc::teensyboot::Result<std::sync::Arc<Firmware>> {
        Firmware::load_mem("test.hex", hex.as_bytes(), None)
    }

    #[test]
    fn hex_file_read_linux_format() {
        let hex_data = ":020000040800F2\n\
             :102000000000012009230008D1220008D522000881\n\
             :10201000D9220008DD220008E122000800000000AB\n\
             :00000001FF\n";

        let fw = load_str(hex_data).unwrap();
        assert_eq!(fw.segments().len(), 1);
        assert_eq!(fw.segments()[0].address, 0x08002000);
        assert_eq!(fw.segments()[0].data.len(), 0x20);
        assert_eq!(fw.segments()[0].data[0..4], [0x00, 0x00, 0x01, 0x20]);
        assert_eq!(fw.max_address(), 0x08002020);
        assert_eq!(fw.total_size(), 0x20);
    }

    #[test]
    fn hex_file_read_dos_format() {
        let hex_data = ":020000040800F2\r\n\
             :102000000000012009230008D1220008D522000881\r\n\
             :00000001FF\r\n";

        let fw = load_str(hex_data).unwrap();
        assert_eq!(fw.segments().len(), 1);
        assert_eq!(fw.total_size(), 0x10);
    }

    #[test]
    fn extended_segment_address_shifts_by_four() {
        let hex_data = ":020000020100FB\n\
             :040000001122334452\n\
             :00000001FF\n";

        let fw = load_str(hex_data).unwrap();
        assert_eq!(fw.segments()[0].address, 0x1000);
        assert_eq!(fw.segments()[0].data, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn start_address_records_are_ignored() {
        let hex_data = ":0400000300003800C1\n\
             :04000005080020C906\n\
             :0100000042BD\n\
             :00000001FF\n";

        let fw = load_str(hex_data).unwrap();
        assert_eq!(fw.segments().len(), 1);
        assert_eq!(fw.segments()[0].data, vec![0x42]);
    }

    #[test]
    fn checksum_off_by_one_is_rejected() {
        let hex_data = ":0100000042BE\n:00000001FF\n";
        let err = load_str(hex_data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn missing_eof_record_is_rejected() {
        let hex_data = ":0100000042BD\n";
        let err = load_str(hex_data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn unknown_record_type_is_rejected() {
        let hex_data = ":01000006421CWRONG\n";
        assert_eq!(load_str(hex_data).unwrap_err().kind(), ErrorKind::Parse);

        let hex_data = ":0100000642B7\n:00000001FF\n";
        assert_eq!(load_str(hex_data).unwrap_err().kind(), ErrorKind::Parse);
    }

    #[test]
    fn byte_count_mismatch_is_rejected() {
        let hex_data = ":0200000042BD\n:00000001FF\n";
        assert_eq!(load_str(hex_data).unwrap_err().kind(), ErrorKind::Parse);
    }

    #[test]
    fn missing_start_code_is_rejected() {
        let hex_data = "0100000042BD\n:00000001FF\n";
        assert_eq!(load_str(hex_data).unwrap_err().kind(), ErrorKind::Parse);
    }

    #[test]
    fn eof_with_payload_is_rejected() {
        let hex_data = ":0100000142BC\n";
        assert_eq!(load_str(hex_data).unwrap_err().kind(), ErrorKind::Parse);
    }

    #[test]
    fn contiguous_records_merge_into_one_segment() {
        let hex_data = ":04000000AABBCCDDEE\n\
             :04000400112233444E\n\
             :00000001FF\n";

        let fw = load_str(hex_data).unwrap();
        assert_eq!(fw.segments().len(), 1);
        assert_eq!(
            fw.segments()[0].data,
            vec![0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44]
        );
    }

    #[test]
    fn disjoint_records_produce_separate_segments() {
        let hex_data = ":02000000AABB99\n\
             :02001000CCDD45\n\
             :00000001FF\n";

        let fw = load_str(hex_data).unwrap();
        assert_eq!(fw.segments().len(), 2);
        assert_eq!(fw.max_address(), 0x12);
        assert_eq!(fw.total_size(), 4);
    }
}
