use elf::abi::PT_LOAD;
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::ElfBytes;

use crate::pjrc::teensyboot::firmware::Firmware;
use crate::pjrc::teensyboot::message::report;
use crate::pjrc::teensyboot::{Error, Result};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS32: u8 = 1;

///
/// ELF loader.
///
/// Accepts 32-bit objects of either endianness. Every `PT_LOAD` program header with a
/// non-zero file size contributes one segment at its physical address, holding the raw
/// bytes from the file. Section headers are ignored entirely.
///
pub(super) fn load(fw: &mut Firmware, mem: &[u8]) -> Result<()> {
    let filename = fw.filename().to_string();

    if mem.len() < 5 || &mem[0..4] != ELF_MAGIC {
        return Err(report(Error::Parse(format!("Missing ELF signature in '{}'", filename))));
    }
    if mem[4] != ELFCLASS32 {
        return Err(report(Error::Unsupported(format!(
            "ELF object '{}' is not supported (not 32-bit)",
            filename
        ))));
    }

    let file = ElfBytes::<AnyEndian>::minimal_parse(mem).map_err(|_| {
        report(Error::Parse(format!("ELF file '{}' is malformed or truncated", filename)))
    })?;
    debug_assert_eq!(file.ehdr.class, Class::ELF32);

    let segments = file.segments().ok_or_else(|| {
        report(Error::Unsupported(format!("ELF file '{}' has no program headers", filename)))
    })?;

    for phdr in segments.iter() {
        if phdr.p_type != PT_LOAD || phdr.p_filesz == 0 {
            continue;
        }

        let offset = phdr.p_offset as usize;
        let size = phdr.p_filesz as usize;
        let data = mem.get(offset..offset + size).ok_or_else(|| {
            report(Error::Parse(format!("ELF file '{}' is malformed or truncated", filename)))
        })?;

        fw.add_segment(phdr.p_paddr as u32, data)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pjrc::teensyboot::ErrorKind;

    #[derive(Copy, Clone)]
    enum Endian {
        Little,
        Big,
    }

    fn push_u16(buf: &mut Vec<u8>, endian: Endian, value: u16) {
        match endian {
            Endian::Little => buf.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => buf.extend_from_slice(&value.to_be_bytes()),
        }
    }

    fn push_u32(buf: &mut Vec<u8>, endian: Endian, value: u32) {
        match endian {
            Endian::Little => buf.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => buf.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Hand-assembled 32-bit ELF with one program header per `(p_type, p_paddr, data)` entry.
    fn make_elf32_with_types(endian: Endian, phdrs: &[(u32, u32, &[u8])]) -> Vec<u8> {
        const EHDR_SIZE: u32 = 52;
        const PHDR_SIZE: u32 = 32;

        let phnum = phdrs.len() as u32;
        let phoff = if phnum > 0 { EHDR_SIZE } else { 0 };
        let mut data_offset = EHDR_SIZE + phnum * PHDR_SIZE;

        let mut buf = Vec::new();
        buf.extend_from_slice(b"\x7fELF");
        buf.push(1); // ELFCLASS32
        buf.push(match endian {
            Endian::Little => 1,
            Endian::Big => 2,
        });
        buf.push(1); // EV_CURRENT
        buf.resize(16, 0);

        push_u16(&mut buf, endian, 2); // e_type: ET_EXEC
        push_u16(&mut buf, endian, 40); // e_machine: EM_ARM
        push_u32(&mut buf, endian, 1); // e_version
        push_u32(&mut buf, endian, 0); // e_entry
        push_u32(&mut buf, endian, phoff); // e_phoff
        push_u32(&mut buf, endian, 0); // e_shoff
        push_u32(&mut buf, endian, 0); // e_flags
        push_u16(&mut buf, endian, EHDR_SIZE as u16);
        push_u16(&mut buf, endian, PHDR_SIZE as u16);
        push_u16(&mut buf, endian, phnum as u16);
        push_u16(&mut buf, endian, 0); // e_shentsize
        push_u16(&mut buf, endian, 0); // e_shnum
        push_u16(&mut buf, endian, 0); // e_shstrndx

        for (p_type, paddr, data) in phdrs {
            push_u32(&mut buf, endian, *p_type);
            push_u32(&mut buf, endian, data_offset); // p_offset
            push_u32(&mut buf, endian, *paddr); // p_vaddr
            push_u32(&mut buf, endian, *paddr); // p_paddr
            push_u32(&mut buf, endian, data.len() as u32); // p_filesz
            push_u32(&mut buf, endian, data.len() as u32); // p_memsz
            push_u32(&mut buf, endian, 5); // p_flags: R+X
            push_u32(&mut buf, endian, 4); // p_align
            data_offset += data.len() as u32;
        }
        for (_, _, data) in phdrs {
            buf.extend_from_slice(data);
        }

        buf
    }

    fn make_elf32(endian: Endian, segments: &[(u32, &[u8])]) -> Vec<u8> {
        let phdrs: Vec<(u32, u32, &[u8])> =
            segments.iter().map(|(paddr, data)| (PT_LOAD, *paddr, *data)).collect();
        make_elf32_with_types(endian, &phdrs)
    }

    fn load_elf(mem: &[u8]) -> crate::pjrc::teensyboot::Result<std::sync::Arc<Firmware>> {
        Firmware::load_mem("test.elf", mem, None)
    }

    #[test]
    fn little_endian_segments_are_loaded() {
        let mem = make_elf32(
            Endian::Little,
            &[(0x0, &[1, 2, 3, 4]), (0x1000, &[5, 6])],
        );

        let fw = load_elf(&mem).unwrap();
        assert_eq!(fw.segments().len(), 2);
        assert_eq!(fw.segments()[0].address, 0x0);
        assert_eq!(fw.segments()[0].data, vec![1, 2, 3, 4]);
        assert_eq!(fw.segments()[1].address, 0x1000);
        assert_eq!(fw.total_size(), 6);
        assert_eq!(fw.max_address(), 0x1002);
    }

    #[test]
    fn big_endian_image_yields_identical_segments() {
        let le = make_elf32(Endian::Little, &[(0x100, &[1, 2, 3, 4])]);
        let be = make_elf32(Endian::Big, &[(0x100, &[1, 2, 3, 4])]);

        let fw_le = load_elf(&le).unwrap();
        let fw_be = load_elf(&be).unwrap();

        assert_eq!(fw_le.segments().len(), fw_be.segments().len());
        assert_eq!(fw_le.segments()[0].address, fw_be.segments()[0].address);
        assert_eq!(fw_le.segments()[0].data, fw_be.segments()[0].data);
    }

    #[test]
    fn no_load_segments_yield_empty_firmware() {
        const PT_NOTE: u32 = 4;
        let mem = make_elf32_with_types(Endian::Little, &[(PT_NOTE, 0, &[1, 2, 3, 4])]);

        let fw = load_elf(&mem).unwrap();
        assert_eq!(fw.segments().len(), 0);
        assert_eq!(fw.total_size(), 0);
        assert!(fw.identify(16).is_empty());
    }

    #[test]
    fn missing_program_headers_are_unsupported() {
        let mem = make_elf32(Endian::Little, &[]);
        let err = load_elf(&mem).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn missing_signature_is_a_parse_error() {
        let err = load_elf(b"MZ\x90\x00not an elf").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn elf64_is_unsupported() {
        let mut mem = make_elf32(Endian::Little, &[(0, &[1])]);
        mem[4] = 2; // ELFCLASS64
        let err = load_elf(&mem).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn truncated_segment_is_a_parse_error() {
        let mut mem = make_elf32(Endian::Little, &[(0, &[1, 2, 3, 4])]);
        mem.truncate(mem.len() - 2);
        let err = load_elf(&mem).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let mem = make_elf32(Endian::Little, &[(0x100, &[1, 2, 3, 4]), (0x102, &[5, 6])]);
        let err = load_elf(&mem).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
