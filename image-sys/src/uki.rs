// SPDX-License-Identifier: GPL-3.0-only

//! Reading the embedded kernel command line of a unified kernel image.
//!
//! A UKI is a PE/COFF executable; the command line lives in its `.cmdline`
//! section. Only the headers needed to locate that section are decoded.

use std::fs;
use std::path::Path;

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Result, SysError};

const PE_MAGIC: [u8; 4] = *b"PE\0\0";
const CMDLINE_SECTION: [u8; 8] = *b".cmdline";

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DosHeader {
    _unused: [u8; 0x3c],
    pe_offset: U32,
}

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PeHeader {
    magic: [u8; 4],
    machine: U16,
    number_of_sections: U16,
    time_date_stamp: U32,
    pointer_to_symbol_table: U32,
    number_of_symbols: U32,
    size_of_optional_header: U16,
    characteristics: U16,
}

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SectionHeader {
    name: [u8; 8],
    virtual_size: U32,
    virtual_address: U32,
    size_of_raw_data: U32,
    pointer_to_raw_data: U32,
    pointer_to_relocations: U32,
    pointer_to_line_numbers: U32,
    number_of_relocations: U16,
    number_of_line_numbers: U16,
    characteristics: U32,
}

fn cmdline_bytes(image: &[u8]) -> std::result::Result<&[u8], &'static str> {
    let (dos, _) = DosHeader::ref_from_prefix(image).map_err(|_| "truncated DOS header")?;
    let rest = image
        .get(dos.pe_offset.get() as usize..)
        .ok_or("PE offset past end of file")?;

    let (pe, rest) = PeHeader::ref_from_prefix(rest).map_err(|_| "truncated PE header")?;
    if pe.magic != PE_MAGIC {
        return Err("missing PE signature");
    }

    let rest = rest
        .get(pe.size_of_optional_header.get() as usize..)
        .ok_or("optional header past end of file")?;
    let count = pe.number_of_sections.get() as usize;
    let (sections, _) = <[SectionHeader]>::ref_from_prefix_with_elems(rest, count)
        .map_err(|_| "truncated section table")?;

    let section = sections
        .iter()
        .find(|section| section.name == CMDLINE_SECTION)
        .ok_or("no .cmdline section")?;

    let start = section.pointer_to_raw_data.get() as usize;
    // raw data is padded to the file alignment; the virtual size is exact
    let len = section.virtual_size.get().min(section.size_of_raw_data.get()) as usize;
    image
        .get(start..)
        .and_then(|data| data.get(..len))
        .ok_or(".cmdline section past end of file")
}

/// Kernel command line embedded in the UKI bytes `image`
pub fn parse_cmdline_section(image: &[u8]) -> std::result::Result<String, String> {
    let bytes = cmdline_bytes(image)?;
    let text = std::str::from_utf8(bytes).map_err(|_| ".cmdline section is not UTF-8".to_string())?;
    Ok(text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
}

/// Kernel command line embedded in the UKI at `path`
pub fn read_cmdline(path: &Path) -> Result<String> {
    let image = fs::read(path).map_err(|error| SysError::DeviceRead {
        path: path.to_path_buf(),
        error,
    })?;

    parse_cmdline_section(&image).map_err(|reason| SysError::InvalidData {
        path: path.to_path_buf(),
        reason,
    })
}
