//! ELF identification and file header.
//!
//! [`ElfHeader::parse`] is the gatekeeper of the reader: it checks the magic before any other
//! byte is interpreted, rejects images the loader cannot place (ELF32, big-endian), and only
//! then decodes the offsets that the section scan will trust.

use goblin::elf::header::{
    machine_to_str, EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, SELFMAG,
};
use goblin::elf64::{
    header::{Header, SIZEOF_EHDR},
    section_header::SIZEOF_SHDR,
};
use scroll::{Pread, LE};

use crate::{
    Error::{NotElf, NotSupported, Truncated},
    Result,
};

/// The decoded ELF64 file header.
///
/// Only the fields the loader consumes are kept; the program-header fields are carried for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    /// Object file type (`e_type`)
    pub object_type: u16,
    /// Architecture identifier (`e_machine`)
    pub machine: u16,
    /// Entry point virtual address
    pub entry: u64,
    /// File offset of the program header table
    pub program_header_offset: u64,
    /// File offset of the section header table
    pub section_header_offset: u64,
    /// Size of one section header entry
    pub section_header_size: u16,
    /// Number of section headers, zero when extended numbering is in use
    pub section_header_count: u16,
    /// Index of the section name string table
    pub section_name_index: u16,
}

impl ElfHeader {
    /// Validates the identification bytes and decodes the file header.
    ///
    /// # Errors
    /// - [`crate::Error::NotElf`] if the magic does not match
    /// - [`crate::Error::Truncated`] if the data ends inside the header
    /// - [`crate::Error::NotSupported`] for ELF32 or big-endian images
    /// - [`crate::Error::Malformed`] if the section header entry size is too small
    pub fn parse(data: &[u8]) -> Result<ElfHeader> {
        let magic_len = data.len().min(SELFMAG);
        if data[..magic_len] != ELFMAG[..magic_len] {
            return Err(NotElf);
        }
        if data.len() < SIZEOF_EHDR {
            return Err(Truncated);
        }
        if data[EI_CLASS] != ELFCLASS64 || data[EI_DATA] != ELFDATA2LSB {
            return Err(NotSupported);
        }

        let header: Header = data.pread_with(0, LE).map_err(|_| Truncated)?;

        if header.e_shoff != 0 && usize::from(header.e_shentsize) < SIZEOF_SHDR {
            return Err(malformed_error!(
                "Section header entry size {} is smaller than {}",
                header.e_shentsize,
                SIZEOF_SHDR
            ));
        }

        if header.e_machine != EM_X86_64 {
            log::debug!(
                "Image targets {}, capability publication assumes x86_64",
                machine_to_str(header.e_machine)
            );
        }

        Ok(ElfHeader {
            object_type: header.e_type,
            machine: header.e_machine,
            entry: header.e_entry,
            program_header_offset: header.e_phoff,
            section_header_offset: header.e_shoff,
            section_header_size: header.e_shentsize,
            section_header_count: header.e_shnum,
            section_name_index: header.e_shstrndx,
        })
    }

    /// Returns the printable name of the target architecture.
    #[must_use]
    pub fn machine_name(&self) -> &'static str {
        machine_to_str(self.machine)
    }
}
