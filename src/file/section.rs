//! Section headers, section descriptors and string tables.

use goblin::elf::section_header::SHT_NOBITS;
use goblin::elf64::section_header::SectionHeader;
use strum::{Display, EnumCount, EnumIter};

/// Name prefix the toolchain uses to mark sections that get their own capability slot.
pub const DEFAULT_SANDBOX_PREFIX: &str = ".sandbox";

/// What role a section plays inside the isolation domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumCount)]
pub enum SectionKind {
    /// Executable code (`.text`)
    Code,
    /// Initialized writable data (`.data`)
    Data,
    /// Read-only data (`.rodata`)
    ReadOnlyData,
    /// Zero-initialized data (`.bss`)
    ZeroFill,
    /// A section the toolchain marked with the sandbox name prefix
    SandboxCustom,
}

impl SectionKind {
    /// Classifies a section by name.
    ///
    /// The four canonical sections map to their reserved kinds; any name starting with
    /// `sandbox_prefix` is a [`SectionKind::SandboxCustom`] section. Everything else is not
    /// isolated and yields `None`.
    #[must_use]
    pub fn classify(name: &str, sandbox_prefix: &str) -> Option<SectionKind> {
        match name {
            ".text" => Some(SectionKind::Code),
            ".data" => Some(SectionKind::Data),
            ".rodata" => Some(SectionKind::ReadOnlyData),
            ".bss" => Some(SectionKind::ZeroFill),
            _ if !sandbox_prefix.is_empty() && name.starts_with(sandbox_prefix) => {
                Some(SectionKind::SandboxCustom)
            }
            _ => None,
        }
    }
}

/// A section as the loader sees it: name resolved, kind classified.
///
/// Produced by [`crate::BinaryImage::section_headers`] and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// Index inside the section header table
    pub index: usize,
    /// Resolved section name
    pub name: String,
    /// File offset of the section contents
    pub file_offset: u64,
    /// Size of the section in bytes
    pub file_size: u64,
    /// Virtual address the linker assigned, used as offset into the isolated region
    pub virtual_address_hint: u64,
    /// Section type (`SHT_*`)
    pub section_type: u32,
    /// Section flags (`SHF_*`)
    pub flags: u64,
    /// Section index link
    pub link: u32,
    /// Entry size for table sections
    pub entry_size: u64,
    /// Role inside the isolation domain, `None` for sections that are not isolated
    pub kind: Option<SectionKind>,
}

impl SectionDescriptor {
    pub(crate) fn new(
        index: usize,
        name: String,
        header: &SectionHeader,
        sandbox_prefix: &str,
    ) -> SectionDescriptor {
        let kind = SectionKind::classify(&name, sandbox_prefix);
        SectionDescriptor {
            index,
            name,
            file_offset: header.sh_offset,
            file_size: header.sh_size,
            virtual_address_hint: header.sh_addr,
            section_type: header.sh_type,
            flags: header.sh_flags,
            link: header.sh_link,
            entry_size: header.sh_entsize,
            kind,
        }
    }

    /// Returns `true` if the section occupies no bytes in the file (`SHT_NOBITS`).
    #[must_use]
    pub fn is_nobits(&self) -> bool {
        self.section_type == SHT_NOBITS
    }
}

/// A copy of a string table section, used to resolve `sh_name` and `st_name` offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    /// Wraps the raw bytes of a string table section.
    #[must_use]
    pub fn new(data: Vec<u8>) -> StringTable {
        StringTable { data }
    }

    /// Resolves the NUL-terminated string starting at `offset`.
    ///
    /// Offsets past the end resolve to `None`; a missing terminator ends the string at the end
    /// of the table. Invalid UTF-8 is replaced rather than rejected, names are only used for
    /// matching and diagnostics.
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<String> {
        let tail = self.data.get(offset..)?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Some(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Returns the size of the table in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the table holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS};
    use strum::IntoEnumIterator;

    #[test]
    fn classify_canonical_sections() {
        let prefix = DEFAULT_SANDBOX_PREFIX;
        assert_eq!(SectionKind::classify(".text", prefix), Some(SectionKind::Code));
        assert_eq!(SectionKind::classify(".data", prefix), Some(SectionKind::Data));
        assert_eq!(
            SectionKind::classify(".rodata", prefix),
            Some(SectionKind::ReadOnlyData)
        );
        assert_eq!(SectionKind::classify(".bss", prefix), Some(SectionKind::ZeroFill));
        assert_eq!(
            SectionKind::classify(".sandbox1", prefix),
            Some(SectionKind::SandboxCustom)
        );
        assert_eq!(SectionKind::classify(".data.rel.ro", prefix), None);
        assert_eq!(SectionKind::classify(".symtab", prefix), None);
        assert_eq!(SectionKind::classify(".sandbox1", ""), None);
        assert_eq!(
            SectionKind::classify(".isolated.fn", ".isolated"),
            Some(SectionKind::SandboxCustom)
        );
    }

    #[test]
    fn kind_display() {
        let names: Vec<String> = SectionKind::iter().map(|kind| kind.to_string()).collect();
        assert_eq!(
            names,
            ["Code", "Data", "ReadOnlyData", "ZeroFill", "SandboxCustom"]
        );
        assert_eq!(SectionKind::COUNT, 5);
    }

    #[test]
    fn descriptor_from_header() {
        let header = SectionHeader {
            sh_name: 7,
            sh_type: SHT_PROGBITS,
            sh_flags: u64::from(SHF_ALLOC | SHF_EXECINSTR),
            sh_addr: 0x40_1000,
            sh_offset: 0x1000,
            sh_size: 64,
            sh_addralign: 16,
            ..SectionHeader::default()
        };

        let descriptor = SectionDescriptor::new(1, ".text".into(), &header, DEFAULT_SANDBOX_PREFIX);
        assert_eq!(descriptor.kind, Some(SectionKind::Code));
        assert_eq!(descriptor.file_offset, 0x1000);
        assert_eq!(descriptor.file_size, 64);
        assert_eq!(descriptor.virtual_address_hint, 0x40_1000);
        assert!(!descriptor.is_nobits());

        let bss = SectionHeader {
            sh_type: SHT_NOBITS,
            sh_size: 128,
            ..SectionHeader::default()
        };
        let descriptor = SectionDescriptor::new(2, ".bss".into(), &bss, DEFAULT_SANDBOX_PREFIX);
        assert_eq!(descriptor.kind, Some(SectionKind::ZeroFill));
        assert!(descriptor.is_nobits());

        let descriptor = SectionDescriptor::new(3, ".comment".into(), &bss, DEFAULT_SANDBOX_PREFIX);
        assert_eq!(descriptor.kind, None);
    }

    #[test]
    fn string_table_lookup() {
        let table = StringTable::new(b"\0.text\0.data\0tail".to_vec());
        assert_eq!(table.get(0).as_deref(), Some(""));
        assert_eq!(table.get(1).as_deref(), Some(".text"));
        assert_eq!(table.get(3).as_deref(), Some("ext"));
        assert_eq!(table.get(7).as_deref(), Some(".data"));
        assert_eq!(table.get(13).as_deref(), Some("tail"));
        assert_eq!(table.get(17).as_deref(), Some(""));
        assert_eq!(table.get(18), None);
        assert_eq!(table.len(), 17);
    }
}
