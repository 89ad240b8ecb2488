//! ELF image access and section/symbol table parsing.
//!
//! This module is the binary-format reader of the loader. It abstracts over where the image
//! bytes come from (a memory-mapped file or an owned buffer) and provides the structural views
//! the rest of the loader needs: the file header, section descriptors with resolved names,
//! string tables and the symbol table.
//!
//! # Key Components
//!
//! - [`crate::file::BinaryImage`] - An opened, validated ELF64 image
//! - [`crate::file::Backend`] - Trait for different data sources (disk files, memory buffers)
//! - [`crate::file::SectionDescriptor`] - A named, classified section
//! - [`crate::file::SymbolEntry`] - A symbol with resolved name and visibility
//!
//! # Resilience
//!
//! Every section header and every symbol entry is read independently at its absolute offset
//! (`table offset + index * entry size`), never by streaming through the table. A header that
//! cannot be read in full is reported as [`crate::Error::HeaderRead`] for that index alone;
//! the scanning helpers log it, skip the index, and continue with the next one.
//!
//! # Examples
//!
//! ```rust,no_run
//! use sfiloader::BinaryImage;
//!
//! let image = BinaryImage::from_file("/proc/self/exe".as_ref())?;
//! for section in image.section_headers() {
//!     println!("{:<20} offset {:#x} size {:#x}", section.name, section.file_offset, section.file_size);
//! }
//!
//! let data = image.find_section(".data")?;
//! println!(".data starts at file offset {:#x}", data.file_offset);
//! # Ok::<(), sfiloader::Error>(())
//! ```

mod header;
mod memory;
mod physical;
mod section;
mod symbol;

use std::path::Path;

use goblin::elf::section_header::{SHN_UNDEF, SHN_XINDEX};
use goblin::elf64::{section_header::SectionHeader, sym::SIZEOF_SYM};
use scroll::{Pread, LE};

pub use header::ElfHeader;
pub use section::{SectionDescriptor, SectionKind, StringTable, DEFAULT_SANDBOX_PREFIX};
pub use symbol::{SymbolEntry, Visibility};

use crate::{
    Error::{Empty, HeaderRead, OutOfBounds, SectionNotFound, ShortRead, Truncated},
    Result,
};
use memory::Memory;
use physical::Physical;

/// Backend trait for image data sources.
///
/// This trait abstracts over the source of the ELF data, allowing for both in-memory and
/// on-disk representations. All implementations must be thread-safe. Implementors only
/// expose their bytes; range checks are shared.
pub trait Backend: Send + Sync {
    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data().get(offset..end))
            .ok_or(OutOfBounds)
    }
}

/// An opened ELF64 image.
///
/// Construction validates the identification bytes and the file header and loads the section
/// name string table; everything else is read on demand. The image is meant to live for a single
/// load pass: the loader opens it, extracts descriptors, symbols and section contents, and
/// drops it.
pub struct BinaryImage {
    /// The underlying data source (memory or file).
    data: Box<dyn Backend>,
    /// The validated file header.
    header: ElfHeader,
    /// Number of section headers, after resolving extended numbering.
    section_count: usize,
    /// Index of the section name string table, after resolving extended numbering.
    name_index: usize,
    /// The section name string table.
    names: StringTable,
    /// Name prefix that marks sandbox sections.
    sandbox_prefix: String,
}

impl std::fmt::Debug for BinaryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryImage")
            .field("len", &self.data.len())
            .field("header", &self.header)
            .field("section_count", &self.section_count)
            .field("sandbox_prefix", &self.sandbox_prefix)
            .finish()
    }
}

impl BinaryImage {
    /// Opens and validates the ELF image at `path`.
    ///
    /// The file is memory-mapped read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or mapped ([`crate::Error::FileError`])
    /// - The file is empty ([`crate::Error::Empty`])
    /// - The magic does not match ([`crate::Error::NotElf`])
    /// - The header or the section name table is cut short ([`crate::Error::Truncated`])
    /// - The image is not 64-bit little-endian ([`crate::Error::NotSupported`])
    pub fn from_file(path: &Path) -> Result<BinaryImage> {
        let input = Physical::new(path)?;

        Self::load(input)
    }

    /// Parses an ELF image that is already in memory.
    ///
    /// # Errors
    ///
    /// Same as [`BinaryImage::from_file`], minus the I/O failures.
    pub fn from_mem(data: Vec<u8>) -> Result<BinaryImage> {
        let input = Memory::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<BinaryImage> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let header = ElfHeader::parse(data.data())?;

        let mut image = BinaryImage {
            data: Box::new(data),
            header,
            section_count: usize::from(header.section_header_count),
            name_index: usize::from(header.section_name_index),
            names: StringTable::default(),
            sandbox_prefix: DEFAULT_SANDBOX_PREFIX.to_string(),
        };

        if header.section_header_offset == 0 {
            image.section_count = 0;
            return Ok(image);
        }

        // Extended numbering keeps the real values in the first (null) section header
        if header.section_header_count == 0 || u32::from(header.section_name_index) == SHN_XINDEX
        {
            let first = image.raw_section_header(0).map_err(|_| Truncated)?;
            if header.section_header_count == 0 {
                let available = (image.len() as u64)
                    .saturating_sub(header.section_header_offset)
                    / u64::from(header.section_header_size);
                if first.sh_size > available {
                    return Err(malformed_error!(
                        "Section count {} exceeds the {} headers the image can hold",
                        first.sh_size,
                        available
                    ));
                }
                image.section_count = first.sh_size as usize;
            }
            if u32::from(header.section_name_index) == SHN_XINDEX {
                image.name_index = first.sh_link as usize;
            }
        }

        if image.name_index != SHN_UNDEF as usize {
            if image.name_index >= image.section_count {
                return Err(malformed_error!(
                    "Section name table index {} out of range ({} sections)",
                    image.name_index,
                    image.section_count
                ));
            }

            let names_header = image
                .raw_section_header(image.name_index)
                .map_err(|_| Truncated)?;
            let names = image
                .bytes_at(names_header.sh_offset, names_header.sh_size)
                .map_err(|_| Truncated)?;
            image.names = StringTable::new(names.to_vec());
        }

        log::debug!(
            "ELF image: {} bytes, machine {}, {} sections, section names at index {}",
            image.len(),
            header.machine_name(),
            image.section_count,
            image.name_index
        );

        Ok(image)
    }

    /// Replaces the name prefix that marks [`SectionKind::SandboxCustom`] sections.
    #[must_use]
    pub fn with_sandbox_prefix(mut self, prefix: &str) -> BinaryImage {
        self.sandbox_prefix = prefix.to_string();
        self
    }

    /// Returns the total size of the image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the image has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Returns the complete image data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Returns a bounds-checked slice of the image data.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range is not inside the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// Returns the validated file header.
    #[must_use]
    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    /// Returns the number of entries in the section header table.
    #[must_use]
    pub fn section_count(&self) -> usize {
        self.section_count
    }

    /// Returns the section name string table.
    #[must_use]
    pub fn section_names(&self) -> &StringTable {
        &self.names
    }

    fn bytes_at(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let offset = usize::try_from(offset).map_err(|_| OutOfBounds)?;
        let len = usize::try_from(len).map_err(|_| OutOfBounds)?;
        self.data.data_slice(offset, len)
    }

    fn raw_section_header(&self, index: usize) -> Result<SectionHeader> {
        let entry_size = u64::from(self.header.section_header_size);
        let offset = (index as u64)
            .checked_mul(entry_size)
            .and_then(|rel| rel.checked_add(self.header.section_header_offset))
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or(HeaderRead { index })?;

        self.data()
            .pread_with(offset, LE)
            .map_err(|_: scroll::Error| HeaderRead { index })
    }

    /// Reads the section header at `index` and resolves its name.
    ///
    /// # Errors
    /// - [`crate::Error::OutOfBounds`] if `index` is not below [`BinaryImage::section_count`]
    /// - [`crate::Error::HeaderRead`] if the header cannot be read in full
    pub fn section_header(&self, index: usize) -> Result<SectionDescriptor> {
        if index >= self.section_count {
            return Err(OutOfBounds);
        }

        let header = self.raw_section_header(index)?;
        let name = self.names.get(header.sh_name as usize).unwrap_or_default();

        Ok(SectionDescriptor::new(
            index,
            name,
            &header,
            &self.sandbox_prefix,
        ))
    }

    /// Reads every section header, skipping the ones that cannot be read.
    ///
    /// Returns the descriptors in table order together with the indices that were skipped.
    #[must_use]
    pub fn section_headers_with_skips(&self) -> (Vec<SectionDescriptor>, Vec<usize>) {
        let mut sections = Vec::with_capacity(self.section_count);
        let mut skipped = Vec::new();

        for index in 0..self.section_count {
            match self.section_header(index) {
                Ok(section) => sections.push(section),
                Err(error) => {
                    log::warn!("Failed to read section header {}: {}", index, error);
                    skipped.push(index);
                }
            }
        }

        (sections, skipped)
    }

    /// Reads every section header, skipping the ones that cannot be read.
    #[must_use]
    pub fn section_headers(&self) -> Vec<SectionDescriptor> {
        self.section_headers_with_skips().0
    }

    /// Finds the first section called `name`.
    ///
    /// # Errors
    /// Returns [`crate::Error::SectionNotFound`] if no readable header carries that name.
    pub fn find_section(&self, name: &str) -> Result<SectionDescriptor> {
        (0..self.section_count)
            .filter_map(|index| self.section_header(index).ok())
            .find(|section| section.name == name)
            .ok_or_else(|| SectionNotFound(name.to_string()))
    }

    /// Returns the file offset of the section called `name`.
    ///
    /// # Errors
    /// Returns [`crate::Error::SectionNotFound`] if no such section exists.
    pub fn section_offset(&self, name: &str) -> Result<u64> {
        let section = self.find_section(name)?;
        log::debug!("{} section offset: {:#x}", name, section.file_offset);
        Ok(section.file_offset)
    }

    /// Returns the contents of `section` as stored in the file.
    ///
    /// `SHT_NOBITS` sections have no file contents and yield an empty slice.
    ///
    /// # Errors
    /// Returns [`crate::Error::ShortRead`] if the section extends past the end of the image.
    pub fn section_data(&self, section: &SectionDescriptor) -> Result<&[u8]> {
        if section.is_nobits() {
            return Ok(&[]);
        }

        self.bytes_at(section.file_offset, section.file_size)
            .map_err(|_| ShortRead {
                section: section.name.clone(),
            })
    }

    /// Copies the string table stored in `section`.
    ///
    /// # Errors
    /// Returns [`crate::Error::ShortRead`] if the table extends past the end of the image.
    pub fn string_table(&self, section: &SectionDescriptor) -> Result<StringTable> {
        Ok(StringTable::new(self.section_data(section)?.to_vec()))
    }

    /// Reads the static symbol table.
    ///
    /// `.symtab` and `.strtab` are located by name, the way the toolchain emits them for
    /// statically linked and non-stripped binaries. Returns `Ok(None)` when either table is
    /// missing (stripped binaries). A table that runs past the end of the image is cut after
    /// its last whole entry, with a warning.
    ///
    /// # Errors
    /// Returns [`crate::Error::ShortRead`] if the string table cannot be read.
    pub fn symbol_table(&self) -> Result<Option<Vec<SymbolEntry>>> {
        let mut symtab = None;
        let mut strtab = None;

        for section in (0..self.section_count).filter_map(|index| self.section_header(index).ok())
        {
            match section.name.as_str() {
                ".symtab" => symtab = Some(section),
                ".strtab" => strtab = Some(section),
                _ => {}
            }

            if symtab.is_some() && strtab.is_some() {
                break;
            }
        }

        let (Some(symtab), Some(strtab)) = (symtab, strtab) else {
            log::info!("Symbol table or string table header is missing");
            return Ok(None);
        };

        let strings = self.string_table(&strtab)?;

        let entry_size = if symtab.entry_size >= SIZEOF_SYM as u64 {
            symtab.entry_size
        } else {
            SIZEOF_SYM as u64
        };
        let declared = symtab.file_size / entry_size;
        let readable = (self.len() as u64).saturating_sub(symtab.file_offset) / entry_size;
        let count = declared.min(readable);
        if count < declared {
            log::warn!(
                "Symbol table declares {} entries, only {} fit in the image",
                declared,
                count
            );
        }
        log::debug!("Number of symbols: {}", count);

        if count == 0 {
            return Ok(Some(Vec::new()));
        }

        // every entry of the capped table lies inside the image
        let table = self.bytes_at(symtab.file_offset, count * entry_size)?;
        let symbols = table
            .chunks_exact(entry_size as usize)
            .map(|entry| SymbolEntry::parse(entry, &strings))
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(symbols))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{ElfBuilder, SymbolSpec};
    use goblin::elf::header::EM_X86_64;

    fn sample() -> Vec<u8> {
        ElfBuilder::new()
            .section_at(".text", 0x1000, 0x1000, &[0xC3; 64])
            .section_at(".data", 0x1040, 0x1040, &[0xAB; 16])
            .section_at(".rodata", 0x1050, 0x1050, b"hello\0")
            .nobits(".bss", 0x1060, 32)
            .section_at(".sandbox1", 0x1100, 0x1100, &[0x90; 24])
            .symbol(SymbolSpec::hidden("__dso_handle", 0))
            .symbol(SymbolSpec::global("main", 16))
            .build()
    }

    #[test]
    fn load_buffer() {
        let image = BinaryImage::from_mem(sample()).unwrap();
        assert_eq!(image.header().machine, EM_X86_64);
        assert!(!image.is_empty());

        let names: Vec<String> = image
            .section_headers()
            .into_iter()
            .map(|section| section.name)
            .collect();
        assert_eq!(
            names,
            [
                "",
                ".text",
                ".data",
                ".rodata",
                ".bss",
                ".sandbox1",
                ".symtab",
                ".strtab",
                ".shstrtab"
            ]
        );
    }

    #[test]
    fn load_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), sample()).unwrap();

        let image = BinaryImage::from_file(file.path()).unwrap();
        let text = image.find_section(".text").unwrap();
        assert_eq!(text.file_offset, 0x1000);
        assert_eq!(text.file_size, 64);
        assert_eq!(text.kind, Some(SectionKind::Code));
        assert_eq!(image.section_data(&text).unwrap(), &[0xC3; 64]);
    }

    #[test]
    fn load_invalid() {
        assert!(matches!(BinaryImage::from_mem(vec![]), Err(Empty)));
        assert!(matches!(
            BinaryImage::from_mem(b"MZ\x90\x00".to_vec()),
            Err(crate::Error::NotElf)
        ));
        assert!(matches!(
            BinaryImage::from_file(Path::new("/nonexistent/binary")),
            Err(crate::Error::FileError(_))
        ));
    }

    #[test]
    fn truncated_name_table_is_fatal() {
        let mut image = sample();
        let len = image.len();
        // the section header table sits at the end, the name table right before it
        let header = ElfHeader::parse(&image).unwrap();
        image.truncate(header.section_header_offset as usize - 4);
        assert!(image.len() < len);
        assert!(matches!(BinaryImage::from_mem(image), Err(Truncated)));
    }

    #[test]
    fn short_header_is_skipped() {
        let mut data = sample();
        let header = ElfHeader::parse(&data).unwrap();
        // pretend there is one more section header than the file holds
        let count = header.section_header_count + 1;
        data[60..62].copy_from_slice(&count.to_le_bytes());

        let image = BinaryImage::from_mem(data).unwrap();
        let (sections, skipped) = image.section_headers_with_skips();
        assert_eq!(sections.len(), usize::from(count) - 1);
        assert_eq!(skipped, vec![usize::from(count) - 1]);
        assert!(matches!(
            image.section_header(usize::from(count) - 1),
            Err(HeaderRead { .. })
        ));
        assert!(matches!(
            image.section_header(usize::from(count)),
            Err(OutOfBounds)
        ));
    }

    #[test]
    fn find_and_classify() {
        let image = BinaryImage::from_mem(sample()).unwrap();

        assert_eq!(image.section_offset(".data").unwrap(), 0x1040);
        assert!(matches!(
            image.find_section(".missing"),
            Err(SectionNotFound(name)) if name == ".missing"
        ));

        let bss = image.find_section(".bss").unwrap();
        assert!(bss.is_nobits());
        assert_eq!(bss.kind, Some(SectionKind::ZeroFill));
        assert!(image.section_data(&bss).unwrap().is_empty());

        let custom = image.find_section(".sandbox1").unwrap();
        assert_eq!(custom.kind, Some(SectionKind::SandboxCustom));

        let image = image.with_sandbox_prefix(".isolated");
        let custom = image.find_section(".sandbox1").unwrap();
        assert_eq!(custom.kind, None);
    }

    #[test]
    fn string_tables() {
        let image = BinaryImage::from_mem(sample()).unwrap();
        let strtab = image.find_section(".strtab").unwrap();
        let strings = image.string_table(&strtab).unwrap();
        assert_eq!(strings.get(1).as_deref(), Some("__dso_handle"));
        assert_eq!(image.section_names().get(1).as_deref(), Some(".text"));
    }

    #[test]
    fn symbols() {
        let image = BinaryImage::from_mem(sample()).unwrap();
        let symbols = image.symbol_table().unwrap().unwrap();

        // null symbol first
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols[0].name, "");
        assert_eq!(symbols[1].name, "__dso_handle");
        assert!(symbols[1].is_hidden());
        assert_eq!(symbols[1].size, 0);
        assert_eq!(symbols[2].name, "main");
        assert_eq!(symbols[2].visibility, Visibility::Default);
        assert_eq!(symbols[2].size, 16);
    }

    #[test]
    fn symbol_table_past_end_is_cut() {
        let mut data = sample();
        let image = BinaryImage::from_mem(data.clone()).unwrap();
        let symtab = image.find_section(".symtab").unwrap();
        let header_offset = image.header().section_header_offset as usize
            + symtab.index * usize::from(image.header().section_header_size);
        // sh_size claims far more entries than the file holds
        data[header_offset + 32..header_offset + 40]
            .copy_from_slice(&(1u64 << 40).to_le_bytes());

        let len = data.len() as u64;
        let image = BinaryImage::from_mem(data).unwrap();
        let symbols = image.symbol_table().unwrap().unwrap();

        let whole = (len - symtab.file_offset) / SIZEOF_SYM as u64;
        assert_eq!(symbols.len() as u64, whole);
        assert_eq!(symbols[1].name, "__dso_handle");
        assert_eq!(symbols[2].name, "main");
    }

    #[test]
    fn stripped_image_has_no_symbols() {
        let image =
            BinaryImage::from_mem(ElfBuilder::new().section(".text", &[0x90; 4]).build()).unwrap();
        assert!(image.symbol_table().unwrap().is_none());
    }

    #[test]
    fn short_section_data() {
        let mut data = ElfBuilder::new()
            .section_at(".text", 0x1000, 0x1000, &[0xC3; 64])
            .build();
        // point .text past the end of the file
        let image = BinaryImage::from_mem(data.clone()).unwrap();
        let text = image.find_section(".text").unwrap();
        let header_offset = image.header().section_header_offset as usize
            + text.index * usize::from(image.header().section_header_size);
        data[header_offset + 32..header_offset + 40]
            .copy_from_slice(&0xFFFF_FFFFu64.to_le_bytes());

        let image = BinaryImage::from_mem(data).unwrap();
        let text = image.find_section(".text").unwrap();
        assert!(matches!(
            image.section_data(&text),
            Err(ShortRead { section }) if section == ".text"
        ));
    }
}
