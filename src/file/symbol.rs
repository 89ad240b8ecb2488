//! Symbol table entries.

use goblin::elf::sym::{STV_DEFAULT, STV_HIDDEN, STV_INTERNAL, STV_PROTECTED};
use goblin::elf64::sym::Sym;
use scroll::{Pread, LE};

use crate::{file::StringTable, Error::OutOfBounds, Result};

/// Symbol visibility taken from the low bits of `st_other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Visibility {
    /// Visible according to the symbol binding
    Default,
    /// Processor-specific hidden variant
    Internal,
    /// Not visible outside the component; runtime support symbols use this
    Hidden,
    /// Visible but not preemptible
    Protected,
}

impl Visibility {
    /// Decodes the visibility from a symbol's `st_other` byte.
    #[must_use]
    pub fn from_other(other: u8) -> Visibility {
        match other & 0x3 {
            STV_DEFAULT => Visibility::Default,
            STV_INTERNAL => Visibility::Internal,
            STV_HIDDEN => Visibility::Hidden,
            STV_PROTECTED => Visibility::Protected,
            _ => unreachable!("visibility is a two bit field"),
        }
    }
}

/// A symbol with its name resolved through the string table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Resolved symbol name, empty for unnamed entries
    pub name: String,
    /// Decoded visibility
    pub visibility: Visibility,
    /// Declared size in bytes, zero when the toolchain did not record one
    pub size: u64,
    /// Index of the section the symbol is defined in
    pub section_index: u16,
    /// Symbol value
    pub value: u64,
}

impl SymbolEntry {
    /// Decodes the symbol entry at the start of `data` and resolves its name in `strings`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than one entry.
    pub fn parse(data: &[u8], strings: &StringTable) -> Result<SymbolEntry> {
        let symbol: Sym = data.pread_with(0, LE).map_err(|_| OutOfBounds)?;

        Ok(SymbolEntry {
            name: strings.get(symbol.st_name as usize).unwrap_or_default(),
            visibility: Visibility::from_other(symbol.st_other),
            size: symbol.st_size,
            section_index: symbol.st_shndx,
            value: symbol.st_value,
        })
    }

    /// Returns `true` for symbols with hidden visibility.
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.visibility == Visibility::Hidden
    }
}
