//! Hidden runtime-support symbol resolution.
//!
//! The toolchain places a handful of hidden runtime-support objects at the start of `.data`.
//! Isolated code expects its data slot to point past them, so the loader adds their combined
//! size to slot 1.

use goblin::elf64::sym::SIZEOF_SYM;

use crate::file::{StringTable, SymbolEntry};

/// Hidden symbols that occupy space at the start of the data slot.
pub const RUNTIME_SUPPORT_SYMBOLS: [&str; 7] = [
    "__dso_handle",
    "__TMC_END__",
    "__cxa_atexit",
    "_ITM_deregisterTMCloneTable",
    "_ITM_registerTMCloneTable",
    "__stack_chk_guard",
    "__stack_chk_fail",
];

/// Marks the end of the transactional clone table; recognized but contributes nothing.
pub const TLS_END_MARKER: &str = "__TMC_END__";

/// Bytes one recognized runtime-support symbol adds to the data slot.
pub const SUPPORT_SLOT_SIZE: u64 = 8;

/// Byte count added to the data slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HiddenOffset(pub u64);

impl HiddenOffset {
    /// No adjustment.
    pub const ZERO: HiddenOffset = HiddenOffset(0);

    /// Returns the offset in bytes.
    #[must_use]
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HiddenOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Returns `true` for names in [`RUNTIME_SUPPORT_SYMBOLS`].
#[must_use]
pub fn is_runtime_support_symbol(name: &str) -> bool {
    RUNTIME_SUPPORT_SYMBOLS.contains(&name)
}

/// Size a hidden symbol occupies; symbols without a recorded size count as one pointer.
#[must_use]
pub fn hidden_footprint(symbol: &SymbolEntry) -> u64 {
    if symbol.size == 0 {
        SUPPORT_SLOT_SIZE
    } else {
        symbol.size
    }
}

/// Sums the contribution of every recognized hidden symbol.
#[must_use]
pub fn compute_hidden_offset(symbols: &[SymbolEntry]) -> HiddenOffset {
    let mut offset = 0u64;

    for symbol in symbols.iter().filter(|symbol| symbol.is_hidden()) {
        let footprint = hidden_footprint(symbol);
        if symbol.size == 0 {
            log::debug!(
                "Hidden symbol {} has no size, assuming {} bytes",
                symbol.name,
                footprint
            );
        }

        if !is_runtime_support_symbol(&symbol.name) {
            log::warn!(
                "Unrecognized hidden symbol {} ({} bytes) ignored",
                symbol.name,
                footprint
            );
            continue;
        }

        log::debug!(
            "Hidden runtime support symbol {} ({} bytes)",
            symbol.name,
            footprint
        );
        if symbol.name != TLS_END_MARKER {
            offset += SUPPORT_SLOT_SIZE;
        }
    }

    log::debug!("Hidden symbol offset: {}", offset);
    HiddenOffset(offset)
}

/// Same as [`compute_hidden_offset`], reading entries straight from raw `.symtab` bytes.
///
/// Trailing bytes that do not form a whole entry are ignored.
#[must_use]
pub fn compute_hidden_offset_raw(symtab: &[u8], strtab: &StringTable) -> HiddenOffset {
    let symbols: Vec<SymbolEntry> = symtab
        .chunks_exact(SIZEOF_SYM)
        .filter_map(|entry| SymbolEntry::parse(entry, strtab).ok())
        .collect();

    compute_hidden_offset(&symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file::Visibility,
        test::{ElfBuilder, SymbolSpec},
        BinaryImage,
    };

    fn symbol(name: &str, visibility: Visibility, size: u64) -> SymbolEntry {
        SymbolEntry {
            name: name.to_string(),
            visibility,
            size,
            section_index: 2,
            value: 0,
        }
    }

    #[test]
    fn one_recognized_symbol() {
        let symbols = [symbol("__dso_handle", Visibility::Hidden, 0)];
        assert_eq!(compute_hidden_offset(&symbols), HiddenOffset(8));
    }

    #[test]
    fn tmc_end_contributes_nothing() {
        let symbols = [symbol("__TMC_END__", Visibility::Hidden, 0)];
        assert_eq!(compute_hidden_offset(&symbols), HiddenOffset::ZERO);
    }

    #[test]
    fn size_does_not_change_contribution() {
        let symbols = [
            symbol("__stack_chk_guard", Visibility::Hidden, 32),
            symbol("__cxa_atexit", Visibility::Hidden, 0),
            symbol("__TMC_END__", Visibility::Hidden, 8),
        ];
        assert_eq!(compute_hidden_offset(&symbols), HiddenOffset(16));
        assert_eq!(hidden_footprint(&symbols[0]), 32);
        assert_eq!(hidden_footprint(&symbols[1]), 8);
    }

    #[test]
    fn ignores_visible_and_unknown_symbols() {
        let symbols = [
            symbol("__dso_handle", Visibility::Default, 0),
            symbol("helper", Visibility::Hidden, 16),
            symbol("__dso_handle", Visibility::Protected, 0),
        ];
        assert_eq!(compute_hidden_offset(&symbols), HiddenOffset::ZERO);
        assert_eq!(compute_hidden_offset(&[]), HiddenOffset::ZERO);
    }

    #[test]
    fn every_support_symbol() {
        let symbols: Vec<SymbolEntry> = RUNTIME_SUPPORT_SYMBOLS
            .iter()
            .map(|name| symbol(name, Visibility::Hidden, 0))
            .collect();
        let expected = (RUNTIME_SUPPORT_SYMBOLS.len() as u64 - 1) * SUPPORT_SLOT_SIZE;
        assert_eq!(compute_hidden_offset(&symbols), HiddenOffset(expected));
        assert!(is_runtime_support_symbol(TLS_END_MARKER));
        assert!(!is_runtime_support_symbol("main"));
    }

    #[test]
    fn raw_and_parsed_agree() {
        let data = ElfBuilder::new()
            .section(".data", &[0; 32])
            .symbol(SymbolSpec::hidden("__dso_handle", 0))
            .symbol(SymbolSpec::hidden("__TMC_END__", 0))
            .symbol(SymbolSpec::hidden("_ITM_registerTMCloneTable", 0))
            .symbol(SymbolSpec::global("main", 4))
            .build();
        let image = BinaryImage::from_mem(data).unwrap();

        let symbols = image.symbol_table().unwrap().unwrap();
        assert_eq!(compute_hidden_offset(&symbols), HiddenOffset(16));

        let symtab = image.find_section(".symtab").unwrap();
        let strtab = image.find_section(".strtab").unwrap();
        let strings = image.string_table(&strtab).unwrap();
        let raw = image.section_data(&symtab).unwrap();
        assert_eq!(compute_hidden_offset_raw(raw, &strings), HiddenOffset(16));
        // drops `main`, cuts `_ITM_registerTMCloneTable` short
        assert_eq!(
            compute_hidden_offset_raw(&raw[..raw.len() - SIZEOF_SYM - 1], &strings),
            HiddenOffset(8)
        );
    }
}
