//! Loader configuration
//!
//! One parameterized loader covers the supported variants: the extended loader (hidden symbol
//! resolution, sandbox sections, guard pages) and the legacy loader (low addresses,
//! content-addressed placement, no symbol handling).

use crate::{
    file::DEFAULT_SANDBOX_PREFIX,
    isolation::{mapper::Protection, region::align_down},
    Error, Result,
};

/// Default fixed base of the isolated region.
pub const DEFAULT_BASE_ADDRESS: usize = 0x1000_0000_0000;

/// Default size of the isolated region (1 MiB).
pub const DEFAULT_REGION_SIZE: usize = 0x10_0000;

/// Default number of guard-page slots after the reserved slots.
pub const DEFAULT_EXTRA_SLOTS: usize = 10;

/// Base used by the legacy loader, inside the low 2 GiB.
pub const LEGACY_BASE_ADDRESS: usize = 0x4000_0000;

/// How a section's position inside the isolated region is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
pub enum Placement {
    /// `base + virtual address` assigned by the linker
    #[default]
    #[strum(serialize = "va")]
    VirtualAddress,
    /// `base + file offset`, the content-addressed variant
    #[strum(serialize = "offset")]
    FileOffset,
}

/// Where the capability table base is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum PublishMode {
    /// GS segment base (x86_64 Linux only)
    #[strum(serialize = "register")]
    Register,
    /// Guarded thread-local slot
    #[strum(serialize = "thread-local")]
    ThreadLocal,
}

impl Default for PublishMode {
    fn default() -> Self {
        if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            PublishMode::Register
        } else {
            PublishMode::ThreadLocal
        }
    }
}

/// Configuration for one isolation domain.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct LoaderConfig {
    /// Fixed address of the isolated region, page-aligned
    pub base_address: usize,

    /// Size of the isolated region in bytes; every materialized section must end below
    /// `base_address + region_size`
    pub region_size: usize,

    /// Access rights of the isolated region
    pub region_protection: Protection,

    /// Number of guard-page slots following the reserved slots
    pub extra_slots: usize,

    /// How section targets are computed
    pub placement: Placement,

    /// Add the hidden runtime-support symbol size to the data slot
    pub resolve_hidden_symbols: bool,

    /// Name prefix marking sandbox sections; empty disables sandbox sections
    pub sandbox_prefix: String,

    /// Keep guard pages and sandbox sections inside the low 2 GiB
    pub low_mappings: bool,

    /// Where the table base is published
    pub publish: PublishMode,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            region_size: DEFAULT_REGION_SIZE,
            region_protection: Protection::RWX,
            extra_slots: DEFAULT_EXTRA_SLOTS,
            placement: Placement::VirtualAddress,
            resolve_hidden_symbols: true,
            sandbox_prefix: DEFAULT_SANDBOX_PREFIX.to_string(),
            low_mappings: false,
            publish: PublishMode::default(),
        }
    }
}

impl LoaderConfig {
    /// The extended loader: hidden symbols, sandbox sections and guard pages.
    #[must_use]
    pub fn extended() -> Self {
        Self::default()
    }

    /// The legacy loader
    ///
    /// Places the region in the low 2 GiB, derives targets from file offsets and skips
    /// hidden symbol resolution.
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            base_address: LEGACY_BASE_ADDRESS,
            placement: Placement::FileOffset,
            resolve_hidden_symbols: false,
            low_mappings: true,
            ..Self::default()
        }
    }

    /// The extended loader at `base_address`, publishing through the thread-local slot.
    ///
    /// Thread-local publication keeps concurrently running tests from sharing a register.
    #[must_use]
    pub fn for_testing(base_address: usize) -> Self {
        Self {
            base_address,
            publish: PublishMode::ThreadLocal,
            ..Self::default()
        }
    }

    /// Checks the configuration against `page_size`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailed`] for a zero or unaligned base or size, or a
    /// region that wraps the address space.
    pub fn validate(&self, page_size: usize) -> Result<()> {
        if page_size == 0 {
            return Err(Error::AllocationFailed("page size is zero".into()));
        }
        if self.base_address == 0 {
            return Err(Error::AllocationFailed("base address is zero".into()));
        }
        if self.region_size == 0 {
            return Err(Error::AllocationFailed("region size is zero".into()));
        }
        if align_down(self.base_address as u64, page_size as u64) != self.base_address as u64 {
            return Err(Error::AllocationFailed(format!(
                "base address {:#x} is not aligned to {:#x}",
                self.base_address, page_size
            )));
        }
        if align_down(self.region_size as u64, page_size as u64) != self.region_size as u64 {
            return Err(Error::AllocationFailed(format!(
                "region size {:#x} is not a multiple of {:#x}",
                self.region_size, page_size
            )));
        }
        if self.base_address.checked_add(self.region_size).is_none() {
            return Err(Error::AllocationFailed(format!(
                "region {:#x}+{:#x} wraps the address space",
                self.base_address, self.region_size
            )));
        }

        Ok(())
    }
}
