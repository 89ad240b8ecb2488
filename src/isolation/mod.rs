//! Isolated region management, section materialization and capability tables.
//!
//! This module turns a parsed [`crate::BinaryImage`] into a running isolation domain. The
//! pieces, leaves first:
//!
//! - [`mapper`] - The [`Mapper`] seam over `mmap`/`munmap`
//! - [`region`] - Region allocation with LIFO tracking, page alignment math and bound-checked
//!   writes
//! - [`hidden`] - The hidden runtime-support symbol offset
//! - [`capability`] - The capability table and the publication of its base
//! - [`materialize`] - Copying sections into the region and recording their slots
//! - [`config`] - [`LoaderConfig`] and its presets
//! - [`context`] - [`IsolationContext`], which drives a whole load and its teardown
//!
//! # Memory layout
//!
//! ```text
//! base_address                                       base_address + region_size
//! |-- .text --|-- .data --|-- .rodata --|-- .bss --|-------- unused ---------|
//!       ^           ^+hidden     ^            ^
//!    slot 0      slot 1        slot 2      slot 3
//!
//! guard pages (slots 4..4+extra) and sandbox sections (remaining slots) are
//! separate mappings placed by the platform.
//! ```

pub mod capability;
pub mod config;
pub mod context;
pub mod hidden;
pub mod mapper;
pub mod materialize;
pub mod region;

pub use capability::{load_slot, thread_base, CapabilityBase, CapabilityTable, SlotId, ThreadLocalBase};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use capability::SegmentRegister;
pub use config::{LoaderConfig, Placement, PublishMode};
pub use context::{IsolationContext, LoadReport, SkippedSection};
pub use hidden::{compute_hidden_offset, compute_hidden_offset_raw, HiddenOffset};
pub use mapper::{MapPlacement, Mapper, Protection, SystemMapper};
pub use materialize::{Materialized, Materializer};
pub use region::{
    align_down, IsolatedRegion, MappedRegion, PageSpan, RegionAllocator, RegionOffset,
    RegionRequest,
};
