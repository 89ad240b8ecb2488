//! # sfiloader Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the sfiloader library.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all sfiloader operations
pub use crate::Error;

/// The result type used throughout sfiloader
pub use crate::Result;

// ================================================================================================
// Binary Image
// ================================================================================================

/// Opened ELF image and its structural views
pub use crate::file::{
    BinaryImage, ElfHeader, SectionDescriptor, SectionKind, StringTable, SymbolEntry, Visibility,
};

// ================================================================================================
// Isolation
// ================================================================================================

/// Driving a load
pub use crate::isolation::{IsolationContext, LoadReport, LoaderConfig, Placement, PublishMode};

/// Capability table and its publication
pub use crate::isolation::{load_slot, CapabilityBase, CapabilityTable, SlotId};

/// Regions and mapping
pub use crate::isolation::{MappedRegion, Mapper, Protection, RegionAllocator};

/// Hidden symbol offset
pub use crate::isolation::HiddenOffset;
