// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// unsafe code is confined to:
// - 'file/physical.rs' maps the image into memory
// - 'isolation/mapper.rs' issues mmap/munmap
// - 'isolation/region.rs' writes into validated ranges of a mapping
// - 'isolation/capability.rs' reads and writes the GS base

//! # sfiloader
//!
//! A software-fault-isolation loader for ELF64 x86_64 binaries.
//!
//! `sfiloader` extracts the code and data sections of a compiled binary, copies them into a
//! dedicated isolated memory region at a fixed address, and publishes a per-domain
//! **capability table**. Isolated code reaches its memory through that table: it reads the
//! table base from a per-thread location (the GS segment base on x86_64 Linux) and loads the
//! slot it needs, so it can only reach what it was granted.
//!
//! ## Features
//!
//! - **Resilient ELF reading** - Every header is read at its absolute offset; one broken
//!   header never stops the scan
//! - **Bound-checked materialization** - No byte is copied before its destination is known
//!   to lie inside the isolated region
//! - **No leaked mappings** - Every mapping is tracked and released in reverse order, also
//!   when setup fails half-way
//! - **One parameterized loader** - Extended and legacy variants are presets of
//!   [`LoaderConfig`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sfiloader::prelude::*;
//!
//! let mut context = IsolationContext::new(LoaderConfig::extended())?;
//! let report = context.init("/proc/self/exe".as_ref())?;
//!
//! for placed in &report.materialized {
//!     println!("{:<12} -> {:#x} ({})", placed.section, placed.address, placed.slot);
//! }
//! for skipped in &report.skipped {
//!     println!("{:<12} skipped: {}", skipped.name, skipped.error);
//! }
//!
//! context.teardown()?;
//! # Ok::<(), sfiloader::Error>(())
//! ```
//!
//! ### Reading an image without loading it
//!
//! ```rust,no_run
//! use sfiloader::BinaryImage;
//!
//! let image = BinaryImage::from_file("/proc/self/exe".as_ref())?;
//! for section in image.section_headers() {
//!     if let Some(kind) = section.kind {
//!         println!("{} is {}", section.name, kind);
//!     }
//! }
//! # Ok::<(), sfiloader::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`file`] - ELF header, section and symbol table parsing over a memory-mapped or
//!   in-memory image
//! - [`isolation`] - Region allocation, materialization, hidden symbol offset, capability
//!   tables and the [`IsolationContext`] that drives them
//! - [`prelude`] - Re-exports of the commonly used types
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! The library reports through the [`log`] facade and never installs a logger. The `sfi-load`
//! binary installs `env_logger`; set `RUST_LOG=sfiloader=debug` for per-section detail.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use sfiloader::prelude::*;
///
/// let image = BinaryImage::from_file("/proc/self/exe".as_ref())?;
/// let text = image.find_section(".text")?;
/// assert_eq!(text.kind, Some(SectionKind::Code));
/// # Ok::<(), sfiloader::Error>(())
/// ```
pub mod prelude;

/// ELF64 image access
///
/// Parses the file header, the section header table, string tables and the symbol table of
/// an ELF64 little-endian image.
///
/// # Key Types
///
/// - [`file::BinaryImage`] - An opened and validated image
/// - [`file::SectionDescriptor`] - A section with resolved name and classified kind
/// - [`file::SymbolEntry`] - A symbol with resolved name and visibility
pub mod file;

/// Isolation domains
///
/// Turns a [`BinaryImage`] into an isolated region plus a published capability table.
///
/// # Key Types
///
/// - [`isolation::IsolationContext`] - Owns one domain from `init` to `teardown`
/// - [`isolation::RegionAllocator`] - Tracks every mapping for LIFO release
/// - [`isolation::CapabilityTable`] - The slot array isolated code reads
/// - [`isolation::LoaderConfig`] - Base address, region size, placement and presets
pub mod isolation;

/// `sfiloader` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `sfiloader` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use sfiloader::{BinaryImage, Error};
///
/// match BinaryImage::from_file(std::path::Path::new("/bin/true")) {
///     Ok(image) => println!("{} sections", image.section_count()),
///     Err(Error::NotSupported) => println!("not a 64-bit little-endian image"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// An opened ELF64 image.
///
/// See [`file::BinaryImage`].
pub use file::BinaryImage;

/// Owner of one isolation domain.
///
/// See [`isolation::IsolationContext`].
pub use isolation::{IsolationContext, LoadReport, LoaderConfig, SlotId};
