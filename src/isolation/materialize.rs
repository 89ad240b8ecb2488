//! Section materialization.
//!
//! Copies section contents into the isolated region and records where they landed in the
//! capability table. Every section goes through the same four steps: read the bytes from the
//! image, compute the target, validate the target against the region bound, copy. A section
//! that fails any step is not copied and its slot is left untouched.

use crate::{
    file::{BinaryImage, SectionDescriptor, SectionKind},
    isolation::{
        capability::{CapabilityTable, SlotId},
        config::{Placement, DEFAULT_REGION_SIZE},
        hidden::HiddenOffset,
        mapper::Protection,
        region::{IsolatedRegion, MappedRegion, PageSpan, RegionAllocator},
    },
    Error, Result,
};

/// Where one section ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// Section name
    pub section: String,
    /// Section role
    pub kind: SectionKind,
    /// Address of the first byte of the section
    pub address: usize,
    /// Number of bytes written
    pub length: usize,
    /// Slot that received the address
    pub slot: SlotId,
}

/// Copies the sections of one image.
#[derive(Debug)]
pub struct Materializer<'a> {
    image: &'a BinaryImage,
    placement: Placement,
    hidden_offset: HiddenOffset,
    region_size: usize,
}

impl<'a> Materializer<'a> {
    /// Creates a materializer for `image`.
    ///
    /// `hidden_offset` is added to the address recorded for `.data`. Sandbox sections are
    /// limited to [`DEFAULT_REGION_SIZE`] until [`Materializer::with_region_size`] says
    /// otherwise.
    #[must_use]
    pub fn new(
        image: &'a BinaryImage,
        placement: Placement,
        hidden_offset: HiddenOffset,
    ) -> Materializer<'a> {
        Materializer {
            image,
            placement,
            hidden_offset,
            region_size: DEFAULT_REGION_SIZE,
        }
    }

    /// Sets the largest mapping a sandbox section may occupy, lead bytes included.
    #[must_use]
    pub fn with_region_size(mut self, region_size: usize) -> Materializer<'a> {
        self.region_size = region_size;
        self
    }

    fn kind_of(section: &SectionDescriptor) -> Result<SectionKind> {
        section.kind.ok_or_else(|| {
            malformed_error!("Section {} is not an isolated section", section.name)
        })
    }

    /// Copies one of the four canonical sections into `region` and records it.
    ///
    /// `.bss` has no file contents; its range is zeroed.
    ///
    /// # Errors
    /// - [`crate::Error::ShortRead`] if the image is shorter than the section
    /// - [`crate::Error::BoundsViolation`] if the section would cross the region bound
    /// - [`crate::Error::Malformed`] for sections without a reserved slot
    pub fn materialize(
        &self,
        section: &SectionDescriptor,
        region: &IsolatedRegion,
        table: &mut CapabilityTable,
    ) -> Result<Materialized> {
        let kind = Self::kind_of(section)?;
        let slot = SlotId::for_kind(kind).ok_or_else(|| {
            malformed_error!("Section {} has no reserved slot", section.name)
        })?;

        let bytes = self.image.section_data(section)?;

        let start = match self.placement {
            Placement::VirtualAddress => section.virtual_address_hint,
            Placement::FileOffset => section.file_offset,
        };
        let target = region.offset_for(&section.name, start, section.file_size)?;

        if kind == SectionKind::ZeroFill || section.is_nobits() {
            region.zero(target)?;
        } else {
            region.write(target, bytes)?;
        }

        let address = region.address(target);
        let recorded = if kind == SectionKind::Data {
            address + self.hidden_offset.bytes() as usize
        } else {
            address
        };
        table.assign(slot, recorded)?;

        log::debug!(
            "Materialized {} ({} bytes) at {:#x}, {} = {:#x}",
            section.name,
            target.len(),
            address,
            slot,
            recorded
        );

        Ok(Materialized {
            section: section.name.clone(),
            kind,
            address,
            length: target.len(),
            slot,
        })
    }

    /// Maps a sandbox section into a fresh region and appends its address to the table.
    ///
    /// The mapping starts at the page boundary below the section's file offset so that the
    /// section keeps its offset within the page; the recorded address is its first byte. A
    /// section whose mapping would exceed the region size is dropped before anything is mapped,
    /// and a mapping whose section cannot be recorded is released again.
    ///
    /// # Errors
    /// - [`crate::Error::ShortRead`] if the image is shorter than the section
    /// - [`crate::Error::BoundsViolation`] if the mapping would exceed the region size
    /// - [`crate::Error::MapFailed`] if the region cannot be mapped
    /// - [`crate::Error::AllocationFailed`] if the table has no room left
    pub fn materialize_custom(
        &self,
        section: &SectionDescriptor,
        allocator: &mut RegionAllocator,
        table: &mut CapabilityTable,
        low: bool,
    ) -> Result<Materialized> {
        let bytes = self.image.section_data(section)?;

        let page_size = allocator.page_size() as u64;
        let span = PageSpan::new(section.file_offset, bytes.len() as u64, page_size)?;
        if span.length > self.region_size as u64 {
            return Err(Error::BoundsViolation {
                section: section.name.clone(),
                end: span.length,
                limit: self.region_size as u64,
            });
        }
        let length = usize::try_from(span.length.max(1)).map_err(|_| {
            Error::AllocationFailed(format!("section {} is too large", section.name))
        })?;

        let mapping = allocator.reserve_anywhere(length, Protection::RW, low)?;
        let (address, slot) = match Self::record_custom(section, mapping, span.lead, bytes, table)
        {
            Ok(placed) => placed,
            Err(error) => {
                if let Err(unmap_error) = allocator.release(mapping) {
                    log::error!("{}", unmap_error);
                }
                return Err(error);
            }
        };

        log::debug!(
            "Materialized sandbox section {} ({} bytes, lead {}) at {:#x}, {}",
            section.name,
            bytes.len(),
            span.lead,
            address,
            slot
        );

        Ok(Materialized {
            section: section.name.clone(),
            kind: SectionKind::SandboxCustom,
            address,
            length: bytes.len(),
            slot,
        })
    }

    fn record_custom(
        section: &SectionDescriptor,
        mapping: MappedRegion,
        lead: u64,
        bytes: &[u8],
        table: &mut CapabilityTable,
    ) -> Result<(usize, SlotId)> {
        let region = IsolatedRegion::new(mapping);
        let target = region.offset_for(&section.name, lead, bytes.len() as u64)?;
        region.write(target, bytes)?;

        let address = region.address(target);
        let slot = table.push(address)?;
        Ok((address, slot))
    }
}
