//! Isolated region allocation and placement math.
//!
//! The [`RegionAllocator`] owns every mapping the loader creates and remembers them in a
//! tracking list, in creation order. Teardown walks that list backwards, so every mapping can
//! be found and released even when initialization stopped half-way.
//!
//! An [`IsolatedRegion`] is a view on one tracked mapping that only accepts writes through a
//! [`RegionOffset`]. A `RegionOffset` can only be obtained from [`IsolatedRegion::offset_for`],
//! which checks the complete extent against the region bound, so no byte is ever copied before
//! its destination is known to be inside the region.

use crate::{
    isolation::mapper::{MapPlacement, Mapper, Protection},
    Error, Result,
};

/// Rounds `offset` down to a multiple of `page_size`.
///
/// `page_size` must be non-zero.
#[must_use]
pub fn align_down(offset: u64, page_size: u64) -> u64 {
    (offset / page_size) * page_size
}

/// Page-aligned window over a byte range whose start is not page-aligned.
///
/// A mapping of `length` bytes taken at `aligned_offset` contains the original range starting
/// `lead` bytes into the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// `offset` rounded down to the page size
    pub aligned_offset: u64,
    /// Distance from the aligned start to the first byte of the range
    pub lead: u64,
    /// Bytes to map so the whole range is covered
    pub length: u64,
}

impl PageSpan {
    /// Computes the span covering `size` bytes at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailed`] if the page size is zero or the length
    /// overflows.
    pub fn new(offset: u64, size: u64, page_size: u64) -> Result<PageSpan> {
        if page_size == 0 {
            return Err(Error::AllocationFailed("page size is zero".to_string()));
        }

        let aligned_offset = align_down(offset, page_size);
        let lead = offset - aligned_offset;
        let length = size.checked_add(lead).ok_or_else(|| {
            Error::AllocationFailed(format!("span of {:#x} bytes overflows", size))
        })?;

        Ok(PageSpan {
            aligned_offset,
            lead,
            length,
        })
    }
}

/// A live mapping created by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Page-aligned start of the mapping
    pub base_address: usize,
    /// Mapped length in bytes, including alignment padding
    pub length: usize,
}

impl MappedRegion {
    /// Returns the first address past the mapping.
    #[must_use]
    pub fn end(&self) -> usize {
        self.base_address + self.length
    }
}

/// One planned reservation of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    /// Placement of the mapping
    pub placement: MapPlacement,
    /// Length in bytes
    pub length: usize,
    /// Access rights
    pub protection: Protection,
}

/// Reserves mappings and keeps the LIFO record used to release them.
pub struct RegionAllocator {
    mapper: Box<dyn Mapper>,
    tracked: Vec<MappedRegion>,
}

impl std::fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("tracked", &self.tracked)
            .finish()
    }
}

impl RegionAllocator {
    /// Creates an allocator on top of `mapper`.
    #[must_use]
    pub fn new(mapper: Box<dyn Mapper>) -> RegionAllocator {
        RegionAllocator {
            mapper,
            tracked: Vec::new(),
        }
    }

    /// Returns the page size of the underlying mapper.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.mapper.page_size()
    }

    /// Returns the live mappings in creation order.
    #[must_use]
    pub fn tracked(&self) -> &[MappedRegion] {
        &self.tracked
    }

    fn map(&mut self, request: RegionRequest) -> Result<MappedRegion> {
        if request.length == 0 {
            return Err(Error::AllocationFailed(
                "zero-length reservation".to_string(),
            ));
        }

        let base_address = self
            .mapper
            .map(request.placement, request.length, request.protection)?;
        let region = MappedRegion {
            base_address,
            length: request.length,
        };
        self.tracked.push(region);

        log::debug!(
            "Mapped {:#x} bytes at {:#x} ({:?})",
            region.length,
            region.base_address,
            request.protection
        );

        Ok(region)
    }

    /// Reserves `size` bytes exactly at `preferred_base`.
    ///
    /// # Errors
    /// - [`crate::Error::AllocationFailed`] if `preferred_base` is not page-aligned or `size`
    ///   is zero
    /// - [`crate::Error::MapFailed`] if the address range is not available
    pub fn reserve(
        &mut self,
        preferred_base: usize,
        size: usize,
        protection: Protection,
    ) -> Result<MappedRegion> {
        if preferred_base % self.page_size() != 0 {
            return Err(Error::AllocationFailed(format!(
                "base address {:#x} is not page-aligned",
                preferred_base
            )));
        }

        self.map(RegionRequest {
            placement: MapPlacement::Fixed(preferred_base),
            length: size,
            protection,
        })
    }

    /// Reserves `size` bytes wherever the platform chooses, in the low 2 GiB if `low` is set.
    ///
    /// # Errors
    /// Returns [`crate::Error::MapFailed`] if the platform refuses the request.
    pub fn reserve_anywhere(
        &mut self,
        size: usize,
        protection: Protection,
        low: bool,
    ) -> Result<MappedRegion> {
        let placement = if low {
            MapPlacement::Low
        } else {
            MapPlacement::Anywhere
        };

        self.map(RegionRequest {
            placement,
            length: size,
            protection,
        })
    }

    /// Reserves every request or none of them.
    ///
    /// If request `i` fails, the mappings of requests `0..i` are released again (newest
    /// first) before the error is returned.
    ///
    /// # Errors
    /// Returns the error of the first failing request.
    pub fn reserve_batch(&mut self, requests: &[RegionRequest]) -> Result<Vec<MappedRegion>> {
        let mut reserved = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            match self.map(*request) {
                Ok(region) => reserved.push(region),
                Err(error) => {
                    log::error!(
                        "Reservation {} of {} failed, rolling back: {}",
                        index,
                        requests.len(),
                        error
                    );
                    for region in reserved.iter().rev() {
                        if let Err(unmap_error) = self.release(*region) {
                            log::error!("{}", unmap_error);
                        }
                    }
                    return Err(error);
                }
            }
        }

        Ok(reserved)
    }

    /// Releases one tracked mapping and forgets it.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnmapFailed`] if the platform rejects the request; the mapping
    /// is forgotten either way.
    pub fn release(&mut self, region: MappedRegion) -> Result<()> {
        if let Some(position) = self.tracked.iter().rposition(|tracked| *tracked == region) {
            self.tracked.remove(position);
        }

        self.mapper.unmap(region.base_address, region.length)
    }

    /// Releases every tracked mapping, newest first, and empties the tracking list.
    ///
    /// Failures do not stop the walk; they are logged and returned.
    pub fn release_all(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();

        while let Some(region) = self.tracked.pop() {
            match self.mapper.unmap(region.base_address, region.length) {
                Ok(()) => log::debug!(
                    "Unmapped {:#x} bytes at {:#x}",
                    region.length,
                    region.base_address
                ),
                Err(error) => {
                    log::error!("{}", error);
                    errors.push(error);
                }
            }
        }

        errors
    }
}

/// A validated byte range inside an [`IsolatedRegion`].
///
/// The range remembers the bounds of the region that validated it and is rejected by any
/// other region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOffset {
    base: usize,
    limit: usize,
    start: usize,
    len: usize,
}

impl RegionOffset {
    /// Distance from the region base to the first byte.
    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Length of the range in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Writable view on a tracked mapping with an enforced upper bound.
///
/// Only the loader creates regions, from mappings it reserved itself. The view does not own
/// the mapping; the [`RegionAllocator`] releases it during teardown, and the owner drops the
/// view at the same time.
#[derive(Debug)]
pub struct IsolatedRegion {
    mapping: MappedRegion,
}

impl IsolatedRegion {
    /// Wraps a live mapping that was created readable and writable.
    pub(crate) fn new(mapping: MappedRegion) -> IsolatedRegion {
        IsolatedRegion { mapping }
    }

    /// Returns the underlying mapping.
    #[must_use]
    pub fn mapping(&self) -> MappedRegion {
        self.mapping
    }

    /// Returns the base address of the region.
    #[must_use]
    pub fn base(&self) -> usize {
        self.mapping.base_address
    }

    /// Returns the first address past the region.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.mapping.end()
    }

    /// Returns the absolute address of a validated range.
    #[must_use]
    pub fn address(&self, offset: RegionOffset) -> usize {
        self.base() + offset.start
    }

    /// Validates that `len` bytes starting `start` bytes into the region stay inside it.
    ///
    /// # Errors
    /// Returns [`crate::Error::BoundsViolation`] naming `section` if the range ends past the
    /// region bound.
    pub fn offset_for(&self, section: &str, start: u64, len: u64) -> Result<RegionOffset> {
        let limit = self.limit() as u64;
        let end = (self.base() as u64)
            .checked_add(start)
            .and_then(|address| address.checked_add(len));

        match end {
            Some(end) if end <= limit => Ok(RegionOffset {
                base: self.base(),
                limit: self.limit(),
                start: start as usize,
                len: len as usize,
            }),
            _ => Err(Error::BoundsViolation {
                section: section.to_string(),
                end: end.unwrap_or(u64::MAX),
                limit,
            }),
        }
    }

    // Start address of `offset`, once it is known to belong to this region
    fn checked(&self, offset: RegionOffset) -> Result<*mut u8> {
        let inside = offset.base == self.base()
            && offset.limit == self.limit()
            && offset
                .start
                .checked_add(offset.len)
                .is_some_and(|end| end <= self.mapping.length);
        if !inside {
            return Err(Error::OutOfBounds);
        }

        Ok(self.address(offset) as *mut u8)
    }

    /// Copies `bytes` into the validated range.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `bytes` does not have the validated length or
    /// `offset` was validated by another region.
    pub fn write(&self, offset: RegionOffset, bytes: &[u8]) -> Result<()> {
        if bytes.len() != offset.len {
            return Err(Error::OutOfBounds);
        }
        let target = self.checked(offset)?;

        // The range lies inside this mapping, which stays writable while the view exists.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), target, offset.len);
        }

        Ok(())
    }

    /// Zeroes the validated range.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` was validated by another region.
    pub fn zero(&self, offset: RegionOffset) -> Result<()> {
        let target = self.checked(offset)?;
        unsafe {
            std::ptr::write_bytes(target, 0, offset.len);
        }
        Ok(())
    }

    /// Returns the current contents of the validated range.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` was validated by another region.
    pub fn bytes(&self, offset: RegionOffset) -> Result<&[u8]> {
        let source = self.checked(offset)?;
        Ok(unsafe { std::slice::from_raw_parts(source as *const u8, offset.len) })
    }
}
