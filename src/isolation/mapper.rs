//! Platform memory mapping.
//!
//! [`Mapper`] is the seam between the allocator's bookkeeping and the operating system. The
//! production implementation, [`SystemMapper`], issues anonymous private `mmap` requests and
//! never replaces an existing mapping: a fixed request that the kernel cannot honour exactly
//! is released again and reported as [`crate::Error::MapFailed`].

use bitflags::bitflags;

use crate::{Error, Result};

bitflags! {
    /// Access rights requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: i32 {
        /// Pages may be read
        const READ = libc::PROT_READ;
        /// Pages may be written
        const WRITE = libc::PROT_WRITE;
        /// Pages may be executed
        const EXEC = libc::PROT_EXEC;
    }
}

impl Protection {
    /// Read and write access, used for guard pages and sandbox sections.
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);
    /// Read, write and execute access, used for the isolated region.
    pub const RWX: Protection = Protection::RW.union(Protection::EXEC);
}

/// Where a mapping should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPlacement {
    /// Exactly at this address; fails instead of moving or replacing
    Fixed(usize),
    /// Wherever the platform chooses
    Anywhere,
    /// Anywhere inside the low 2 GiB, so the address fits into 32 bits
    Low,
}

/// Creates and destroys anonymous memory mappings.
pub trait Mapper {
    /// Maps `length` bytes of zeroed memory and returns the base address.
    ///
    /// # Errors
    /// Returns [`crate::Error::MapFailed`] if the platform refuses the request or cannot honour
    /// a [`MapPlacement::Fixed`] address.
    fn map(&mut self, placement: MapPlacement, length: usize, protection: Protection)
        -> Result<usize>;

    /// Releases a mapping previously returned by [`Mapper::map`].
    ///
    /// # Errors
    /// Returns [`crate::Error::UnmapFailed`] if the platform rejects the request.
    fn unmap(&mut self, address: usize, length: usize) -> Result<()>;

    /// Returns the platform page size in bytes.
    fn page_size(&self) -> usize;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const FIXED_FLAGS: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const FIXED_FLAGS: libc::c_int = 0;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const LOW_FLAGS: libc::c_int = libc::MAP_32BIT;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const LOW_FLAGS: libc::c_int = 0;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// [`Mapper`] backed by `mmap(2)` and `munmap(2)`.
#[derive(Debug, Clone, Copy)]
pub struct SystemMapper {
    page_size: usize,
}

impl SystemMapper {
    /// Creates a mapper and queries the page size once.
    #[must_use]
    pub fn new() -> SystemMapper {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = usize::try_from(page_size)
            .ok()
            .filter(|size| size.is_power_of_two())
            .unwrap_or(FALLBACK_PAGE_SIZE);

        SystemMapper { page_size }
    }
}

impl Default for SystemMapper {
    fn default() -> Self {
        SystemMapper::new()
    }
}

impl Mapper for SystemMapper {
    fn map(
        &mut self,
        placement: MapPlacement,
        length: usize,
        protection: Protection,
    ) -> Result<usize> {
        let (hint, extra_flags) = match placement {
            MapPlacement::Fixed(address) => (address, FIXED_FLAGS),
            MapPlacement::Anywhere => (0, 0),
            MapPlacement::Low => (0, LOW_FLAGS),
        };

        let result = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                length,
                protection.bits(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
                -1,
                0,
            )
        };

        if result == libc::MAP_FAILED {
            return Err(Error::MapFailed {
                address: hint,
                length,
                source: std::io::Error::last_os_error(),
            });
        }

        let address = result as usize;
        if let MapPlacement::Fixed(requested) = placement {
            // Kernels older than 4.17 treat MAP_FIXED_NOREPLACE as a plain hint
            if address != requested {
                unsafe { libc::munmap(result, length) };
                return Err(Error::MapFailed {
                    address: requested,
                    length,
                    source: std::io::Error::from_raw_os_error(libc::EEXIST),
                });
            }
        }

        Ok(address)
    }

    fn unmap(&mut self, address: usize, length: usize) -> Result<()> {
        let result = unsafe { libc::munmap(address as *mut libc::c_void, length) };
        if result != 0 {
            return Err(Error::UnmapFailed {
                address,
                length,
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
