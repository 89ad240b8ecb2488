//! Capability table construction and publication.
//!
//! The capability table is a flat array of addresses. Isolated code reaches its memory with a
//! two-step indirection: it reads the table base from a per-thread location (the GS segment
//! base on x86_64 Linux, a thread-local otherwise) and then loads the slot it needs. See
//! [`load_slot`].
//!
//! # Layout
//!
//! | Slots | Content |
//! |-------|---------|
//! | 0..4 | `.text`, `.data` (+ hidden offset), `.rodata`, `.bss`; zero until materialized |
//! | 4..4+extra | one guard page per slot |
//! | rest | one slot per sandbox section, appended in load order |
//!
//! The storage is allocated once with its final capacity; appending never moves it, so the
//! published base stays valid until [`CapabilityTable::destroy`].

use std::cell::Cell;

use crate::{
    file::SectionKind,
    isolation::{
        mapper::{MapPlacement, Protection},
        region::{RegionAllocator, RegionRequest},
    },
    Error, Result,
};

/// Index into the capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl SlotId {
    /// Slot holding the `.text` address
    pub const CODE: SlotId = SlotId(0);
    /// Slot holding the `.data` address plus the hidden offset
    pub const DATA: SlotId = SlotId(1);
    /// Slot holding the `.rodata` address
    pub const RODATA: SlotId = SlotId(2);
    /// Slot holding the `.bss` address
    pub const ZERO_FILL: SlotId = SlotId(3);
    /// Number of reserved slots at the start of the table
    pub const RESERVED: usize = 4;

    /// Returns the reserved slot of a section kind, `None` for sandbox sections.
    #[must_use]
    pub fn for_kind(kind: SectionKind) -> Option<SlotId> {
        match kind {
            SectionKind::Code => Some(SlotId::CODE),
            SectionKind::Data => Some(SlotId::DATA),
            SectionKind::ReadOnlyData => Some(SlotId::RODATA),
            SectionKind::ZeroFill => Some(SlotId::ZERO_FILL),
            SectionKind::SandboxCustom => None,
        }
    }

    /// Returns the position inside the table.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// The per-domain slot array.
#[derive(Debug)]
pub struct CapabilityTable {
    slots: Vec<usize>,
    reserved: usize,
    guard_pages: usize,
    destroyed: bool,
}

impl CapabilityTable {
    /// Allocates the table and the guard pages of its extra slots.
    ///
    /// The storage holds `reserved + extra + custom_capacity` slots. The reserved slots start
    /// unset. Each extra slot receives a fresh read/write page reserved through `allocator`,
    /// all or nothing.
    ///
    /// # Errors
    /// - [`crate::Error::AllocationFailed`] if the slot storage cannot be allocated
    /// - [`crate::Error::MapFailed`] if a guard page cannot be mapped; guard pages mapped
    ///   before the failure are released again
    pub fn create(
        allocator: &mut RegionAllocator,
        reserved: usize,
        extra: usize,
        custom_capacity: usize,
        low: bool,
    ) -> Result<CapabilityTable> {
        let capacity = reserved
            .checked_add(extra)
            .and_then(|count| count.checked_add(custom_capacity))
            .ok_or_else(|| Error::AllocationFailed("capability table size overflows".into()))?;

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|error| {
            Error::AllocationFailed(format!(
                "capability table of {} slots: {}",
                capacity, error
            ))
        })?;
        slots.resize(reserved, 0);

        let placement = if low {
            MapPlacement::Low
        } else {
            MapPlacement::Anywhere
        };
        let requests = vec![
            RegionRequest {
                placement,
                length: allocator.page_size(),
                protection: Protection::RW,
            };
            extra
        ];

        for guard in allocator.reserve_batch(&requests)? {
            slots.push(guard.base_address);
        }

        log::debug!(
            "Capability table at {:#x}: {} reserved, {} guard, room for {} sandbox slots",
            slots.as_ptr() as usize,
            reserved,
            extra,
            custom_capacity
        );

        Ok(CapabilityTable {
            slots,
            reserved,
            guard_pages: extra,
            destroyed: false,
        })
    }

    /// Stores `address` in an existing slot.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `slot` does not exist.
    pub fn assign(&mut self, slot: SlotId, address: usize) -> Result<()> {
        let entry = self.slots.get_mut(slot.index()).ok_or(Error::OutOfBounds)?;
        *entry = address;
        Ok(())
    }

    /// Appends `address` as a new slot.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailed`] if the table is full; it never grows past the
    /// capacity chosen at creation.
    pub fn push(&mut self, address: usize) -> Result<SlotId> {
        if self.slots.len() == self.slots.capacity() {
            return Err(Error::AllocationFailed(format!(
                "capability table is full ({} slots)",
                self.slots.len()
            )));
        }

        self.slots.push(address);
        Ok(SlotId(self.slots.len() - 1))
    }

    /// Returns the address in `slot`, `None` if the slot does not exist or is unset.
    #[must_use]
    pub fn get(&self, slot: SlotId) -> Option<usize> {
        self.slots
            .get(slot.index())
            .copied()
            .filter(|&address| address != 0)
    }

    /// Returns the address of the first slot.
    #[must_use]
    pub fn base_address(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    /// Returns all slots, including unset ones.
    #[must_use]
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Returns the number of slots in use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the table holds no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the number of slots the table can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Returns the number of reserved slots.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Returns the number of sandbox slots appended so far.
    #[must_use]
    pub fn custom_count(&self) -> usize {
        self.slots.len() - self.reserved - self.guard_pages
    }

    /// Returns `true` once [`CapabilityTable::destroy`] ran.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Installs the table base through `base`.
    ///
    /// # Errors
    /// Returns [`crate::Error::PublishFailed`] if the table was destroyed or the base cannot
    /// be installed.
    pub fn publish(&self, base: &mut dyn CapabilityBase) -> Result<()> {
        if self.destroyed {
            return Err(Error::PublishFailed("capability table was destroyed".into()));
        }

        base.publish(self.base_address())?;
        log::info!(
            "Capability table {:#x} published through {}",
            self.base_address(),
            base.name()
        );
        Ok(())
    }

    /// Unmaps every region tracked by `allocator`, newest first, then releases the table.
    ///
    /// Unmap failures do not stop the walk. Calling this again is a no-op.
    ///
    /// # Errors
    /// Returns [`crate::Error::Teardown`] carrying every unmap failure.
    pub fn destroy(&mut self, allocator: &mut RegionAllocator) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }

        let errors = allocator.release_all();
        self.slots = Vec::new();
        self.destroyed = true;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errors))
        }
    }
}

/// Reads slot `slot` of the table published at `base`.
///
/// This is the indirection isolated code performs: base register, then slot.
///
/// # Safety
/// `base` must be the base address of a live [`CapabilityTable`] and `slot` must be below its
/// length.
#[must_use]
pub unsafe fn load_slot(base: usize, slot: SlotId) -> usize {
    *(base as *const usize).add(slot.index())
}

/// A per-thread location holding the published table base.
pub trait CapabilityBase {
    /// Installs `base` for the calling thread.
    ///
    /// # Errors
    /// Returns [`crate::Error::PublishFailed`] if the base cannot be installed.
    fn publish(&mut self, base: usize) -> Result<()>;

    /// Reads the installed base back, zero when nothing is installed.
    ///
    /// # Errors
    /// Returns [`crate::Error::PublishFailed`] if the location cannot be read.
    fn current(&self) -> Result<usize>;

    /// Removes the installed base.
    ///
    /// # Errors
    /// Returns [`crate::Error::PublishFailed`] if the location cannot be written.
    fn clear(&mut self) -> Result<()>;

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;
}

thread_local! {
    static THREAD_BASE: Cell<usize> = const { Cell::new(0) };
}

/// Returns the table base published on this thread through [`ThreadLocalBase`].
#[must_use]
pub fn thread_base() -> usize {
    THREAD_BASE.with(Cell::get)
}

/// Publishes the table base in a guarded thread-local slot.
///
/// The slot holds one table per thread: publishing while a different base is installed fails
/// until that base is cleared.
#[derive(Debug, Default)]
pub struct ThreadLocalBase {
    published: Option<usize>,
}

impl ThreadLocalBase {
    /// Creates a publisher that has not installed anything yet.
    #[must_use]
    pub fn new() -> ThreadLocalBase {
        ThreadLocalBase { published: None }
    }
}

impl CapabilityBase for ThreadLocalBase {
    fn publish(&mut self, base: usize) -> Result<()> {
        let current = thread_base();
        if current != 0 && current != base {
            return Err(Error::PublishFailed(format!(
                "thread already has capability table {:#x}",
                current
            )));
        }

        THREAD_BASE.with(|slot| slot.set(base));
        self.published = Some(base);
        Ok(())
    }

    fn current(&self) -> Result<usize> {
        Ok(thread_base())
    }

    fn clear(&mut self) -> Result<()> {
        // only remove what this publisher installed
        if let Some(base) = self.published.take() {
            if thread_base() == base {
                THREAD_BASE.with(|slot| slot.set(0));
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "thread-local"
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use segment::SegmentRegister;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod segment {
    use std::arch::asm;

    use super::CapabilityBase;
    use crate::{Error, Result};

    const HWCAP2_FSGSBASE: u64 = 1 << 1;
    const ARCH_SET_GS: libc::c_long = 0x1001;
    const ARCH_GET_GS: libc::c_long = 0x1004;

    /// Publishes the table base in the GS segment base of the calling thread.
    ///
    /// Uses `wrgsbase`/`rdgsbase` when the kernel advertises FSGSBASE support to user space,
    /// and the `arch_prctl` system call otherwise.
    #[derive(Debug, Clone, Copy)]
    pub struct SegmentRegister {
        fsgsbase: bool,
    }

    impl SegmentRegister {
        /// Detects the available instruction set once.
        #[must_use]
        pub fn new() -> SegmentRegister {
            let hwcap2 = unsafe { libc::getauxval(libc::AT_HWCAP2) };
            SegmentRegister {
                fsgsbase: hwcap2 & HWCAP2_FSGSBASE != 0,
            }
        }

        fn write(&self, base: usize) -> Result<()> {
            if self.fsgsbase {
                unsafe {
                    asm!("wrgsbase {}", in(reg) base as u64, options(nostack, preserves_flags));
                }
                return Ok(());
            }

            let result = unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_SET_GS, base) };
            if result != 0 {
                return Err(Error::PublishFailed(format!(
                    "arch_prctl(ARCH_SET_GS): {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        }
    }

    impl Default for SegmentRegister {
        fn default() -> Self {
            SegmentRegister::new()
        }
    }

    impl CapabilityBase for SegmentRegister {
        fn publish(&mut self, base: usize) -> Result<()> {
            self.write(base)
        }

        fn current(&self) -> Result<usize> {
            if self.fsgsbase {
                let base: u64;
                unsafe {
                    asm!("rdgsbase {}", out(reg) base, options(nostack, nomem, preserves_flags));
                }
                return Ok(base as usize);
            }

            let mut base: u64 = 0;
            let result = unsafe {
                libc::syscall(libc::SYS_arch_prctl, ARCH_GET_GS, &mut base as *mut u64)
            };
            if result != 0 {
                return Err(Error::PublishFailed(format!(
                    "arch_prctl(ARCH_GET_GS): {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(base as usize)
        }

        fn clear(&mut self) -> Result<()> {
            self.write(0)
        }

        fn name(&self) -> &'static str {
            if self.fsgsbase {
                "gs (wrgsbase)"
            } else {
                "gs (arch_prctl)"
            }
        }
    }
}
