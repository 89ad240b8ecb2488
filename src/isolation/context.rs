//! The isolation context: one domain from `init` to `teardown`.
//!
//! [`IsolationContext`] owns everything a loaded domain needs: the configuration, the region
//! allocator with its tracking list, the isolated region, the capability table and the
//! publisher of the table base. `init` runs the whole load; if it fails fatally, every mapping
//! created so far is released before the error is returned. `teardown` clears the published
//! base and releases every mapping; `Drop` runs it if the host did not.
//!
//! # Load sequence
//!
//! 1. Read all section headers (unreadable ones are skipped and reported)
//! 2. Create the capability table and its guard pages
//! 3. Reserve the isolated region at the configured base
//! 4. Compute the hidden symbol offset
//! 5. Materialize every isolated section; local failures are reported, the rest continues
//! 6. Publish the table base
//!
//! # Examples
//!
//! ```rust,no_run
//! use sfiloader::{IsolationContext, LoaderConfig, SlotId};
//!
//! let mut context = IsolationContext::new(LoaderConfig::extended())?;
//! let report = context.init("/proc/self/exe".as_ref())?;
//! println!("{} sections isolated", report.materialized.len());
//! println!("code at {:#x?}", context.slot(SlotId::CODE));
//! context.teardown()?;
//! # Ok::<(), sfiloader::Error>(())
//! ```

use std::path::Path;

use crate::{
    file::{BinaryImage, SectionKind},
    isolation::{
        capability::{CapabilityBase, CapabilityTable, SlotId, ThreadLocalBase},
        config::{LoaderConfig, PublishMode},
        hidden::{compute_hidden_offset, HiddenOffset},
        mapper::{Mapper, SystemMapper},
        materialize::{Materialized, Materializer},
        region::{IsolatedRegion, RegionAllocator},
    },
    Error, Result,
};

/// A section that was not materialized, with the reason.
#[derive(Debug)]
pub struct SkippedSection {
    /// Section name
    pub name: String,
    /// What went wrong
    pub error: Error,
}

/// Summary of one load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Sections that were copied, in table order
    pub materialized: Vec<Materialized>,
    /// Isolated sections that failed locally
    pub skipped: Vec<SkippedSection>,
    /// Section header indices that could not be read
    pub skipped_headers: Vec<usize>,
    /// Offset added to the data slot
    pub hidden_offset: HiddenOffset,
    /// Number of sandbox sections that received a slot
    pub custom_sections: usize,
    /// Published address of the capability table
    pub table_base: usize,
}

fn publisher_for(mode: PublishMode) -> Result<Box<dyn CapabilityBase>> {
    match mode {
        PublishMode::ThreadLocal => Ok(Box::new(ThreadLocalBase::new())),
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        PublishMode::Register => Ok(Box::new(
            crate::isolation::capability::SegmentRegister::new(),
        )),
        #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
        PublishMode::Register => Err(Error::PublishFailed(
            "segment register publication needs x86_64 Linux".into(),
        )),
    }
}

/// Owns one isolation domain.
pub struct IsolationContext {
    config: LoaderConfig,
    allocator: RegionAllocator,
    publisher: Box<dyn CapabilityBase>,
    region: Option<IsolatedRegion>,
    table: Option<CapabilityTable>,
    published: bool,
    report: LoadReport,
}

impl std::fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationContext")
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .field("publisher", &self.publisher.name())
            .field("region", &self.region)
            .field("table", &self.table)
            .field("published", &self.published)
            .finish()
    }
}

impl IsolationContext {
    /// Creates an uninitialized context that maps memory with `mmap`.
    ///
    /// # Errors
    /// Returns [`crate::Error::PublishFailed`] if the configured publication mode is not
    /// available on this platform.
    pub fn new(config: LoaderConfig) -> Result<IsolationContext> {
        Self::with_mapper(config, Box::new(SystemMapper::new()))
    }

    /// Creates an uninitialized context on top of a custom [`Mapper`].
    ///
    /// # Errors
    /// Returns [`crate::Error::PublishFailed`] if the configured publication mode is not
    /// available on this platform.
    pub fn with_mapper(config: LoaderConfig, mapper: Box<dyn Mapper>) -> Result<IsolationContext> {
        let publisher = publisher_for(config.publish)?;

        Ok(IsolationContext {
            config,
            allocator: RegionAllocator::new(mapper),
            publisher,
            region: None,
            table: None,
            published: false,
            report: LoadReport::default(),
        })
    }

    /// Replaces the publisher chosen from the configuration.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Box<dyn CapabilityBase>) -> IsolationContext {
        self.publisher = publisher;
        self
    }

    /// Loads the ELF image at `path` into the isolation domain.
    ///
    /// # Errors
    /// Any fatal error of [`IsolationContext::init_image`], plus the errors of
    /// [`BinaryImage::from_file`].
    pub fn init(&mut self, path: &Path) -> Result<&LoadReport> {
        let image = BinaryImage::from_file(path)?.with_sandbox_prefix(&self.config.sandbox_prefix);
        log::info!("Loading {} into isolation domain", path.display());

        self.init_image(&image)
    }

    /// Loads an already opened image into the isolation domain.
    ///
    /// Sections are classified with the configured sandbox prefix. Sections that cannot be
    /// read or do not fit are skipped and listed in the returned report.
    ///
    /// # Errors
    /// - [`crate::Error::AlreadyInitialized`] if the context holds a domain
    /// - [`crate::Error::AllocationFailed`] for an invalid configuration or table allocation
    ///   failure
    /// - [`crate::Error::MapFailed`] if the region or a guard page cannot be mapped
    /// - [`crate::Error::PublishFailed`] if the table base cannot be installed
    ///
    /// On error every mapping created by this call has been released.
    pub fn init_image(&mut self, image: &BinaryImage) -> Result<&LoadReport> {
        if self.table.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        if let Err(error) = self.load(image) {
            log::error!("Isolation setup failed: {}", error);
            for unmap_error in self.allocator.release_all() {
                log::error!("Rollback: {}", unmap_error);
            }
            self.region = None;
            self.report = LoadReport::default();
            return Err(error);
        }

        Ok(&self.report)
    }

    fn load(&mut self, image: &BinaryImage) -> Result<()> {
        self.config.validate(self.allocator.page_size())?;

        let mut report = LoadReport::default();
        let (mut sections, skipped_headers) = image.section_headers_with_skips();
        report.skipped_headers = skipped_headers;

        for section in &mut sections {
            section.kind = SectionKind::classify(&section.name, &self.config.sandbox_prefix);
        }
        sections.retain(|section| section.kind.is_some());

        let custom = sections
            .iter()
            .filter(|section| section.kind == Some(SectionKind::SandboxCustom))
            .count();

        let mut table = CapabilityTable::create(
            &mut self.allocator,
            SlotId::RESERVED,
            self.config.extra_slots,
            custom,
            self.config.low_mappings,
        )?;

        let mapping = self.allocator.reserve(
            self.config.base_address,
            self.config.region_size,
            self.config.region_protection,
        )?;
        let region = IsolatedRegion::new(mapping);
        log::info!(
            "Isolated region {:#x}..{:#x}",
            region.base(),
            region.limit()
        );

        report.hidden_offset = if self.config.resolve_hidden_symbols {
            match image.symbol_table() {
                Ok(Some(symbols)) => compute_hidden_offset(&symbols),
                Ok(None) => HiddenOffset::ZERO,
                Err(error) => {
                    log::warn!("Symbol table unreadable, no hidden offset: {}", error);
                    HiddenOffset::ZERO
                }
            }
        } else {
            HiddenOffset::ZERO
        };

        let materializer = Materializer::new(image, self.config.placement, report.hidden_offset)
            .with_region_size(self.config.region_size);
        for section in &sections {
            let result = if section.kind == Some(SectionKind::SandboxCustom) {
                materializer.materialize_custom(
                    section,
                    &mut self.allocator,
                    &mut table,
                    self.config.low_mappings,
                )
            } else {
                materializer.materialize(section, &region, &mut table)
            };

            match result {
                Ok(placed) => report.materialized.push(placed),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    log::warn!("Skipping section {}: {}", section.name, error);
                    report.skipped.push(SkippedSection {
                        name: section.name.clone(),
                        error,
                    });
                }
            }
        }
        report.custom_sections = table.custom_count();

        table.publish(self.publisher.as_mut())?;
        report.table_base = table.base_address();

        log::info!(
            "Isolation domain ready: {} sections, {} skipped, {} sandbox slots, hidden offset {}",
            report.materialized.len(),
            report.skipped.len(),
            report.custom_sections,
            report.hidden_offset
        );

        self.region = Some(region);
        self.table = Some(table);
        self.published = true;
        self.report = report;

        Ok(())
    }

    /// Clears the published base and releases every mapping, newest first.
    ///
    /// Calling this on an uninitialized or already torn down context is a no-op.
    ///
    /// # Errors
    /// Returns [`crate::Error::Teardown`] with every unmap failure; the teardown still
    /// completes.
    pub fn teardown(&mut self) -> Result<()> {
        if self.published {
            if let Err(error) = self.publisher.clear() {
                log::warn!("Failed to clear capability base: {}", error);
            }
            self.published = false;
        }

        self.region = None;
        let Some(mut table) = self.table.take() else {
            return Ok(());
        };

        let result = table.destroy(&mut self.allocator);
        match &result {
            Ok(()) => log::info!("Isolation domain torn down"),
            Err(error) => log::error!("{}", error),
        }
        result
    }

    /// Returns `true` while a domain is loaded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Returns the report of the last successful load.
    #[must_use]
    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// Returns the isolated region of the loaded domain.
    #[must_use]
    pub fn region(&self) -> Option<&IsolatedRegion> {
        self.region.as_ref()
    }

    /// Returns the capability table of the loaded domain.
    #[must_use]
    pub fn table(&self) -> Option<&CapabilityTable> {
        self.table.as_ref()
    }

    /// Returns the address stored in `slot`, `None` if the slot is unset.
    #[must_use]
    pub fn slot(&self, slot: SlotId) -> Option<usize> {
        self.table.as_ref().and_then(|table| table.get(slot))
    }

    /// Returns the allocator and its tracking list.
    #[must_use]
    pub fn allocator(&self) -> &RegionAllocator {
        &self.allocator
    }

    /// Returns the publisher of the table base.
    #[must_use]
    pub fn publisher(&self) -> &dyn CapabilityBase {
        self.publisher.as_ref()
    }
}

impl Drop for IsolationContext {
    fn drop(&mut self) {
        if self.table.is_some() {
            log::debug!("Isolation context dropped without teardown");
            if let Err(error) = self.teardown() {
                log::error!("Teardown on drop: {}", error);
            }
        }
    }
}
