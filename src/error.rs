use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into four groups that differ in how the loader reacts to them:
///
/// ## Format Errors (fatal for the whole load)
/// - [`Error::NotElf`] - Identification bytes are not an ELF magic
/// - [`Error::Truncated`] - The header or a table it references ends early
/// - [`Error::NotSupported`] - ELF32 or big-endian images
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::FileError`] - The binary could not be opened or read
/// - [`Error::Malformed`] - Structurally inconsistent header fields
///
/// ## Local Errors (one entry is skipped, the load continues)
/// - [`Error::HeaderRead`] - One section or symbol header could not be read
/// - [`Error::ShortRead`] - A section's bytes extend past the end of the file
/// - [`Error::BoundsViolation`] - A section would not fit into the isolated region
///
/// ## Allocation Errors (fatal after rollback)
/// - [`Error::MapFailed`] - A mapping request was refused
/// - [`Error::AllocationFailed`] - Bookkeeping storage or placement could not be obtained
/// - [`Error::PublishFailed`] - The capability base could not be installed
/// - [`Error::AlreadyInitialized`] - `init` was called twice on one context
///
/// ## Teardown Errors (reported, never stop the teardown)
/// - [`Error::UnmapFailed`] - A tracked region could not be released
/// - [`Error::Teardown`] - Collection of every unmap failure of one teardown pass
///
/// # Examples
///
/// ```rust,no_run
/// use sfiloader::{BinaryImage, Error};
///
/// match BinaryImage::from_file("target/debug/hello".as_ref()) {
///     Ok(image) => println!("{} sections", image.section_count()),
///     Err(Error::NotElf) => eprintln!("not an ELF image"),
///     Err(Error::FileError(io_err)) => eprintln!("I/O error: {}", io_err),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    ///
    /// Wraps standard I/O errors raised while opening or mapping the binary image.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// The identification bytes do not carry the ELF magic.
    #[error("Not an ELF file")]
    NotElf,

    /// The image ends before a structure it declares.
    #[error("ELF image is truncated")]
    Truncated,

    /// This file type is not supported.
    ///
    /// Only 64-bit little-endian images are loaded.
    #[error("This file type is not supported")]
    NotSupported,

    /// The file is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// A single section or symbol header could not be read in full.
    ///
    /// Recovered by the caller: the index is skipped and the scan continues.
    #[error("Failed to read header at index {index}")]
    HeaderRead {
        /// Index of the header inside its table
        index: usize,
    },

    /// No section with the requested name exists.
    #[error("Section {0} not found")]
    SectionNotFound(String),

    /// The bytes of a section extend past the end of the file.
    #[error("Failed to read section content of {section}")]
    ShortRead {
        /// Name of the section
        section: String,
    },

    /// A materialized section would cross the upper bound of the isolated region.
    #[error("Section {section} exceeds allocated memory space (ends at {end:#x}, limit {limit:#x})")]
    BoundsViolation {
        /// Name of the section
        section: String,
        /// First address past the section's computed extent
        end: u64,
        /// First address past the isolated region
        limit: u64,
    },

    /// A mapping request was refused by the platform.
    #[error("Memory mapping of {length:#x} bytes at {address:#x} failed: {source}")]
    MapFailed {
        /// Requested address, zero when the platform was free to choose
        address: usize,
        /// Requested length in bytes
        length: usize,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Storage required for isolation bookkeeping could not be obtained.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// A tracked region could not be released.
    #[error("munmap of {length:#x} bytes at {address:#x} failed: {source}")]
    UnmapFailed {
        /// Base address of the region
        address: usize,
        /// Length of the region
        length: usize,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// The capability table base could not be installed for the current execution context.
    #[error("Failed to publish capability table: {0}")]
    PublishFailed(String),

    /// The isolation context already holds a loaded domain.
    #[error("Isolation context is already initialized")]
    AlreadyInitialized,

    /// One or more regions could not be released during teardown.
    #[error("Teardown finished with {} unmap failure(s)", .0.len())]
    Teardown(Vec<Error>),
}

impl Error {
    /// Returns `true` for errors that abandon the whole load.
    ///
    /// Header reads, short reads and bounds violations only drop the affected entry, and
    /// teardown failures are reported without stopping the teardown.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::HeaderRead { .. }
                | Error::ShortRead { .. }
                | Error::BoundsViolation { .. }
                | Error::UnmapFailed { .. }
                | Error::Teardown(_)
        )
    }
}
