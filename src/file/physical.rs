//! Physical file backend for memory-mapped I/O.
//!
//! [`Physical`] maps the binary read-only into the process so that section headers, symbol
//! entries and section contents can be read at arbitrary absolute offsets without seeking.
//! The loader only ever needs read access: the image does not have to be executable on disk.

use super::Backend;
use crate::{Error::FileError, Result};

use memmap2::Mmap;
use std::{fs, path::Path};

/// A file backend that uses memory-mapped I/O for access to a binary on disk.
///
/// All access operations include bounds checking.
#[derive(Debug)]
pub struct Physical {
    /// Memory-mapped file data
    data: Mmap,
}

impl Physical {
    /// Create a new physical file backend by memory-mapping the specified file.
    ///
    /// # Arguments
    /// * `path` - Path to the binary on disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path).map_err(FileError)?;

        // The mapping is private and read-only; concurrent truncation of the file by another
        // process is outside the loader's contract.
        let mmap = unsafe { Mmap::map(&file) }.map_err(FileError)?;

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn physical() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x7F, b'E', b'L', b'F', 0x02, 0x01, 0x01, 0x00])
            .unwrap();

        let physical = Physical::new(file.path()).unwrap();

        assert_eq!(physical.len(), 8);
        assert_eq!(physical.data()[0], 0x7F);
        assert_eq!(physical.data_slice(1, 3).unwrap(), b"ELF");

        assert!(physical.data_slice(u32::MAX as usize, 1).is_err());
        assert!(physical.data_slice(0, 9).is_err());
    }

    #[test]
    fn test_physical_invalid_file_path() {
        let result = Physical::new("/nonexistent/path/to/binary");
        match result {
            Err(FileError(io_error)) => {
                assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected FileError"),
        }
    }

    #[test]
    fn test_physical_boundary_conditions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAA; 64]).unwrap();

        let physical = Physical::new(file.path()).unwrap();
        let len = physical.len();

        assert_eq!(physical.data_slice(len - 1, 1).unwrap().len(), 1);
        assert_eq!(physical.data_slice(0, len).unwrap().len(), len);
        assert_eq!(physical.data_slice(len, 0).unwrap().len(), 0);
        assert!(matches!(
            physical.data_slice(len - 1, 2),
            Err(crate::Error::OutOfBounds)
        ));
        assert!(physical.data_slice(usize::MAX, 1).is_err());
    }
}
