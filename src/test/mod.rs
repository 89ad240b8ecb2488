mod builder;

use std::sync::atomic::{AtomicUsize, Ordering};

pub use builder::{ElfBuilder, SymbolSpec};
pub use mapper::{FaultyMapper, MapLog};

const TEST_BASE: usize = 0x2000_0000_0000;
const TEST_STRIDE: usize = 0x100_0000;

static NEXT_BASE: AtomicUsize = AtomicUsize::new(0);

// Fixed base for one test; tests run in parallel and must never share a range
pub fn unique_base() -> usize {
    TEST_BASE + NEXT_BASE.fetch_add(1, Ordering::Relaxed) * TEST_STRIDE
}
