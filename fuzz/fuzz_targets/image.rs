#![no_main]

use libfuzzer_sys::fuzz_target;
use sfiloader::BinaryImage;

fuzz_target!(|data: &[u8]| {
    if let Ok(image) = BinaryImage::from_mem(data.to_vec()) {
        for section in image.section_headers() {
            let _ = image.section_data(&section);
        }
        let _ = image.symbol_table();
    }
});
