#![no_main]
//! Fuzz target for the format scanner.
//!
//! Arbitrary strings must scan to directives or fail with a positioned
//! error; no input may panic the scanner or loop forever.

use libfuzzer_sys::fuzz_target;
use wiremsg::FormatScanner;

fuzz_target!(|data: &[u8]| {
    let Ok(fmt) = std::str::from_utf8(data) else {
        return;
    };
    let _ = FormatScanner::scan_all(fmt);
});
