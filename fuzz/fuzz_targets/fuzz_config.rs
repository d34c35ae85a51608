//! Fuzz target for configuration parsing.
//!
//! This tests that untrusted configuration input is rejected with errors,
//! never a panic: neither deserialization nor validation may crash.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_mirror::config::MirrorConfig;

fuzz_target!(|data: &str| {
    if let Ok(config) = serde_json::from_str::<MirrorConfig>(data) {
        // Validation may reject, but must not panic
        let _ = config.validate();
    }
});
