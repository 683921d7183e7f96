//! Fuzz test for configuration loading
//!
//! Any TOML document must load or fail with a `ConfigError`; a document
//! that loads must pass validation again unchanged.
//!
//! Run with: cargo +nightly fuzz run config_fuzz -- -max_total_time=60

#![no_main]

use cairn_core::CairnConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(config) = CairnConfig::from_toml_str(input) {
            assert!(config.validate().is_ok());
            assert!(!config.clients.is_empty());
        }
    }
});
