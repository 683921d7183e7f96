//! Fuzz test for the cache client DSN parser
//!
//! Arbitrary input must either parse or produce `ConfigError::InvalidDsn`,
//! never panic.
//!
//! Run with: cargo +nightly fuzz run dsn_fuzz -- -max_total_time=60

#![no_main]

use cairn_core::{ConfigError, Dsn, DsnEndpoint};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    match Dsn::parse(input) {
        Ok(dsn) => {
            match &dsn.endpoint {
                DsnEndpoint::Tcp { host, .. } => {
                    assert!(!host.is_empty(), "Parsed TCP endpoint without a host");
                    assert!(dsn.socket().is_none());
                }
                DsnEndpoint::Socket(path) => {
                    assert!(path.starts_with('/'), "Socket path must be absolute");
                    assert!(dsn.port().is_none());
                }
            }
        }
        Err(ConfigError::InvalidDsn { .. }) => {}
        Err(other) => panic!("Unexpected error kind: {:?}", other),
    }
});
