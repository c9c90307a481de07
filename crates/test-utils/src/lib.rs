//! Shared test utilities for cellar crates.
//!
//! - [`TestDir`] - Managed temporary directory with home/backup helpers
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`TestConnConfig`] - Connection configuration strings for tests
//! - [`CrashInjector`] - Fail the n-th step of a commit protocol
//! - [`strategies`] - Proptest generators for keys, values and write histories

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::TestDir;

mod assertions;
pub use assertions::assert_eventually;

mod config;
pub use config::{TestConnConfig, test_conn_config, test_logged_conn_config};

mod crash_injector;
pub use crash_injector::CrashInjector;

pub mod strategies;
