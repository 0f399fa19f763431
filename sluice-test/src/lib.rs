//! Helpers for testing the pipeline runtime.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner. All logs emitted with [`sluice_log`] will show up for test
//!    failures or when run with `--nocapture`.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     sluice_test::setup();
//!
//!     sluice_log::debug!("hello, world!");
//! }
//! ```

/// Setup the test environment.
///
///  - Initializes logs: The logger captures logs from all sluice crates and mutes all other logs.
pub fn setup() {
    // Directive targets match by prefix, so this covers every `sluice_*` crate.
    sluice_log::__init_test("sluice");
}
