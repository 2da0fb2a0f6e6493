//! Test support for the Cinder workspace.

pub mod mock;

pub use mock::{AcquireScript, MockBackend, MockEvent, WAIT_TIMEOUT};

/// Installs `env_logger` once for the test binary.
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
