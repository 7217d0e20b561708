//! Logger setup. `RUST_LOG` wins over the defaults here.

use env_logger::Env;

/// Install the process logger at `info` unless `RUST_LOG` says otherwise.
/// Later calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Logger for tests: captured per test, debug for this crate.
pub fn init_for_tests() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("bluet=debug"))
        .is_test(true)
        .try_init();
}
