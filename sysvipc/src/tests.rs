#![cfg(test)]

use crate::Key;

/// Installs a `RUST_LOG`-driven subscriber once per test binary.
pub(crate) fn tracing_init() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A random positive key, so concurrently running tests (and leftovers of
/// aborted runs) do not meet in the IPC namespace.
pub(crate) fn unique_key() -> Key {
    fastrand::i32(0x0100_0000..0x7fff_0000)
}
