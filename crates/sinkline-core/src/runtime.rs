//! Shared tokio runtime for driving async database clients from blocking code

use std::sync::LazyLock;
use std::time::Duration;

/// TCP connect + TDS login timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared tokio runtime for database I/O.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});
