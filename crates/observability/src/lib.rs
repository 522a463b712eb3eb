//! Tracing/logging setup shared by the steward binaries.

/// Initialize process-wide logging with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(LogFormat::Json);
}

pub use self::tracing::{LogFormat, init_with};

/// Tracing configuration (filters, layers).
pub mod tracing;
