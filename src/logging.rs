//! Installs a `tracing` subscriber for binaries and tests that want the
//! directory's structured events on stderr.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{PstError, Result};

/// Installs a formatting subscriber filtered by `filter`, in
/// `EnvFilter` syntax (`"info"`, `"pst_nodes::storage=debug"`, ...).
///
/// Fails when the filter does not parse or a global subscriber is
/// already installed.
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| PstError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| PstError::Config("logging already initialized".into()))
}
