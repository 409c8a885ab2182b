//! Froth: a compiler for a small stack language, the bytecode machine it
//! targets, and the debug tooling that ties the two back to source.

pub mod bytecode;
pub mod frontend;
pub mod runtime;

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Output goes to stderr.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
