//! workbench_gateway: instruction-driven workspace editing with a live
//! dev-server preview.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod agent;
pub mod chatlog;
pub mod config;
pub mod diagnostics;
pub mod gateway;
pub mod logs;
pub mod models;
pub mod operations;
pub mod preview;
pub mod proxy;
pub mod utils;
pub mod workspace;

/// Return the data directory for chat logs and diagnostics.
///
/// Resolution order:
/// 1. `WORKBENCH_HOME` environment variable
/// 2. `$HOME/.workbench`
pub fn workbench_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("WORKBENCH_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".workbench")
    }
}
