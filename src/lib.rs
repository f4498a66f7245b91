pub mod api;
pub mod clienv;
pub mod completions;
pub mod daemon;
pub mod error;
mod fsutil;
pub mod kubeconfig;
pub mod process;
pub mod registry;
pub mod user_config;

#[cfg(test)]
pub(crate) mod testing;

pub use daemon::{DaemonConfig, DaemonKind, DaemonRuntime, DaemonStatus};
pub use error::{DaemonError, Result};
pub use registry::Registry;
pub use user_config::UserConfig;
