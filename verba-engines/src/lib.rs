// Engine bindings for the Verba session controller

// Shared binary-discovery utilities
pub(crate) mod utils;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "cli")]
pub use cli::{CliEngineConfig, CliEngineFactory};
