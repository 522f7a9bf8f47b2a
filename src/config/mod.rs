//! Endpoint configuration.

mod loader;
mod types;

pub use loader::*;
pub use types::*;
