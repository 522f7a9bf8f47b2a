//! Transport adapters.
//!
//! The endpoint never touches sockets itself. It is handed a [`Transport`]
//! at construction and talks to it through this trait only.

mod adapter;
mod memory;

pub use adapter::*;
pub use memory::{MemoryHub, MemoryTransport};
