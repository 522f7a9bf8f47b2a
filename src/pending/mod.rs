//! Correlation of in-flight requests with their replies.
//!
//! # Architecture
//!
//! ```text
//! send ──register──▶ PendingTable ◀──take/settle── receive task
//!                        │
//!                   drain_all on destroy
//! ```

mod error;
mod id;
mod table;

pub use error::{PendingError, ReplyError};
pub use id::IdGenerator;
pub use table::{Completion, PendingReply, PendingTable, ReplyResult};
