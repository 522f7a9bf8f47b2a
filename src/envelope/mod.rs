//! Wire envelopes shared by both directions of a channel.
//!
//! # Protocol
//!
//! Every frame carries one JSON object:
//!
//! ```text
//! request: { "id": "<token>", "sentBy": "<endpoint>", "data": { ... } }
//! reply:   { "id": "<token>", "success": true|false, ...<responder fields> }
//! ```

mod codec;
mod types;

pub use codec::*;
pub use types::*;
