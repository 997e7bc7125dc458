//! Protocol module - wire framing, typed messages, filter payloads.
//!
//! This module owns the wire contract with the engine:
//! - `CONI`/`json:` tagged control framing and frame classification
//! - the closed `message`-kind enumeration as a tagged enum
//! - the filter/pin payload model whose deserialization doubles as
//!   schema validation

mod filter;
mod frame;
mod message;

pub use filter::{FilterId, FilterSnapshot, PinState};
pub use frame::{decode_frame, encode_command, FrameKind, CONTROL_TAG, JSON_PREFIX};
pub use message::WireMessage;
