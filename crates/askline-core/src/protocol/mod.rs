//! Wire protocol for the Engine.IO / Socket.IO style endpoint.
//!
//! Frames are text messages tagged with a run of leading digits. The
//! [`frame`] module turns them into typed [`Frame`]s and back; [`sequence`]
//! tracks the numeric id attached to outbound application packets.

pub mod frame;
pub mod sequence;

pub use frame::{Control, Frame, decode, encode, split_payloads};
pub use sequence::SequenceCounter;

/// Engine.IO protocol revision spoken by the client.
pub const ENGINE_IO_VERSION: u8 = 4;

/// Separator between packets in a long-polling body (Engine.IO v4).
pub const RECORD_SEPARATOR: char = '\u{1e}';
