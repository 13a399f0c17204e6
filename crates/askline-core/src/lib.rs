// ── askline core library ─────────────────────────────────────────────────────
//
// Protocol client for a web-search answer service: long-polling session
// negotiation, WebSocket upgrade, frame codec, query engine and answer
// extraction. Presentation lives in the `askline` binary.

pub mod args;
pub mod channel;
pub mod config;
pub mod error;
pub mod extract;
pub mod fragment;
pub mod logging;
pub mod protocol;
pub mod query;
pub mod session;

pub use channel::{Channel, ChannelState};
pub use config::ClientConfig;
pub use error::{AskError, Result};
pub use extract::{AnswerResult, Reference, extract};
pub use fragment::{Fragment, FragmentSource};
pub use query::{FragmentStream, QueryEngine, Reply};
pub use session::{Negotiator, Session};
