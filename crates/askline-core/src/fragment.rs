//! Answer fragments delivered to the query consumer.

use serde_json::{Value, json};

/// Where a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentSource {
    /// A `42` event frame
    Event,
    /// A `43` ack frame; always terminal
    Ack,
    /// Produced locally (timeout, dropped connection)
    Synthetic,
}

/// One application payload, in transport-arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub source: FragmentSource,
    pub payload: Value,
}

impl Fragment {
    pub fn event(payload: Value) -> Self {
        Self {
            source: FragmentSource::Event,
            payload,
        }
    }

    pub fn ack(payload: Value) -> Self {
        Self {
            source: FragmentSource::Ack,
            payload,
        }
    }

    /// `{"error": "Timed out."}`
    pub fn timed_out() -> Self {
        Self::error("Timed out.")
    }

    /// `{"error": "Connection closed."}`
    pub fn connection_closed() -> Self {
        Self::error("Connection closed.")
    }

    fn error(message: &str) -> Self {
        Self {
            source: FragmentSource::Synthetic,
            payload: json!({ "error": message }),
        }
    }

    /// Error message carried by a synthetic fragment, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }

    /// True when the server is done producing output for the query.
    pub fn is_terminal(&self) -> bool {
        match self.source {
            FragmentSource::Ack => true,
            FragmentSource::Event => is_completed(&self.payload),
            FragmentSource::Synthetic => false,
        }
    }
}

/// `final == true` and `status == "COMPLETED"`.
pub fn is_completed(payload: &Value) -> bool {
    payload.get("final").and_then(Value::as_bool) == Some(true)
        && payload.get("status").and_then(Value::as_str) == Some("COMPLETED")
}
