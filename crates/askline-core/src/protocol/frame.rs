//! Frame types and the text codec for the duplex transport.
//!
//! Every message starts with one or more ASCII digits. The first digit is the
//! Engine.IO packet type, the second (for `4x` messages) the Socket.IO packet
//! type, and any remaining digits are a packet id.

use serde_json::Value;

use super::RECORD_SEPARATOR;
use crate::error::DecodeError;

/// Transport-level control packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Server heartbeat (`2`). Must be answered with [`Control::Pong`].
    Ping,
    /// Heartbeat reply (`3`).
    Pong,
    /// Engine open (`0{...}`) or namespace open acknowledgment (`40`).
    Open,
    /// Upgrade probe, either direction (`2probe` / `3probe`).
    Probe,
    /// Upgrade commit (`5`).
    Upgrade,
    /// No-op (`6`).
    Noop,
}

impl Control {
    /// Wire representation when sent by the client.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Ping => "2",
            Self::Pong => "3",
            Self::Open => "40",
            Self::Probe => "2probe",
            Self::Upgrade => "5",
            Self::Noop => "6",
        }
    }
}

/// One decoded transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(Control),
    /// `42[eventName, data]`; the payload is `data`.
    Event { name: String, payload: Value },
    /// `43<id>[data, ...]`; the payload is `data`.
    Ack(Value),
}

impl Frame {
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control(_))
    }
}

/// Decode one raw text message.
///
/// Anything that is not a recognised prefix, or whose JSON body does not have
/// the expected shape, is an error. Callers drop such frames.
pub fn decode(raw: &str) -> Result<Frame, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }

    let (prefix, rest) = split_prefix(raw);

    match (prefix, rest) {
        ("2", "") => Ok(Frame::Control(Control::Ping)),
        ("3", "") => Ok(Frame::Control(Control::Pong)),
        ("2" | "3", "probe") => Ok(Frame::Control(Control::Probe)),
        ("5", "") => Ok(Frame::Control(Control::Upgrade)),
        ("6", "") => Ok(Frame::Control(Control::Noop)),
        ("0", _) => Ok(Frame::Control(Control::Open)),
        _ if prefix.starts_with("40") => Ok(Frame::Control(Control::Open)),
        _ if prefix.starts_with("42") => decode_event(rest),
        _ if prefix.starts_with("43") => decode_ack(rest),
        _ => Err(DecodeError::UnknownPrefix(prefix.to_string())),
    }
}

/// Encode an application event as `<seq>[event, args...]`.
pub fn encode(seq: u64, event: &str, args: &[Value]) -> String {
    let mut packet = Vec::with_capacity(args.len() + 1);
    packet.push(Value::String(event.to_string()));
    packet.extend(args.iter().cloned());
    format!("{}{}", seq, Value::Array(packet))
}

/// Split a long-polling body into individual packets.
pub fn split_payloads(body: &str) -> impl Iterator<Item = &str> {
    body.split(RECORD_SEPARATOR).filter(|p| !p.is_empty())
}

/// Split the leading run of ASCII digits from the rest of the message.
pub(crate) fn split_prefix(raw: &str) -> (&str, &str) {
    let end = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    raw.split_at(end)
}

fn decode_event(body: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(body)?;
    let items = value
        .as_array()
        .ok_or(DecodeError::Shape("event body is not an array"))?;
    let name = items
        .first()
        .and_then(Value::as_str)
        .ok_or(DecodeError::Shape("event name missing"))?;
    let payload = items
        .get(1)
        .cloned()
        .ok_or(DecodeError::Shape("event data missing"))?;
    Ok(Frame::Event {
        name: name.to_string(),
        payload,
    })
}

fn decode_ack(body: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(body)?;
    let payload = value
        .as_array()
        .and_then(|items| items.first())
        .cloned()
        .ok_or(DecodeError::Shape("ack body is not a non-empty array"))?;
    Ok(Frame::Ack(payload))
}
