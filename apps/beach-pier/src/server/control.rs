//! Inbound frame classification for the terminal socket.
//!
//! Two framings are supported:
//!
//! * [`Framing::Compat`] (default): every frame, text or binary, is first
//!   tried as JSON. An object with `"type": "resize"` and numeric `cols` /
//!   `rows` is a control message; anything else is raw terminal input. A user
//!   who types a literal `{"type":"resize","cols":1,"rows":1}` therefore
//!   resizes their terminal instead of sending those characters. Clients that
//!   cannot live with that should negotiate [`FRAMED_SUBPROTOCOL`].
//! * [`Framing::Explicit`]: binary frames are always raw input and text frames
//!   are always control messages.

use serde_json::Value;

/// WebSocket subprotocol that selects [`Framing::Explicit`].
pub const FRAMED_SUBPROTOCOL: &str = "beach-pier.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Compat,
    Explicit,
}

impl Framing {
    pub fn from_subprotocol(protocol: Option<&str>) -> Self {
        match protocol {
            Some(FRAMED_SUBPROTOCOL) => Framing::Explicit,
            _ => Framing::Compat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes for the shell's stdin, unmodified.
    Input(Vec<u8>),
    /// Resize request. Values come straight off the wire; zero or
    /// out-of-range sizes are rejected later by the session.
    Resize { cols: u64, rows: u64 },
    /// Text frame under explicit framing that is not a known control message.
    Unknown(String),
}

/// Classifies a text frame.
pub fn classify_text(framing: Framing, text: String) -> Inbound {
    match framing {
        Framing::Compat => match parse_resize(text.as_bytes()) {
            Some((cols, rows)) => Inbound::Resize { cols, rows },
            None => Inbound::Input(text.into_bytes()),
        },
        Framing::Explicit => match parse_resize(text.as_bytes()) {
            Some((cols, rows)) => Inbound::Resize { cols, rows },
            None => Inbound::Unknown(text),
        },
    }
}

/// Classifies a binary frame.
pub fn classify_binary(framing: Framing, bytes: Vec<u8>) -> Inbound {
    match framing {
        Framing::Compat => match parse_resize(&bytes) {
            Some((cols, rows)) => Inbound::Resize { cols, rows },
            None => Inbound::Input(bytes),
        },
        Framing::Explicit => Inbound::Input(bytes),
    }
}

fn parse_resize(payload: &[u8]) -> Option<(u64, u64)> {
    // Cheap reject so ordinary keystrokes never reach the JSON parser.
    let first = payload.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }
    let value: Value = serde_json::from_slice(payload).ok()?;
    let object = value.as_object()?;
    if object.get("type").and_then(Value::as_str) != Some("resize") {
        return None;
    }
    let cols = read_dimension(object.get("cols")?)?;
    let rows = read_dimension(object.get("rows")?)?;
    Some((cols, rows))
}

fn read_dimension(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    // Negative or fractional numbers still mark the frame as control; the
    // session rejects the size.
    match value.as_f64() {
        Some(n) if n.is_finite() && n > 0.0 => Some(n.trunc() as u64),
        Some(_) => Some(0),
        None => None,
    }
}

/// Narrows wire dimensions to what a pty accepts.
pub fn pty_dimensions(cols: u64, rows: u64) -> Option<(u16, u16)> {
    let cols = u16::try_from(cols).ok().filter(|c| *c > 0)?;
    let rows = u16::try_from(rows).ok().filter(|r| *r > 0)?;
    Some((cols, rows))
}
