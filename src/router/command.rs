//! Addressed text commands: `TARGET:VERB[:VALUE]`

use std::fmt;

use crate::mesh::Address;

/// Duty cycle used when `DUTY` carries no value
pub const DEFAULT_DUTY: i64 = 50;

/// Who a command is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every node, via the group address
    All,
    /// Node index, an offset from the node base address
    Index(u16),
}

impl Target {
    /// Unicast address for an indexed target
    #[must_use]
    pub const fn address(self, node_base: Address) -> Option<Address> {
        match self {
            Self::All => None,
            Self::Index(i) => Some(node_base.offset(i)),
        }
    }
}

/// What the command asks for
///
/// `ON` maps to [`Action::Ramp`], not a sustained on: the deployed fleet uses
/// it to trigger the same demonstration ramp as `RAMP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ramp,
    Stop,
    SetLevel(i64),
    Read,
    /// Arm the periodic poller; never forwarded
    Monitor,
}

impl Action {
    /// Verb as sent in a vendor payload; `None` for monitor
    #[must_use]
    pub fn wire(self) -> Option<String> {
        match self {
            Self::Ramp => Some("r".to_string()),
            Self::Stop => Some("s".to_string()),
            Self::SetLevel(n) => Some(format!("duty:{n}")),
            Self::Read => Some("read".to_string()),
            Self::Monitor => None,
        }
    }

    /// Value sent on the reduced on/off path
    #[must_use]
    pub const fn onoff_value(self) -> u8 {
        match self {
            Self::Stop => 0,
            _ => 1,
        }
    }
}

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub target: Target,
    /// Verb as typed, upper-cased, for the `SENT:` reply
    pub keyword: String,
    pub action: Action,
}

/// Why a command was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    NoNodeId,
    NoCommand,
    InvalidNode,
    UnknownCommand(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoNodeId => f.write_str("ERROR:NO_NODE_ID"),
            Self::NoCommand => f.write_str("ERROR:NO_COMMAND"),
            Self::InvalidNode => f.write_str("ERROR:INVALID_NODE"),
            Self::UnknownCommand(verb) => write!(f, "ERROR:UNKNOWN_CMD:{verb}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Cut `input` to at most `max_len` bytes on a character boundary
#[must_use]
pub fn truncate(input: &str, max_len: usize) -> &str {
    if input.len() <= max_len {
        return input;
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

/// Parse a command, accepting indices in `0..max_nodes`
///
/// # Errors
///
/// Returns the reply to send back when the command is refused
pub fn parse(input: &str, max_len: usize, max_nodes: usize) -> Result<Command, ParseError> {
    let input = truncate(input, max_len).trim();
    let mut parts = input.split(':').map(str::trim);

    let target = match parts.next() {
        None | Some("") => return Err(ParseError::NoNodeId),
        Some(t) if t.eq_ignore_ascii_case("ALL") => Target::All,
        Some(t) => {
            let index: i64 = t.parse().map_err(|_| ParseError::InvalidNode)?;
            let in_range = usize::try_from(index).is_ok_and(|i| i < max_nodes);
            if !in_range {
                return Err(ParseError::InvalidNode);
            }
            Target::Index(u16::try_from(index).map_err(|_| ParseError::InvalidNode)?)
        }
    };

    let verb = match parts.next() {
        None | Some("") => return Err(ParseError::NoCommand),
        Some(v) => v,
    };
    let value = parts.next().filter(|v| !v.is_empty());

    let keyword = verb.to_ascii_uppercase();
    let action = match keyword.as_str() {
        "RAMP" | "ON" => Action::Ramp,
        "STOP" | "OFF" => Action::Stop,
        "DUTY" => Action::SetLevel(value.map_or(DEFAULT_DUTY, leading_int)),
        "STATUS" | "READ" => Action::Read,
        "MONITOR" => Action::Monitor,
        _ => return Err(ParseError::UnknownCommand(verb.to_string())),
    };

    Ok(Command {
        target,
        keyword,
        action,
    })
}

/// Integer from the leading digits of `s`, 0 when there are none
///
/// An optional sign is honored and anything after the digits is ignored, so
/// `"75x"` reads as 75. Saturates instead of overflowing.
fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |n, d| n.saturating_mul(10).saturating_add(i64::from(d - b'0')));
    if negative { -magnitude } else { magnitude }
}
