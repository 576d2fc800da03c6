//! Textual `name: value` header lines carried in message bodies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Header line naming the sending peer
pub const SOURCE_ID: &str = "sourceID";
/// Header line naming the receiving peer
pub const DESTINATION_ID: &str = "destinationID";
/// Header line carrying a peer ID handed out by the relay
pub const PEER_ID: &str = "peerID";

/// A single `name: value` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderLine {
    /// Header name, never contains a colon or a line break
    pub name: String,
    /// Header value, never contains a line break
    pub value: String,
}

impl HeaderLine {
    /// Create a header line.
    ///
    /// Returns `None` if the name contains a colon or either part a line break.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Option<Self> {
        let line = Self {
            name: name.into(),
            value: value.into(),
        };
        line.is_valid().then_some(line)
    }

    /// Whether the line survives encoding as a single `name: value` line
    pub fn is_valid(&self) -> bool {
        !self.name.contains(':') && !has_line_break(&self.name) && !has_line_break(&self.value)
    }
}

/// Whether `text` contains CR or LF
pub(crate) fn has_line_break(text: &str) -> bool {
    text.contains(&['\r', '\n'][..])
}

impl fmt::Display for HeaderLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Split a line at its first colon.
///
/// The name has trailing whitespace removed, the value has leading spaces removed.
pub fn parse_header_line(line: &str) -> Option<HeaderLine> {
    let colon = line.find(':')?;
    let name = line[..colon].trim_end();
    let value = line[colon + 1..].trim_start_matches(' ');

    Some(HeaderLine {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Ordered header lines; names compare case-sensitively
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    lines: Vec<HeaderLine>,
}

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the first line with this name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| line.name == name)
            .map(|line| line.value.as_str())
    }

    /// Replace the value of an existing line or append a new one.
    ///
    /// Returns `false` and leaves the headers unchanged if the pair is not a
    /// valid header line.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        if has_line_break(&value) {
            return false;
        }
        if let Some(line) = self.lines.iter_mut().find(|line| line.name == name) {
            line.value = value;
            return true;
        }
        match HeaderLine::new(name, value) {
            Some(line) => {
                self.lines.push(line);
                true
            }
            None => false,
        }
    }

    /// Append a parsed line without replacing earlier ones
    pub fn push(&mut self, line: HeaderLine) {
        self.lines.push(line);
    }

    /// Remove every line with this name
    pub fn remove(&mut self, name: &str) {
        self.lines.retain(|line| line.name != name);
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &HeaderLine> {
        self.lines.iter()
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether there are no lines
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
