//! Nod and chop positions and the positional nod-inference schemes.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Telescope nod position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Nod {
    A,
    B,
}

/// Chop half-cycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chop {
    A,
    B,
}

impl Nod {
    pub const ALL: [Nod; 2] = [Nod::A, Nod::B];

    /// Parse a nod header value (`"A"` or `"B"`, surrounding blanks ignored).
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim() {
            "A" => Some(Nod::A),
            "B" => Some(Nod::B),
            _ => None,
        }
    }
}

impl Chop {
    pub const ALL: [Chop; 2] = [Chop::A, Chop::B];
}

impl std::fmt::Display for Nod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Nod::A => write!(f, "A"),
            Nod::B => write!(f, "B"),
        }
    }
}

impl std::fmt::Display for Chop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chop::A => write!(f, "A"),
            Chop::B => write!(f, "B"),
        }
    }
}

/// Error for an unsupported nod scheme literal.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Scheme should be 'ABBA' or 'ABAB', got {0:?}")]
pub struct UnsupportedScheme(pub String);

/// Repeating nod pattern assumed when files carry no nod position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodScheme {
    /// A, B, B, A, A, B, B, A, ...
    #[default]
    Abba,
    /// A, B, A, B, ...
    Abab,
}

impl NodScheme {
    /// Nod of the file at `sequence` (0-based position in the sorted run).
    pub fn infer(&self, sequence: usize) -> Nod {
        match self {
            NodScheme::Abba => match sequence % 4 {
                0 | 3 => Nod::A,
                _ => Nod::B,
            },
            NodScheme::Abab => match sequence % 2 {
                0 => Nod::A,
                _ => Nod::B,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodScheme::Abba => "ABBA",
            NodScheme::Abab => "ABAB",
        }
    }
}

impl FromStr for NodScheme {
    type Err = UnsupportedScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ABBA" => Ok(NodScheme::Abba),
            "ABAB" => Ok(NodScheme::Abab),
            other => Err(UnsupportedScheme(other.to_string())),
        }
    }
}

impl std::fmt::Display for NodScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one of the four output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub nod: Nod,
    pub chop: Chop,
}

impl StreamId {
    /// The four streams in canonical order: (A,A), (A,B), (B,A), (B,B).
    pub const ALL: [StreamId; 4] = [
        StreamId::new(Nod::A, Chop::A),
        StreamId::new(Nod::A, Chop::B),
        StreamId::new(Nod::B, Chop::A),
        StreamId::new(Nod::B, Chop::B),
    ];

    pub const fn new(nod: Nod, chop: Chop) -> Self {
        Self { nod, chop }
    }

    /// Position in [`StreamId::ALL`].
    pub fn slot(&self) -> usize {
        let nod = match self.nod {
            Nod::A => 0,
            Nod::B => 2,
        };
        let chop = match self.chop {
            Chop::A => 0,
            Chop::B => 1,
        };
        nod + chop
    }

    /// Provenance label recorded when the stream is closed.
    pub fn label(&self) -> String {
        format!("Nod {}, Chop {}", self.nod, self.chop)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "nod{}_chop{}", self.nod, self.chop)
    }
}
