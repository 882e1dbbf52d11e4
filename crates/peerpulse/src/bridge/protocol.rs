//! Wire protocol types for coordinator-worker communication.
//!
//! One TCP stream, three phases:
//! - **Payload**: program bytes, ended by an idle pause or a length header
//! - **Bounds**: fixed 15-byte ASCII window `"<lower> <upper>"`
//! - **Result**: the payload's standard output, followed by a half-close

use serde::{Deserialize, Serialize};

/// Size of the bounds window that follows the payload.
pub const BOUNDS_RECORD_LEN: usize = 15;

pub const ENV_BOUND_LOWER: &str = "PROCESS_BOUND_LOWER";
pub const ENV_BOUND_UPPER: &str = "PROCESS_BOUND_UPPER";

/// Slice of the coordinator's computation assigned to this worker.
///
/// `lower <= upper` is expected but not checked here: an inverted range is
/// the payload's concern, not a protocol fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundsRecord {
    pub lower: u64,
    pub upper: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundsParseError {
    #[error("bounds record is empty")]
    Empty,

    #[error("bounds record is not ASCII")]
    NotAscii,

    #[error("expected 2 space-separated tokens, got {0}")]
    TokenCount(usize),

    #[error("invalid bound {token:?}: {reason}")]
    InvalidInteger { token: String, reason: String },
}

impl BoundsRecord {
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// Parse a received bounds window.
    ///
    /// Trailing padding (spaces, NULs, line endings) is ignored. The remaining
    /// text must be exactly two decimal integers separated by one space.
    pub fn parse(window: &[u8]) -> Result<Self, BoundsParseError> {
        if !window.is_ascii() {
            return Err(BoundsParseError::NotAscii);
        }
        let text = std::str::from_utf8(window).map_err(|_| BoundsParseError::NotAscii)?;
        let text = text.trim_end_matches(|c: char| c == '\0' || c.is_ascii_whitespace());
        if text.is_empty() {
            return Err(BoundsParseError::Empty);
        }

        let tokens: Vec<&str> = text.split(' ').collect();
        let [lower, upper] = tokens.as_slice() else {
            return Err(BoundsParseError::TokenCount(tokens.len()));
        };

        Ok(Self {
            lower: parse_bound(lower)?,
            upper: parse_bound(upper)?,
        })
    }

    /// Encode as the coordinator sends it: right-padded with spaces (or
    /// truncated) to exactly [`BOUNDS_RECORD_LEN`] bytes.
    pub fn padded(&self) -> Vec<u8> {
        let mut window = self.to_string().into_bytes();
        window.resize(BOUNDS_RECORD_LEN, b' ');
        window
    }

    /// Environment entries handed to the payload process.
    pub fn env(&self) -> [(&'static str, String); 2] {
        [
            (ENV_BOUND_LOWER, self.lower.to_string()),
            (ENV_BOUND_UPPER, self.upper.to_string()),
        ]
    }
}

impl std::fmt::Display for BoundsRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.lower, self.upper)
    }
}

fn parse_bound(token: &str) -> Result<u64, BoundsParseError> {
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BoundsParseError::InvalidInteger {
            token: token.to_string(),
            reason: "not a decimal integer".to_string(),
        });
    }
    token
        .parse::<u64>()
        .map_err(|e| BoundsParseError::InvalidInteger {
            token: token.to_string(),
            reason: e.to_string(),
        })
}
