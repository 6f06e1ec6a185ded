//! Trust requests and answers, and their line encoding
//!
//! The same record travels from caller to stub and from stub to skeleton:
//! `<pid> <uid> <feature>`, answered by a single `granted` or `denied` token.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a line could not be turned into a request or answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected 3 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("unknown answer token: {0:?}")]
    UnknownAnswer(String),
}

/// One "may this process use this feature" query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustRequest {
    pub pid: u32,
    pub uid: u32,
    pub feature: u64,
}

impl TrustRequest {
    pub fn new(pid: u32, uid: u32, feature: u64) -> Self {
        Self { pid, uid, feature }
    }
}

impl fmt::Display for TrustRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.pid, self.uid, self.feature)
    }
}

impl FromStr for TrustRequest {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(ParseError::FieldCount(fields.len()));
        }

        Ok(Self {
            pid: parse_field("pid", fields[0])?,
            uid: parse_field("uid", fields[1])?,
            feature: parse_field("feature", fields[2])?,
        })
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// The verdict for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Answer {
    Granted,
    Denied,
}

impl Answer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }

    pub fn is_granted(&self) -> bool {
        *self == Self::Granted
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Answer {
    type Err = ParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.trim() {
            "granted" => Ok(Self::Granted),
            "denied" => Ok(Self::Denied),
            other => Err(ParseError::UnknownAnswer(other.to_string())),
        }
    }
}
