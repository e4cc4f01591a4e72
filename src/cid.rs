//! Content identifiers returned by the ingestion service.
//!
//! The core never computes identifiers. It only checks that the string the
//! service sent is a well-formed CID and keeps it for the caller.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Length of a base58 CIDv0 (sha2-256 multihash)
const CID_V0_LEN: usize = 46;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidError {
    #[error("empty identifier")]
    Empty,
    #[error("unknown multibase prefix {0:?}")]
    UnknownBase(char),
    #[error("invalid character {ch:?} for {base}")]
    InvalidChar { ch: char, base: &'static str },
    #[error("missing identifier body")]
    MissingBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CidVersion {
    V0,
    V1,
}

/// Decoded content identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid {
    version: CidVersion,
    text: String,
}

impl Cid {
    pub fn version(&self) -> CidVersion {
        self.version
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Multibase prefix of a v1 identifier (`None` for v0, which is bare base58)
    pub fn multibase(&self) -> Option<char> {
        match self.version {
            CidVersion::V0 => None,
            CidVersion::V1 => self.text.chars().next(),
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

fn check_alphabet(body: &str, base: &'static str, ok: impl Fn(char) -> bool) -> Result<(), CidError> {
    match body.chars().find(|c| !ok(*c)) {
        Some(ch) => Err(CidError::InvalidChar { ch, base }),
        None => Ok(()),
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CidError::Empty);
        }

        if s.len() == CID_V0_LEN && s.starts_with("Qm") {
            check_alphabet(s, "base58btc", |c| BASE58_ALPHABET.contains(c))?;
            return Ok(Self {
                version: CidVersion::V0,
                text: s.to_string(),
            });
        }

        let mut chars = s.chars();
        let prefix = chars.next().ok_or(CidError::Empty)?;
        let body = chars.as_str();
        if body.is_empty() {
            return Err(CidError::MissingBody);
        }

        match prefix {
            'b' => check_alphabet(body, "base32", |c| matches!(c, 'a'..='z' | '2'..='7'))?,
            'B' => check_alphabet(body, "base32upper", |c| matches!(c, 'A'..='Z' | '2'..='7'))?,
            'z' => check_alphabet(body, "base58btc", |c| BASE58_ALPHABET.contains(c))?,
            'f' => check_alphabet(body, "base16", |c| matches!(c, '0'..='9' | 'a'..='f'))?,
            'F' => check_alphabet(body, "base16upper", |c| matches!(c, '0'..='9' | 'A'..='F'))?,
            'k' => check_alphabet(body, "base36", |c| matches!(c, '0'..='9' | 'a'..='z'))?,
            'K' => check_alphabet(body, "base36upper", |c| matches!(c, '0'..='9' | 'A'..='Z'))?,
            'm' => check_alphabet(body, "base64", |c| {
                c.is_ascii_alphanumeric() || c == '+' || c == '/'
            })?,
            'u' => check_alphabet(body, "base64url", |c| {
                c.is_ascii_alphanumeric() || c == '-' || c == '_'
            })?,
            other => return Err(CidError::UnknownBase(other)),
        }

        Ok(Self {
            version: CidVersion::V1,
            text: s.to_string(),
        })
    }
}

/// Parser applied to the `cid` field of every RESULT reply
pub type CidParser = Arc<dyn Fn(&str) -> Result<Cid, CidError> + Send + Sync>;

pub fn default_parser() -> CidParser {
    Arc::new(|s: &str| s.parse::<Cid>())
}
