//! Packed provisional designation decoding
//!
//! A packed designation is 8 positional characters:
//!
//! | index | meaning                                   |
//! |-------|-------------------------------------------|
//! | 0     | object type (`C`, `P`, `D`, `X`, ...)     |
//! | 1     | century code (`I`=1800, `J`=1900, `K`=2000) |
//! | 2-3   | year within century                       |
//! | 4     | half-month letter                         |
//! | 5-6   | order within the half-month               |
//! | 7     | fragment, `0` when there is none          |
//!
//! `CK20A010` decodes to `C/2020 A01`, `PJ95A01B` to `P/1995 A01-B`.
//! Designations starting with a digit are already permanent/numbered and
//! pass through unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Width of a packed provisional designation
pub const PACKED_LEN: usize = 8;

/// Fragment code meaning "no fragment"
const NO_FRAGMENT: char = '0';

/// Designation decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Packed designation {input:?} has {len} characters, expected {PACKED_LEN}")]
    WrongLength { input: String, len: usize },

    #[error("Unknown century code {code:?} in packed designation {input:?}")]
    UnknownCentury { input: String, code: char },

    #[error("Invalid {field} in packed designation {input:?}")]
    InvalidField { input: String, field: &'static str },
}

impl DecodeError {
    /// The input that failed to decode
    pub fn input(&self) -> &str {
        match self {
            DecodeError::WrongLength { input, .. }
            | DecodeError::UnknownCentury { input, .. }
            | DecodeError::InvalidField { input, .. } => input,
        }
    }
}

/// Canonical catalogue designation, e.g. `C/2020 A01` or `0003D`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalDesignation(String);

impl CanonicalDesignation {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalDesignation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Map century code to the first year of the century
fn century_base(code: char) -> Option<u32> {
    match code {
        'I' => Some(1800),
        'J' => Some(1900),
        'K' => Some(2000),
        _ => None,
    }
}

/// Decode a packed designation into canonical form.
///
/// Pure and total: every input yields either a designation or a
/// [`DecodeError`] carrying the offending input.
pub fn decode(packed: &str) -> Result<CanonicalDesignation, DecodeError> {
    let chars: Vec<char> = packed.chars().collect();

    if chars.first().is_some_and(|c| c.is_ascii_digit()) {
        return Ok(CanonicalDesignation::new(packed));
    }

    if chars.len() != PACKED_LEN {
        return Err(DecodeError::WrongLength {
            input: packed.to_string(),
            len: chars.len(),
        });
    }

    let invalid = |field: &'static str| DecodeError::InvalidField {
        input: packed.to_string(),
        field,
    };

    let object_type = chars[0];
    if !object_type.is_ascii_alphabetic() {
        return Err(invalid("object type"));
    }

    let century = century_base(chars[1]).ok_or_else(|| DecodeError::UnknownCentury {
        input: packed.to_string(),
        code: chars[1],
    })?;

    let year = two_digits(chars[2], chars[3]).ok_or_else(|| invalid("year"))?;

    let half_month = chars[4];
    if !half_month.is_ascii_uppercase() {
        return Err(invalid("half-month letter"));
    }

    if two_digits(chars[5], chars[6]).is_none() {
        return Err(invalid("order number"));
    }

    let mut canonical = format!(
        "{}/{} {}{}{}",
        object_type,
        century + year,
        half_month,
        chars[5],
        chars[6]
    );

    let fragment = chars[7];
    if fragment != NO_FRAGMENT {
        canonical.push('-');
        canonical.push(fragment);
    }

    Ok(CanonicalDesignation(canonical))
}

fn two_digits(tens: char, ones: char) -> Option<u32> {
    Some(tens.to_digit(10)? * 10 + ones.to_digit(10)?)
}
