//! Fail-fast normalization of untrusted identifier lists.
//!
//! Feed payloads and admin forms deliver ids as strings, integers, JSON
//! numbers and blanks. Everything is funnelled through one strict decimal
//! grammar so that forms such as `"0x10"`, `"010"` or `"1_000"` are rejected
//! instead of being silently reinterpreted.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

static STRICT_INTEGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?(0|[1-9][0-9]*)$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Not a strict base-10 integer literal
    InvalidIdFormat(String),
    /// Parsed, but zero or negative
    NonPositiveId(i64),
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::InvalidIdFormat(literal) => write!(f, "Invalid id format: {literal:?}"),
            IdError::NonPositiveId(id) => write!(f, "Id must be positive: {id}"),
        }
    }
}

impl std::error::Error for IdError {}

/// One raw identifier as delivered by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum RawToken<'a> {
    Text(Cow<'a, str>),
    Int(i64),
    Null,
}

impl<'a> RawToken<'a> {
    pub(crate) fn as_text(&self) -> Cow<'_, str> {
        match self {
            RawToken::Text(s) => Cow::Borrowed(s.as_ref()),
            RawToken::Int(i) => Cow::Owned(i.to_string()),
            RawToken::Null => Cow::Borrowed(""),
        }
    }
}

impl<'a> From<&'a str> for RawToken<'a> {
    fn from(s: &'a str) -> Self {
        RawToken::Text(Cow::Borrowed(s))
    }
}

impl<'a> From<&'a String> for RawToken<'a> {
    fn from(s: &'a String) -> Self {
        RawToken::Text(Cow::Borrowed(s.as_str()))
    }
}

impl From<String> for RawToken<'static> {
    fn from(s: String) -> Self {
        RawToken::Text(Cow::Owned(s))
    }
}

impl From<i64> for RawToken<'static> {
    fn from(i: i64) -> Self {
        RawToken::Int(i)
    }
}

impl From<i32> for RawToken<'static> {
    fn from(i: i32) -> Self {
        RawToken::Int(i64::from(i))
    }
}

impl<'a, T: Into<RawToken<'a>>> From<Option<T>> for RawToken<'a> {
    fn from(value: Option<T>) -> Self {
        value.map_or(RawToken::Null, Into::into)
    }
}

impl<'a> From<&'a Value> for RawToken<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Null => RawToken::Null,
            Value::String(s) => RawToken::Text(Cow::Borrowed(s.as_str())),
            Value::Number(n) => match n.as_i64() {
                Some(i) => RawToken::Int(i),
                // floats and out-of-range integers fail the grammar below
                None => RawToken::Text(Cow::Owned(n.to_string())),
            },
            other => RawToken::Text(Cow::Owned(other.to_string())),
        }
    }
}

/// Parse a strict base-10 integer: optional `-`, digits, no leading zeros
/// except for `"0"` itself. Surrounding whitespace is trimmed.
pub fn parse_strict_integer(raw: &str) -> Result<i64, IdError> {
    let trimmed = raw.trim();
    if !STRICT_INTEGER.is_match(trimmed) {
        return Err(IdError::InvalidIdFormat(trimmed.to_string()));
    }
    trimmed
        .parse::<i64>()
        .map_err(|_| IdError::InvalidIdFormat(trimmed.to_string()))
}

/// Parse one token into a positive id. Blank tokens yield `Ok(None)`.
pub fn parse_id(token: &RawToken<'_>) -> Result<Option<i64>, IdError> {
    let text = token.as_text();
    if text.trim().is_empty() {
        return Ok(None);
    }
    let id = parse_strict_integer(&text)?;
    if id <= 0 {
        return Err(IdError::NonPositiveId(id));
    }
    Ok(Some(id))
}

/// Normalize a raw id list into a sorted, deduplicated list of positive ids.
///
/// Blank and null entries are dropped. The first malformed or non-positive
/// entry aborts the whole list.
///
/// ```
/// use variantguard::ids::{normalize_ids, IdError};
///
/// assert_eq!(normalize_ids(["3", " 1", "", "3"]), Ok(vec![1, 3]));
/// assert!(matches!(normalize_ids(["0x10"]), Err(IdError::InvalidIdFormat(_))));
/// ```
pub fn normalize_ids<'a, I, T>(raw: I) -> Result<Vec<i64>, IdError>
where
    I: IntoIterator<Item = T>,
    T: Into<RawToken<'a>>,
{
    let mut ids = Vec::new();
    for token in raw {
        if let Some(id) = parse_id(&token.into())? {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}
