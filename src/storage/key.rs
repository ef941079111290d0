//! Logical addresses and their backend key strings.
//!
//! Every encoding is prefix-structured: a child address is its parent's
//! encoding followed by [`SEPARATOR`] and the child segment, so subkey tests
//! reduce to string prefix checks.

use crate::catalog::types::Value;
use crate::error::KvRelError;
use std::fmt;

pub const SEPARATOR: char = '/';

const ROW_TAG: &str = "PK";
const INDEX_TAG: &str = "I";
const UNIQUE_INDEX_TAG: &str = "U";
const KEYSET_TAG: &str = "KS";
const CATALOG_SUMMARY_KEY: &str = "$tables";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyTerm {
    /// Table metadata map.
    Table { table: String },
    /// Row marker; holds the pk value itself.
    PrimaryKey { table: String, pk: u64 },
    Field {
        table: String,
        pk: u64,
        field: String,
    },
    Index { table: String, index: String },
    /// Sentinel under which every row with `field = value` has an entry.
    IndexField {
        table: String,
        index: String,
        field: String,
        value: Value,
    },
    IndexPrimaryKey {
        table: String,
        index: String,
        field: String,
        value: Value,
        pk: u64,
    },
    UniqueIndex {
        table: String,
        index: String,
        field: String,
        value: Value,
    },
}

impl KeyTerm {
    pub fn table(&self) -> &str {
        match self {
            KeyTerm::Table { table }
            | KeyTerm::PrimaryKey { table, .. }
            | KeyTerm::Field { table, .. }
            | KeyTerm::Index { table, .. }
            | KeyTerm::IndexField { table, .. }
            | KeyTerm::IndexPrimaryKey { table, .. }
            | KeyTerm::UniqueIndex { table, .. } => table,
        }
    }

    /// Index keys are the only ones enumerated through subkey scans.
    pub fn is_scannable(&self) -> bool {
        matches!(
            self,
            KeyTerm::IndexField { .. } | KeyTerm::IndexPrimaryKey { .. }
        )
    }

    pub fn encode(&self) -> String {
        match self {
            KeyTerm::Table { table } => escape(table),
            KeyTerm::PrimaryKey { table, pk } => join(&[&escape(table), ROW_TAG, &pk.to_string()]),
            KeyTerm::Field { table, pk, field } => join(&[
                &escape(table),
                ROW_TAG,
                &pk.to_string(),
                &escape(field),
            ]),
            KeyTerm::Index { table, index } => join(&[&escape(table), INDEX_TAG, &escape(index)]),
            KeyTerm::IndexField {
                table,
                index,
                field,
                value,
            } => join(&[
                &escape(table),
                INDEX_TAG,
                &escape(index),
                &escape(field),
                &encode_value(value),
            ]),
            KeyTerm::IndexPrimaryKey {
                table,
                index,
                field,
                value,
                pk,
            } => join(&[
                &escape(table),
                INDEX_TAG,
                &escape(index),
                &escape(field),
                &encode_value(value),
                &pk.to_string(),
            ]),
            KeyTerm::UniqueIndex {
                table,
                index,
                field,
                value,
            } => join(&[
                &escape(table),
                UNIQUE_INDEX_TAG,
                &escape(index),
                &escape(field),
                &encode_value(value),
            ]),
        }
    }

    pub fn decode(key: &str) -> Result<KeyTerm, KvRelError> {
        let invalid = |reason: &str| KvRelError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if key == CATALOG_SUMMARY_KEY {
            return Err(invalid("reserved key"));
        }
        let segments: Vec<&str> = key.split(SEPARATOR).collect();
        let name = |i: usize| -> Result<String, KvRelError> {
            let raw = segments[i];
            if raw.is_empty() {
                return Err(invalid("empty segment"));
            }
            unescape(raw).ok_or_else(|| invalid("malformed escape"))
        };
        let pk = |i: usize| -> Result<u64, KvRelError> {
            let raw = segments[i];
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("primary key is not an unsigned integer"));
            }
            raw.parse().map_err(|_| invalid("primary key overflows u64"))
        };
        let value = |i: usize| -> Result<Value, KvRelError> {
            decode_value(segments[i]).ok_or_else(|| invalid("malformed field value"))
        };

        let table = name(0)?;
        if segments.len() == 1 {
            return Ok(KeyTerm::Table { table });
        }
        match (segments[1], segments.len()) {
            (ROW_TAG, 3) => Ok(KeyTerm::PrimaryKey { table, pk: pk(2)? }),
            (ROW_TAG, 4) => Ok(KeyTerm::Field {
                table,
                pk: pk(2)?,
                field: name(3)?,
            }),
            (INDEX_TAG, 3) => Ok(KeyTerm::Index {
                table,
                index: name(2)?,
            }),
            (INDEX_TAG, 5) => Ok(KeyTerm::IndexField {
                table,
                index: name(2)?,
                field: name(3)?,
                value: value(4)?,
            }),
            (INDEX_TAG, 6) => Ok(KeyTerm::IndexPrimaryKey {
                table,
                index: name(2)?,
                field: name(3)?,
                value: value(4)?,
                pk: pk(5)?,
            }),
            (UNIQUE_INDEX_TAG, 5) => Ok(KeyTerm::UniqueIndex {
                table,
                index: name(2)?,
                field: name(3)?,
                value: value(4)?,
            }),
            (ROW_TAG | INDEX_TAG | UNIQUE_INDEX_TAG, _) => Err(invalid("wrong segment count")),
            _ => Err(invalid("unknown key tag")),
        }
    }
}

impl fmt::Display for KeyTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

pub fn encode(term: &KeyTerm) -> String {
    term.encode()
}

pub fn decode(key: &str) -> Result<KeyTerm, KvRelError> {
    KeyTerm::decode(key)
}

/// True when `child` lies strictly below `parent`.
pub fn is_subkey(parent: &str, child: &str) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child[parent.len()..].starts_with(SEPARATOR)
}

/// Register holding the table's ordered key set.
pub fn keyset_key(table: &str) -> String {
    join(&[&escape(table), KEYSET_TAG])
}

/// Register listing every created table.
pub fn catalog_summary_key() -> &'static str {
    CATALOG_SUMMARY_KEY
}

fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.push_str(part);
    }
    out
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%2F"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "2F" => out.push(SEPARATOR),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::Integer(i) => format!("i:{i}"),
        Value::Float(x) => format!("f:{:016x}", x.to_bits()),
        Value::Boolean(b) => format!("b:{b}"),
        Value::Text(s) => format!("s:{}", escape(s)),
    }
}

fn decode_value(raw: &str) -> Option<Value> {
    let (tag, body) = raw.split_at_checked(2)?;
    match tag {
        "i:" => body.parse().ok().map(Value::Integer),
        "f:" if body.len() == 16 => u64::from_str_radix(body, 16)
            .ok()
            .map(|bits| Value::Float(f64::from_bits(bits))),
        "b:" => match body {
            "true" => Some(Value::Boolean(true)),
            "false" => Some(Value::Boolean(false)),
            _ => None,
        },
        "s:" => unescape(body).map(|s| Value::Text(s.into())),
        _ => None,
    }
}
