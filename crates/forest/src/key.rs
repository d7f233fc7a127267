//! Keys and values stored in trees.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use forest_storage::FileReader;
use serde::{Deserialize, Serialize};

use crate::error::{ForestError, Result};

/// The kind of key a tree is ordered by.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Int,
    String,
}

impl KeyType {
    /// Code stored in a tree's base record.
    pub fn code(self) -> u8 {
        match self {
            KeyType::Int => 0,
            KeyType::String => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(KeyType::Int),
            1 => Some(KeyType::String),
            _ => None,
        }
    }

    /// Checks that `key` may be stored in a tree of this type.
    pub fn check(self, key: &Key) -> Result<()> {
        match (self, key) {
            (KeyType::Int, Key::Int(_)) => Ok(()),
            (KeyType::String, Key::Str(s)) => check_token(s),
            _ => Err(ForestError::InvalidInput(format!(
                "key {key} does not fit a tree of {self:?} keys"
            ))),
        }
    }

    /// Parses one on-disk key token.
    pub fn parse(self, token: &str) -> Option<Key> {
        match self {
            KeyType::Int => token.parse().ok().map(Key::Int),
            KeyType::String if !token.is_empty() => Some(Key::Str(token.to_string())),
            KeyType::String => None,
        }
    }
}

/// Keys are written whitespace-delimited, so they must be non-empty words.
pub(crate) fn check_token(token: &str) -> Result<()> {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(ForestError::InvalidInput(format!(
            "{token:?} is not a valid key: keys must be non-empty and free of whitespace"
        )));
    }
    Ok(())
}

/// A tree key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            Key::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(n) => Some(*n),
            Key::Str(_) => None,
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Str(s) => f.write_str(s),
        }
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value)
    }
}

/// A value stored under a key.
///
/// A value written since its leaf was last saved is held in memory. Once the
/// leaf is saved, the value becomes a byte range of the leaf's file and is
/// only read when asked for.
#[derive(Clone)]
pub enum Value {
    Inline(Arc<[u8]>),
    Stored {
        file: Arc<dyn FileReader>,
        offset: u64,
        len: u64,
    },
}

impl Value {
    pub fn len(&self) -> u64 {
        match self {
            Value::Inline(bytes) => bytes.len() as u64,
            Value::Stored { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value's bytes, reading them from disk if necessary.
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            Value::Inline(bytes) => Ok(bytes.to_vec()),
            Value::Stored { len: 0, .. } => Ok(Vec::new()),
            Value::Stored { file, offset, len } => Ok(file.read_at(*offset, *len as usize)?),
        }
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Inline(value.into())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Inline(value.into())
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
            Value::Stored { file, offset, len } => {
                write!(f, "Stored({}@{offset}+{len})", file.name())
            }
        }
    }
}
