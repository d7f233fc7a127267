//! On-disk records.
//!
//! All three records are text with space-separated tokens and a newline at
//! the end of every line:
//!
//! ```text
//! base:      count factor type_code root_path root_kind_code
//!
//! internal:  child_kind_code child_count
//!            key_1 ... key_{child_count-1}
//!            path_1 ... path_{child_count}
//!
//! leaf:      entry_count left_path right_path
//!            key_1 ... key_{entry_count}
//!            length_1 ... length_{entry_count}
//!            <value bytes, concatenated, no separator>
//! ```
//!
//! An absent root or sibling is written as [NULL_PATH].

use std::str::FromStr;

use thiserror::Error;

use crate::key::{Key, KeyType};
use crate::node::NodeKind;

/// Written in place of an absent path. Generated file names never take this
/// value.
pub const NULL_PATH: &str = "-";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{record} record ends before its {what}")]
    Missing {
        record: &'static str,
        what: &'static str,
    },

    #[error("{record} record has an invalid {what}: {token:?}")]
    Invalid {
        record: &'static str,
        what: &'static str,
        token: String,
    },

    #[error("{record} record announces {expected} {what} but holds {found}")]
    Count {
        record: &'static str,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("internal record has no children")]
    Childless,

    #[error("{record} record has trailing data")]
    Trailing { record: &'static str },

    #[error("node has no file name yet and cannot be referenced")]
    Unnamed,
}

type Result<T> = std::result::Result<T, CodecError>;

fn path_token(path: Option<&str>) -> &str {
    path.unwrap_or(NULL_PATH)
}

fn optional_path(token: &str) -> Option<String> {
    (token != NULL_PATH).then(|| token.to_string())
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a record into newline-terminated lines.
struct Lines<'a> {
    record: &'static str,
    rest: &'a str,
}

impl<'a> Lines<'a> {
    fn new(record: &'static str, bytes: &'a [u8]) -> Result<Self> {
        let rest = std::str::from_utf8(bytes).map_err(|_| CodecError::Invalid {
            record,
            what: "encoding",
            token: String::from_utf8_lossy(bytes).into_owned(),
        })?;
        Ok(Self { record, rest })
    }

    fn line(&mut self, what: &'static str) -> Result<Tokens<'a>> {
        let Some(end) = self.rest.find('\n') else {
            return Err(CodecError::Missing {
                record: self.record,
                what,
            });
        };
        let line = &self.rest[..end];
        self.rest = &self.rest[end + 1..];
        Ok(Tokens {
            record: self.record,
            tokens: line.split_whitespace(),
        })
    }

    fn finish(self) -> Result<()> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(CodecError::Trailing {
                record: self.record,
            })
        }
    }
}

struct Tokens<'a> {
    record: &'static str,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next(&mut self, what: &'static str) -> Result<&'a str> {
        self.tokens.next().ok_or(CodecError::Missing {
            record: self.record,
            what,
        })
    }

    fn parse<T: FromStr>(&mut self, what: &'static str) -> Result<T> {
        let token = self.next(what)?;
        token.parse().map_err(|_| CodecError::Invalid {
            record: self.record,
            what,
            token: token.to_string(),
        })
    }

    fn kind(&mut self, what: &'static str) -> Result<NodeKind> {
        let token = self.next(what)?;
        token
            .parse()
            .ok()
            .and_then(NodeKind::from_code)
            .ok_or_else(|| CodecError::Invalid {
                record: self.record,
                what,
                token: token.to_string(),
            })
    }

    fn rest<T>(
        self,
        what: &'static str,
        expected: usize,
        mut parse: impl FnMut(&str) -> Option<T>,
    ) -> Result<Vec<T>> {
        let record = self.record;
        let mut items = Vec::with_capacity(expected);
        for token in self.tokens {
            items.push(parse(token).ok_or_else(|| CodecError::Invalid {
                record,
                what,
                token: token.to_string(),
            })?);
        }
        if items.len() != expected {
            return Err(CodecError::Count {
                record,
                what,
                expected,
                found: items.len(),
            });
        }
        Ok(items)
    }

    fn end(mut self) -> Result<()> {
        match self.tokens.next() {
            None => Ok(()),
            Some(_) => Err(CodecError::Trailing {
                record: self.record,
            }),
        }
    }
}

/// A tree's metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseRecord {
    pub count: u64,
    pub factor: usize,
    pub key_type: KeyType,
    pub root: Option<String>,
    pub root_kind: NodeKind,
}

impl BaseRecord {
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{} {} {} {} {}\n",
            self.count,
            self.factor,
            self.key_type.code(),
            path_token(self.root.as_deref()),
            self.root_kind.code()
        )
        .into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        const RECORD: &str = "base";
        let mut lines = Lines::new(RECORD, bytes)?;
        let mut tokens = lines.line("header")?;
        let count = tokens.parse("count")?;
        let factor = tokens.parse("factor")?;
        let code = tokens.next("tree type")?;
        let key_type = code
            .parse()
            .ok()
            .and_then(KeyType::from_code)
            .ok_or_else(|| CodecError::Invalid {
                record: RECORD,
                what: "tree type",
                token: code.to_string(),
            })?;
        let root = optional_path(tokens.next("root path")?);
        let root_kind = tokens.kind("root kind")?;
        tokens.end()?;
        lines.finish()?;
        if root.is_none() && root_kind != NodeKind::Leaf {
            return Err(CodecError::Invalid {
                record: RECORD,
                what: "root kind for an empty tree",
                token: root_kind.code().to_string(),
            });
        }
        Ok(Self {
            count,
            factor,
            key_type,
            root,
            root_kind,
        })
    }
}

/// An internal node: `children.len() == keys.len() + 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalRecord {
    pub child_kind: NodeKind,
    pub keys: Vec<Key>,
    pub children: Vec<String>,
}

impl InternalRecord {
    pub fn encode(&self) -> Vec<u8> {
        debug_assert_eq!(self.children.len(), self.keys.len() + 1);
        format!(
            "{} {}\n{}\n{}\n",
            self.child_kind.code(),
            self.children.len(),
            join(&self.keys),
            self.children.join(" ")
        )
        .into_bytes()
    }

    pub fn decode(bytes: &[u8], key_type: KeyType) -> Result<Self> {
        const RECORD: &str = "internal";
        let mut lines = Lines::new(RECORD, bytes)?;
        let mut header = lines.line("header")?;
        let child_kind = header.kind("child kind")?;
        let child_count: usize = header.parse("child count")?;
        header.end()?;
        if child_count == 0 {
            return Err(CodecError::Childless);
        }
        let keys = lines
            .line("keys")?
            .rest("key", child_count - 1, |t| key_type.parse(t))?;
        let children = lines
            .line("children")?
            .rest("child path", child_count, |t| optional_path(t))?;
        lines.finish()?;
        Ok(Self {
            child_kind,
            keys,
            children,
        })
    }
}

/// The text part of a leaf record. The value bytes follow it in the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafHeader {
    pub prev: Option<String>,
    pub next: Option<String>,
    pub keys: Vec<Key>,
    pub lengths: Vec<u64>,
}

impl LeafHeader {
    /// Number of lines in the header.
    pub const LINES: usize = 3;

    pub fn encode(&self) -> Vec<u8> {
        debug_assert_eq!(self.keys.len(), self.lengths.len());
        format!(
            "{} {} {}\n{}\n{}\n",
            self.keys.len(),
            path_token(self.prev.as_deref()),
            path_token(self.next.as_deref()),
            join(&self.keys),
            join(&self.lengths)
        )
        .into_bytes()
    }

    /// Decodes the header at the start of `bytes`, which may continue with
    /// value data. Returns the header and its length in bytes, which is
    /// where the values start.
    pub fn decode(bytes: &[u8], key_type: KeyType) -> Result<(Self, usize)> {
        const RECORD: &str = "leaf";
        let end = bytes
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .nth(Self::LINES - 1)
            .map(|(i, _)| i + 1)
            .ok_or(CodecError::Missing {
                record: RECORD,
                what: "header",
            })?;
        let mut lines = Lines::new(RECORD, &bytes[..end])?;
        let mut header = lines.line("header")?;
        let count: usize = header.parse("entry count")?;
        let prev = optional_path(header.next("left sibling")?);
        let next = optional_path(header.next("right sibling")?);
        header.end()?;
        let keys = lines.line("keys")?.rest("key", count, |t| key_type.parse(t))?;
        let lengths = lines
            .line("lengths")?
            .rest("value length", count, |t| t.parse().ok())?;
        lines.finish()?;
        Ok((
            Self {
                prev,
                next,
                keys,
                lengths,
            },
            end,
        ))
    }

    /// Byte ranges `(offset, length)` of the values, given where the value
    /// region starts.
    pub fn value_ranges(&self, start: u64) -> Vec<(u64, u64)> {
        let mut offset = start;
        self.lengths
            .iter()
            .map(|&len| {
                let range = (offset, len);
                offset += len;
                range
            })
            .collect()
    }
}
