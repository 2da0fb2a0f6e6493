//! Canonical cache keys.
//!
//! A [`CacheKey`] is the canonical text rendering of every parameter that
//! defines a backend object, plus an xxh3 hash of that text computed once at
//! construction. Equal inputs always render equal text, so the key can be
//! compared exactly while map lookups only hash a single `u64`.
//!
//! Keys are rendered as bracketed lists:
//!
//! ```text
//! [0x11:0x6:1,null,0x10:0x1:4]      descriptor-set layout
//! [0x11,0,64][0x11:0x6:1][null]     pipeline layout
//! ```

use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Clone)]
pub struct CacheKey {
    text: Arc<str>,
    hash: u64,
}

impl CacheKey {
    #[must_use]
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        let text = text.into();
        let hash = xxh3_64(text.as_bytes());
        Self { text, hash }
    }

    /// Key made of several keys rendered back to back.
    #[must_use]
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut text = String::new();
        for part in parts {
            text.push_str(part);
        }
        Self::new(text)
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[inline]
    #[must_use]
    pub const fn hash64(&self) -> u64 {
        self.hash
    }

    /// Whether `field` is the whole key or one whole field of it, at any
    /// nesting depth. A nested key counts as one field, so a library key
    /// matches every linked key built from it.
    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        if *self.text == *field {
            return true;
        }
        // start of the field being read, one per open list
        let mut starts: Vec<usize> = Vec::new();
        for (i, c) in self.text.char_indices() {
            match c {
                '[' => starts.push(i + 1),
                ',' | ']' => {
                    let Some(start) = starts.last_mut() else {
                        continue;
                    };
                    if i > *start && &self.text[*start..i] == field {
                        return true;
                    }
                    if c == ',' {
                        *start = i + 1;
                    } else {
                        starts.pop();
                    }
                }
                _ => {}
            }
        }
        false
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.text == other.text
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.text.cmp(&other.text)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.text)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

/// Renders a `[a,b,c]` list.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    buf: String,
    fields: usize,
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheKeyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: String::from("["),
            fields: 0,
        }
    }

    fn sep(&mut self) {
        if self.fields > 0 {
            self.buf.push(',');
        }
        self.fields += 1;
    }

    #[must_use]
    pub fn field_u32(mut self, v: u32) -> Self {
        self.sep();
        let _ = write!(self.buf, "{v}");
        self
    }

    #[must_use]
    pub fn field_hex(mut self, v: u64) -> Self {
        self.sep();
        let _ = write!(self.buf, "0x{v:X}");
        self
    }

    #[must_use]
    pub fn field_str(mut self, v: &str) -> Self {
        self.sep();
        self.buf.push_str(v);
        self
    }

    /// Appends an already rendered key as one field.
    #[must_use]
    pub fn nested(self, key: &CacheKey) -> Self {
        self.field_str(key.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields == 0
    }

    #[must_use]
    pub fn into_string(mut self) -> String {
        self.buf.push(']');
        self.buf
    }

    #[must_use]
    pub fn build(self) -> CacheKey {
        CacheKey::new(self.into_string())
    }
}
