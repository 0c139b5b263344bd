//! Hierarchical datastore keys
//!
//! Keys look like filesystem paths (`/blocks/CIQA/abc`). Every key is kept in
//! a cleaned form: a single leading `/`, no empty or `.` segments, `..`
//! resolved, and no trailing `/`. The root key is `/`.
//!
//! The cleaned string is used verbatim as the bucket object name.

use std::cmp::Ordering;
use std::fmt;

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Path separator between key segments
pub const SEPARATOR: char = '/';

/// A cleaned, hierarchical key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    raw: String,
}

impl Key {
    /// Create a key, cleaning the given path
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            raw: clean(path.as_ref()),
        }
    }

    /// Build a key from individual segments
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self::new(joined)
    }

    /// The root key `/`
    pub fn root() -> Self {
        Self {
            raw: SEPARATOR.to_string(),
        }
    }

    /// The cleaned string form, which is also the bucket object name
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this is the root key
    pub fn is_root(&self) -> bool {
        self.raw.len() == 1
    }

    /// Segments of the key, root yields none
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split(SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Alias of [`Key::segments`] collected into a vector
    pub fn namespaces(&self) -> Vec<&str> {
        self.segments().collect()
    }

    /// Last segment, empty for the root key
    pub fn name(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    /// Parent key; the root is its own parent
    pub fn parent(&self) -> Key {
        match self.raw.rfind(SEPARATOR) {
            Some(0) | None => Key::root(),
            Some(pos) => Key {
                raw: self.raw[..pos].to_string(),
            },
        }
    }

    /// Append a child path below this key
    pub fn child(&self, child: impl AsRef<str>) -> Key {
        Key::new(format!("{}/{}", self.raw, child.as_ref()))
    }

    /// Whether `other` sits strictly below this key
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other
            .raw
            .strip_prefix(self.raw.as_str())
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
    }

    /// Whether this key sits strictly below `other`
    pub fn is_descendant_of(&self, other: &Key) -> bool {
        other.is_ancestor_of(self)
    }

    /// Whether this key has exactly one segment
    pub fn is_top_level(&self) -> bool {
        self.segments().count() == 1
    }

    /// Consume the key, returning its string form
    pub fn into_string(self) -> String {
        self.raw
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::new(s)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_paths(&self.raw, &other.raw)
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(feature = "serde_support")]
impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

#[cfg(feature = "serde_support")]
impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Key::new(raw))
    }
}

/// Clean a path into key form
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return SEPARATOR.to_string();
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    for part in parts {
        cleaned.push(SEPARATOR);
        cleaned.push_str(part);
    }
    cleaned
}

/// Compare two key strings segment by segment.
///
/// `/a/b` sorts before `/a-b` even though `-` < `/` bytewise.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    a.split(SEPARATOR).cmp(b.split(SEPARATOR))
}
