//! Workspace-relative resource paths.
//!
//! A [`ResourcePath`] is an ordered sequence of non-empty segments. The empty
//! sequence is the workspace root, one segment names a project, and anything
//! deeper names a folder or file inside a project.
//!
//! Paths are always normalized on construction: empty segments and `.` are
//! dropped, `..` removes the previous segment. Equality, hashing and ordering
//! are defined over the segment sequence and are case-sensitive; use
//! [`ResourcePath::matches`] when the host file system folds case.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Separator between segments in the textual form.
pub const SEPARATOR: char = '/';

/// Errors produced when parsing path text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// `..` tried to climb above the workspace root.
    #[error("path escapes the workspace root: {0}")]
    EscapesRoot(String),

    /// A segment contains a NUL byte.
    #[error("path contains a NUL character: {0:?}")]
    ContainsNul(String),
}

/// Identifier of a resource inside a workspace.
#[derive(Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// The workspace root (no segments).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse path text such as `/Project/src/main.rs`.
    ///
    /// A leading separator is optional. Fails when `..` climbs above the
    /// root or a segment carries a NUL byte.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        if text.contains('\0') {
            return Err(PathError::ContainsNul(text.to_string()));
        }
        let mut segments: Vec<String> = Vec::new();
        for raw in text.split(SEPARATOR) {
            match raw {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::EscapesRoot(text.to_string()));
                    }
                }
                name => segments.push(name.to_string()),
            }
        }
        Ok(Self { segments })
    }

    /// Build a path from already-split segments, normalizing them.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = Self::root();
        for segment in segments {
            path = path.append(segment.as_ref());
        }
        path
    }

    /// The segments, root first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (0 for the root).
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment at `index`, if any.
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// True for the workspace root.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment (the resource name), `None` for the root.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path of the owning project (first segment), `None` for the root.
    pub fn project(&self) -> Option<ResourcePath> {
        self.segments.first().map(|name| Self {
            segments: vec![name.clone()],
        })
    }

    /// Append a relative path. `..` never climbs above the root here.
    pub fn append(&self, tail: &str) -> Self {
        let mut segments = self.segments.clone();
        for raw in tail.split(SEPARATOR) {
            match raw {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                name => segments.push(name.to_string()),
            }
        }
        Self { segments }
    }

    /// Concatenate another path onto this one.
    pub fn join(&self, other: &ResourcePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Drop the trailing `count` segments (saturating at the root).
    pub fn remove_last_segments(&self, count: usize) -> Self {
        let keep = self.segments.len().saturating_sub(count);
        Self {
            segments: self.segments[..keep].to_vec(),
        }
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            Some(self.remove_last_segments(1))
        }
    }

    /// True when `self` is an ancestor of, or equal to, `other`.
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_strict_prefix_of(&self, other: &ResourcePath) -> bool {
        self.segments.len() < other.segments.len() && self.is_prefix_of(other)
    }

    /// Segment-wise equality honouring the host's case sensitivity.
    pub fn matches(&self, other: &ResourcePath, case_sensitive: bool) -> bool {
        if case_sensitive {
            return self == other;
        }
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.to_lowercase() == b.to_lowercase())
    }

    /// Segments of `self` below `prefix`, or `None` if `prefix` is not an ancestor.
    pub fn strip_prefix(&self, prefix: &ResourcePath) -> Option<&[String]> {
        prefix
            .is_prefix_of(self)
            .then(|| &self.segments[prefix.segments.len()..])
    }

    /// Substitute `from` with `to` at the front of this path.
    ///
    /// Returns `None` when `from` is not a prefix.
    pub fn replace_prefix(&self, from: &ResourcePath, to: &ResourcePath) -> Option<Self> {
        let rest = self.strip_prefix(from)?;
        let mut segments = to.segments.clone();
        segments.extend(rest.iter().cloned());
        Some(Self { segments })
    }

    /// All ancestors from the root down to the parent, excluding `self`.
    pub fn ancestors(&self) -> impl Iterator<Item = ResourcePath> + '_ {
        (0..self.segments.len()).map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "{SEPARATOR}{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourcePath({self})")
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_normalizes() {
        assert_eq!(p("/P/a/b").segments(), ["P", "a", "b"]);
        assert_eq!(p("P//a/./b/"), p("/P/a/b"));
        assert_eq!(p("/P/a/../b"), p("/P/b"));
        assert!(p("/").is_root());
        assert!(p("").is_root());
    }

    #[test]
    fn test_parse_rejects_escape() {
        assert_eq!(
            ResourcePath::parse("/P/../.."),
            Err(PathError::EscapesRoot("/P/../..".to_string()))
        );
        assert!(ResourcePath::parse("a\0b").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(p("P/a").to_string(), "/P/a");
        assert_eq!(ResourcePath::root().to_string(), "/");
        assert_eq!(p(&p("/P/x y/z").to_string()), p("/P/x y/z"));
    }

    #[test]
    fn test_prefix_queries() {
        let project = p("/P");
        let folder = p("/P/a");
        assert!(project.is_prefix_of(&folder));
        assert!(project.is_prefix_of(&project));
        assert!(!folder.is_prefix_of(&project));
        assert!(ResourcePath::root().is_prefix_of(&folder));
        assert!(project.is_strict_prefix_of(&folder));
        assert!(!project.is_strict_prefix_of(&project));
        // "ab" is not under "a" even though the text shares a prefix
        assert!(!p("/P/a").is_prefix_of(&p("/P/ab")));
    }

    #[test]
    fn test_append_and_remove() {
        let base = p("/P");
        assert_eq!(base.append("a/b"), p("/P/a/b"));
        assert_eq!(base.append("../.."), ResourcePath::root());
        assert_eq!(p("/P/a/b").remove_last_segments(2), p("/P"));
        assert_eq!(p("/P").remove_last_segments(5), ResourcePath::root());
        assert_eq!(p("/P/a").parent(), Some(p("/P")));
        assert_eq!(ResourcePath::root().parent(), None);
    }

    #[test]
    fn test_replace_prefix() {
        let moved = p("/P/a/b/c").replace_prefix(&p("/P/a"), &p("/Q/z"));
        assert_eq!(moved, Some(p("/Q/z/b/c")));
        assert_eq!(p("/P/x").replace_prefix(&p("/P/a"), &p("/Q")), None);
    }

    #[test]
    fn test_case_matching() {
        assert!(!p("/P/folder").matches(&p("/P/Folder"), true));
        assert!(p("/P/folder").matches(&p("/P/Folder"), false));
        assert_ne!(p("/P/folder"), p("/P/Folder"));
    }

    #[test]
    fn test_ordering_is_lexical_by_segment() {
        let mut paths = vec![p("/P/b"), p("/P/a/z"), p("/P/a")];
        paths.sort();
        assert_eq!(paths, vec![p("/P/a"), p("/P/a/z"), p("/P/b")]);
    }

    #[test]
    fn test_ancestors() {
        let all: Vec<_> = p("/P/a/b").ancestors().collect();
        assert_eq!(all, vec![ResourcePath::root(), p("/P"), p("/P/a")]);
        assert_eq!(p("/P/a/b").project(), Some(p("/P")));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&p("/P/a")).unwrap();
        assert_eq!(json, "\"/P/a\"");
        let back: ResourcePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("/P/a"));
    }
}
