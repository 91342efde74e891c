//! Path algebra
//!
//! A [`Path`] is an ordered, possibly empty sequence of opaque string
//! segments. The empty path addresses the whole tree. Segments never imply
//! structure beyond one level of nesting; each backend maps them onto its own
//! key syntax through a [`codec::KeyCodec`].

pub mod codec;
pub mod tree;

use std::fmt;

pub use codec::{HexCodec, KeyCodec, SeparatorCodec, DOCUMENT_CODEC, JSON_PATH_CODEC, TABLE_CODEC};

/// Ordered sequence of segments addressing a location in the logical tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(Vec<String>);

/// Build a [`Path`] from any mix of string and integer segments.
///
/// ```
/// use massive_tree::path;
///
/// let p = path!["users", 42, "name"];
/// assert_eq!(p.segments(), ["users", "42", "name"]);
/// assert!(path![].is_root());
/// ```
#[macro_export]
macro_rules! path {
    () => {
        $crate::path::Path::root()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::path::Path::from_segments(vec![$(::std::string::ToString::to_string(&$segment)),+])
    };
}

impl Path {
    /// The empty path (whole tree)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Create a path from owned segments
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Borrow the segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Consume into owned segments
    pub fn into_segments(self) -> Vec<String> {
        self.0
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the root path
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Same as [`Path::is_root`]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First segment, if any
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Last segment, if any
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Split into the top-level segment and the remaining sub-path
    pub fn split_first(&self) -> Option<(&str, Path)> {
        self.0
            .split_first()
            .map(|(head, rest)| (head.as_str(), Path(rest.to_vec())))
    }

    /// Parent path; `None` for the root
    pub fn parent(&self) -> Option<Path> {
        match self.0.len() {
            0 => None,
            n => Some(Path(self.0[..n - 1].to_vec())),
        }
    }

    /// Path extended by one segment
    pub fn child(&self, segment: impl ToString) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Path(segments)
    }

    /// Concatenation of two paths
    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Path(segments)
    }

    /// True when `self` equals `prefix` or lies beneath it
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// True when `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        self.0.len() < other.0.len() && other.starts_with(self)
    }

    /// Sub-path of `self` below `prefix`, if `self` starts with it
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        self.starts_with(prefix)
            .then(|| Path(self.0[prefix.0.len()..].to_vec()))
    }

    /// Strict ancestors, shortest first, excluding the root
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (1..self.0.len()).map(move |n| Path(self.0[..n].to_vec()))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            f.write_str("/")?;
            // Pointer-style escaping keeps the display form unambiguous
            f.write_str(&segment.replace('~', "~0").replace('/', "~1"))?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(segment: &str) -> Self {
        Path(vec![segment.to_string()])
    }
}

impl From<String> for Path {
    fn from(segment: String) -> Self {
        Path(vec![segment])
    }
}

impl From<&Path> for Path {
    fn from(path: &Path) -> Self {
        path.clone()
    }
}

impl From<Vec<String>> for Path {
    fn from(segments: Vec<String>) -> Self {
        Path(segments)
    }
}

impl From<Vec<&str>> for Path {
    fn from(segments: Vec<&str>) -> Self {
        Path(segments.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Path {
    fn from(segments: &[&str]) -> Self {
        Path(segments.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Path {
    fn from(segments: [&str; N]) -> Self {
        Path(segments.iter().map(|s| s.to_string()).collect())
    }
}

impl FromIterator<String> for Path {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Path(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_mixes_numbers_and_strings() {
        let p = path!["users", 7, "tags"];
        assert_eq!(p.segments(), ["users", "7", "tags"]);
        assert_eq!(p.len(), 3);
        assert!(path![].is_root());
    }

    #[test]
    fn test_ancestry() {
        let p = path!["a", "b", "c"];
        let ancestors: Vec<Path> = p.ancestors().collect();
        assert_eq!(ancestors, vec![path!["a"], path!["a", "b"]]);
        assert!(path!["a"].is_ancestor_of(&p));
        assert!(!p.is_ancestor_of(&p));
        assert!(Path::root().is_ancestor_of(&p));
        assert_eq!(p.parent(), Some(path!["a", "b"]));
        assert_eq!(Path::root().parent(), None);
        assert_eq!(p.strip_prefix(&path!["a"]), Some(path!["b", "c"]));
        assert_eq!(p.strip_prefix(&path!["x"]), None);
    }

    #[test]
    fn test_display_is_unambiguous() {
        assert_eq!(Path::root().to_string(), "/");
        assert_eq!(path!["a/b", "c"].to_string(), "/a~1b/c");
        assert_ne!(path!["a/b"].to_string(), path!["a", "b"].to_string());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Path::from("x"), path!["x"]);
        assert_eq!(Path::from(["x", "y"]), path!["x", "y"]);
        assert_eq!(Path::from(vec!["x"]), path!["x"]);
        let p = path!["x", "y", "z"];
        let (head, rest) = p.split_first().unwrap();
        assert_eq!(head, "x");
        assert_eq!(rest, path!["y", "z"]);
    }
}
