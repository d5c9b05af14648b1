//! Change paths and subscription filters.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One node of a change path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Item {
        array: String,
        index: usize,
        /// Size of the list after the change, for materializing patches.
        size: usize,
    },
}

impl PathSegment {
    pub fn key(name: impl Into<String>) -> Self {
        Self::Key(name.into())
    }

    pub fn item(array: impl Into<String>, index: usize, size: usize) -> Self {
        Self::Item {
            array: array.into(),
            index,
            size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A single property changed.
    Property,
    /// An object collection changed (size carried on the item node).
    ObjectCollection,
    /// Items were appended to a growing collection; null clears it.
    GrowingCollection,
}

/// One committed model mutation, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: Vec<PathSegment>,
    pub value: serde_json::Value,
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSegment {
    /// Matches any remaining suffix.
    Wildcard,
    Key(String),
    Array { name: String, index: Option<usize> },
}

/// A subscription filter path, e.g. `state.status`, `move.axes[*].homed`,
/// `job/**`. Matching is prefix-based: a filter selects the whole subtree
/// under its last segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    segments: Vec<FilterSegment>,
}

impl Filter {
    pub fn segments(&self) -> &[FilterSegment] {
        &self.segments
    }

    /// Parse a filter from its textual form. `.` and `/` both separate
    /// segments; `name[*]` matches any index, `name[3]` pins one.
    pub fn parse(raw: &str) -> Result<Filter, String> {
        let mut segments = Vec::new();
        for part in raw.split(['.', '/']).filter(|p| !p.is_empty()) {
            if part == "**" {
                segments.push(FilterSegment::Wildcard);
                continue;
            }
            match part.find('[') {
                Some(open) => {
                    let name = &part[..open];
                    let close = part
                        .rfind(']')
                        .ok_or_else(|| format!("missing ']' in '{part}'"))?;
                    let index_raw = &part[open + 1..close];
                    if name.is_empty() {
                        return Err(format!("missing array name in '{part}'"));
                    }
                    let index = if index_raw == "*" {
                        None
                    } else {
                        Some(
                            index_raw
                                .parse()
                                .map_err(|_| format!("bad index in '{part}'"))?,
                        )
                    };
                    segments.push(FilterSegment::Array {
                        name: name.to_string(),
                        index,
                    });
                }
                None => segments.push(FilterSegment::Key(part.to_string())),
            }
        }
        if segments.is_empty() {
            return Err("empty filter".to_string());
        }
        Ok(Filter { segments })
    }

    /// Does this filter select the given change path?
    ///
    /// A change with an empty path (root replacement) matches everything;
    /// a change above the filter (path exhausted first) also matches, since
    /// the filtered subtree is contained in it.
    pub fn matches(&self, path: &[PathSegment]) -> bool {
        let mut path_iter = path.iter();
        for segment in &self.segments {
            if matches!(segment, FilterSegment::Wildcard) {
                return true;
            }
            let Some(node) = path_iter.next() else {
                return true;
            };
            let ok = match (segment, node) {
                (FilterSegment::Key(k), PathSegment::Key(key)) => k == key,
                (FilterSegment::Array { name, index }, PathSegment::Item { array, index: i, .. }) => {
                    name == array && index.map_or(true, |pinned| pinned == *i)
                }
                // A plain key also selects an array of that name.
                (FilterSegment::Key(k), PathSegment::Item { array, .. }) => k == array,
                _ => false,
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            if position > 0 {
                f.write_str(".")?;
            }
            match segment {
                FilterSegment::Wildcard => f.write_str("**")?,
                FilterSegment::Key(key) => f.write_str(key)?,
                FilterSegment::Array { name, index } => match index {
                    Some(index) => write!(f, "{name}[{index}]")?,
                    None => write!(f, "{name}[*]")?,
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serialize_round_trip() {
        for raw in ["state.status", "move.axes[*].homed", "job.**", "tools[2]"] {
            let filter = Filter::parse(raw).unwrap();
            let printed = filter.to_string();
            assert_eq!(Filter::parse(&printed).unwrap(), filter, "{raw}");
        }
    }

    #[test]
    fn slash_and_dot_separators_are_equivalent() {
        assert_eq!(
            Filter::parse("move/axes[*]/homed").unwrap(),
            Filter::parse("move.axes[*].homed").unwrap()
        );
    }

    #[test]
    fn prefix_matching() {
        let filter = Filter::parse("state.status").unwrap();
        assert!(filter.matches(&[PathSegment::key("state"), PathSegment::key("status")]));
        // Change above the filter contains the filtered subtree.
        assert!(filter.matches(&[PathSegment::key("state")]));
        // Root replacement matches all filters.
        assert!(filter.matches(&[]));
        // Change below the filter is within the selected subtree.
        assert!(filter.matches(&[
            PathSegment::key("state"),
            PathSegment::key("status"),
            PathSegment::key("detail"),
        ]));
        assert!(!filter.matches(&[PathSegment::key("network")]));
    }

    #[test]
    fn array_index_pinning() {
        let any = Filter::parse("move.axes[*].homed").unwrap();
        let pinned = Filter::parse("move.axes[1].homed").unwrap();
        let path = [
            PathSegment::key("move"),
            PathSegment::item("axes", 0, 3),
            PathSegment::key("homed"),
        ];
        assert!(any.matches(&path));
        assert!(!pinned.matches(&path));
    }

    #[test]
    fn wildcard_suffix() {
        let filter = Filter::parse("job.**").unwrap();
        assert!(filter.matches(&[PathSegment::key("job"), PathSegment::key("file")]));
        assert!(!filter.matches(&[PathSegment::key("state")]));
    }

    #[test]
    fn rejects_bad_filters() {
        assert!(Filter::parse("").is_err());
        assert!(Filter::parse("axes[").is_err());
        assert!(Filter::parse("axes[x]").is_err());
    }
}
