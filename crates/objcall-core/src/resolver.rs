//! Dotted-path method resolution.
//!
//! The resolver is the only gate between remote input and the exposed graph.
//! Every segment is checked against the blacklist, only own properties are
//! followed, and the final segment must name a method.

use crate::config::ResolverOptions;
use crate::graph::{Method, Node, ObjectNode};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A method together with the object it was found on.
#[derive(Clone)]
pub struct ResolvedMethod {
    pub method: Arc<dyn Method>,
    pub owner: Arc<ObjectNode>,
}

impl std::fmt::Debug for ResolvedMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedMethod")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct MethodResolver {
    delimiter: char,
    blacklist: BTreeSet<String>,
}

impl Default for MethodResolver {
    fn default() -> Self {
        Self::new(&ResolverOptions::default())
    }
}

impl MethodResolver {
    pub fn new(options: &ResolverOptions) -> Self {
        Self {
            delimiter: options.delimiter,
            blacklist: options.effective_blacklist(),
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub fn is_forbidden(&self, segment: &str) -> bool {
        self.blacklist.contains(segment)
    }

    /// Split a path into trimmed, non-empty segments.
    pub fn segments<'a>(&self, path: &'a str) -> Vec<&'a str> {
        path.split(self.delimiter)
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    /// Resolve `path` against `root`.
    ///
    /// Returns `None` for every kind of failure so callers cannot tell a
    /// forbidden path from a missing one.
    pub fn resolve(&self, root: &Arc<ObjectNode>, path: &str) -> Option<ResolvedMethod> {
        let segments = self.segments(path);
        let (last, parents) = segments.split_last()?;

        let mut cursor = root.clone();
        for segment in parents {
            if self.is_forbidden(segment) {
                debug!("Refusing blacklisted segment '{}' in {}", segment, path);
                return None;
            }
            cursor = match cursor.own(segment)? {
                Node::Object(next) => next.clone(),
                _ => return None,
            };
        }

        if self.is_forbidden(last) {
            debug!("Refusing blacklisted segment '{}' in {}", last, path);
            return None;
        }
        match cursor.own(last)? {
            Node::Method(method) => Some(ResolvedMethod {
                method: method.clone(),
                owner: cursor,
            }),
            _ => None,
        }
    }
}
