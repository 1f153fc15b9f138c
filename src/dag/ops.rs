//! Generic DAG operations for synchronization.
//!
//! A sync page arrives as a list of abbreviated nodes (hash plus parent
//! hashes) in (height, hash) order. Before fetching bodies the receiver splits
//! the page into nodes it can admit now and nodes that depend on ancestors it
//! has never seen.

use crate::dag::ContentHash;
use std::collections::HashSet;

/// Trait for types that can participate in DAG operations.
pub trait DagNodeOps {
    /// Returns the content hash of this node.
    fn hash(&self) -> &ContentHash;

    /// Returns the hashes of this node's parent nodes.
    fn parent_hashes(&self) -> &[ContentHash];
}

/// Resolution of one sync page against local state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartialDag {
    /// Unknown nodes whose parents are all known locally or resolved earlier
    /// in the page, in page order.
    pub resolved: Vec<ContentHash>,
    /// Unknown nodes that depend, directly or transitively, on a parent that
    /// is neither known locally nor resolvable from this page.
    pub unresolved: Vec<ContentHash>,
    /// Parent hashes referenced by the page that are absent both locally and
    /// from the resolvable part of the page.
    pub external: HashSet<ContentHash>,
}

impl PartialDag {
    /// Returns true if every node of the page is either known or resolved.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Splits a page of nodes into resolved and unresolved parts.
///
/// `is_known` reports whether a hash is already stored locally. Nodes that are
/// known are skipped. A node is resolved when each parent is known or was
/// resolved earlier in the page. Otherwise it is unresolved and any parent that
/// is not part of the page at all lands in `external`.
pub fn compute_partial_dag<N, F>(nodes: &[N], is_known: F) -> PartialDag
where
    N: DagNodeOps,
    F: Fn(&ContentHash) -> bool,
{
    let page: HashSet<ContentHash> = nodes.iter().map(|n| *n.hash()).collect();
    let mut available: HashSet<ContentHash> = HashSet::new();
    let mut result = PartialDag::default();

    for node in nodes {
        let hash = *node.hash();
        if is_known(&hash) {
            available.insert(hash);
            continue;
        }

        let mut ready = true;
        for parent in node.parent_hashes() {
            if available.contains(parent) || is_known(parent) {
                continue;
            }
            ready = false;
            if !page.contains(parent) {
                result.external.insert(*parent);
            }
        }

        if ready {
            available.insert(hash);
            result.resolved.push(hash);
        } else {
            result.unresolved.push(hash);
        }
    }

    result
}
