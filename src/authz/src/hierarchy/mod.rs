//! Role and group hierarchies
//!
//! Both hierarchies are forests: every node has at most one parent and
//! parent pointers never form a cycle. Edge additions walk parent pointers
//! upward from the new parent; if the walk reaches the new child the edge is
//! rejected with the offending path.

pub mod groups;
pub mod roles;

pub use groups::{AddMember, GroupService};
pub use roles::RoleHierarchyService;

use crate::error::{AuthzError, Result};
use crate::types::{Group, Role, TreeNode};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Node of a parent-pointer hierarchy
pub trait HierarchyItem: Clone {
    fn id(&self) -> &str;
    fn parent_id(&self) -> Option<&str>;
    fn name(&self) -> &str;
}

impl HierarchyItem for Role {
    fn id(&self) -> &str {
        &self.id
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl HierarchyItem for Group {
    fn id(&self) -> &str {
        &self.id
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Bounded upward walk used for cycle detection
#[derive(Debug)]
pub(crate) struct AncestorWalk {
    target: String,
    path: Vec<String>,
    visited: HashSet<String>,
}

impl AncestorWalk {
    /// Walk that fails if `target` (the prospective child) is reached
    pub(crate) fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            path: Vec::new(),
            visited: HashSet::new(),
        }
    }

    /// Record `node` as the next ancestor.
    ///
    /// Returns `Ok(false)` when the node was already visited, which only
    /// happens if stored data is already cyclic; the walk stops there.
    pub(crate) fn visit(&mut self, node: &str) -> Result<bool> {
        self.path.push(node.to_string());

        if node == self.target {
            let cycle = std::iter::once(self.target.as_str())
                .chain(self.path.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(AuthzError::CircularDependency(cycle));
        }

        if !self.visited.insert(node.to_string()) {
            warn!(node = %node, "Existing cycle in stored hierarchy, stopping walk");
            return Ok(false);
        }

        Ok(true)
    }
}

fn sort_nodes<T: HierarchyItem>(nodes: &mut [TreeNode<T>]) {
    nodes.sort_by(|a, b| {
        a.item
            .name()
            .cmp(b.item.name())
            .then_with(|| a.item.id().cmp(b.item.id()))
    });
}

fn build_subtree<T: HierarchyItem>(
    item: T,
    children_of: &HashMap<String, Vec<T>>,
    visited: &mut HashSet<String>,
) -> TreeNode<T> {
    visited.insert(item.id().to_string());

    let mut children: Vec<TreeNode<T>> = children_of
        .get(item.id())
        .map(|kids| {
            kids.iter()
                .filter(|kid| !visited.contains(kid.id()))
                .cloned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter()
        .map(|kid| build_subtree(kid, children_of, visited))
        .collect();

    sort_nodes(&mut children);
    TreeNode { item, children }
}

/// Assemble a forest from a flat list.
///
/// Nodes without a parent, or whose parent is not in `items`, become roots.
/// Roots and children are ordered by name, then id.
pub fn assemble_forest<T: HierarchyItem>(items: Vec<T>) -> Vec<TreeNode<T>> {
    let ids: HashSet<String> = items.iter().map(|i| i.id().to_string()).collect();
    let mut children_of: HashMap<String, Vec<T>> = HashMap::new();
    let mut roots = Vec::new();

    for item in items {
        match item.parent_id() {
            Some(parent) if ids.contains(parent) && parent != item.id() => {
                children_of.entry(parent.to_string()).or_default().push(item);
            }
            _ => roots.push(item),
        }
    }

    let mut visited = HashSet::new();
    let mut forest: Vec<TreeNode<T>> = roots
        .into_iter()
        .map(|root| build_subtree(root, &children_of, &mut visited))
        .collect();
    sort_nodes(&mut forest);

    let unreachable = ids.len() - visited.len();
    if unreachable > 0 {
        warn!(unreachable, "Hierarchy nodes unreachable from any root (cyclic data)");
    }

    forest
}
