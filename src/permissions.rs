//! Admin permission forest.

use crate::domain::Permission;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PermissionNode {
    pub code: String,
    pub name: String,
    pub parent_code: String,
    pub sort_order: i32,
    #[schema(no_recursion)]
    pub children: Vec<PermissionNode>,
}

/// Builds a forest from a flat permission list.
///
/// Entries without a parent, or whose parent is missing, become roots. Siblings are ordered by
/// `(sort_order, code)`; the sort is stable so duplicates keep their input order.
#[must_use]
pub fn build_permission_tree(permissions: &[Permission]) -> Vec<PermissionNode> {
    let codes: HashSet<&str> = permissions.iter().map(|p| p.code.as_str()).collect();
    let mut children: HashMap<&str, Vec<&Permission>> = HashMap::new();
    let mut roots = Vec::new();
    for permission in permissions {
        let parent = permission.parent_code.trim();
        if parent.is_empty() || parent == permission.code || !codes.contains(parent) {
            roots.push(permission);
        } else {
            children.entry(parent).or_default().push(permission);
        }
    }
    let mut visited = HashSet::new();
    let mut forest: Vec<PermissionNode> = roots
        .into_iter()
        .map(|root| build_node(root, &children, &mut visited))
        .collect();
    sort_nodes(&mut forest);
    forest
}

fn build_node<'a>(
    permission: &'a Permission,
    children: &HashMap<&'a str, Vec<&'a Permission>>,
    visited: &mut HashSet<&'a str>,
) -> PermissionNode {
    let mut node = PermissionNode {
        code: permission.code.clone(),
        name: permission.name.clone(),
        parent_code: permission.parent_code.clone(),
        sort_order: permission.sort_order,
        children: Vec::new(),
    };
    if !visited.insert(permission.code.as_str()) {
        return node;
    }
    if let Some(kids) = children.get(permission.code.as_str()) {
        node.children = kids
            .iter()
            .map(|kid| build_node(kid, children, visited))
            .collect();
        sort_nodes(&mut node.children);
    }
    node
}

fn sort_nodes(nodes: &mut [PermissionNode]) {
    nodes.sort_by(|a, b| {
        a.sort_order
            .cmp(&b.sort_order)
            .then_with(|| a.code.cmp(&b.code))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(code: &str, parent: &str, sort_order: i32) -> Permission {
        Permission {
            code: code.to_string(),
            name: code.to_string(),
            parent_code: parent.to_string(),
            sort_order,
        }
    }

    fn codes(nodes: &[PermissionNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.code.as_str()).collect()
    }

    #[test]
    fn roots_and_children_are_sorted() {
        let tree = build_permission_tree(&[
            perm("order.view", "order", 2),
            perm("user", "", 2),
            perm("order", "", 1),
            perm("order.approve", "order", 1),
            perm("order.delete", "order", 1),
            perm("admin", "", 2),
        ]);
        assert_eq!(codes(&tree), vec!["order", "admin", "user"]);
        assert_eq!(
            codes(&tree[0].children),
            vec!["order.approve", "order.delete", "order.view"]
        );
    }

    #[test]
    fn orphans_become_roots() {
        let tree = build_permission_tree(&[
            perm("wallet.approve", "wallet", 0),
            perm("order", "", 1),
        ]);
        assert_eq!(codes(&tree), vec!["wallet.approve", "order"]);
    }

    #[test]
    fn nested_levels() {
        let tree = build_permission_tree(&[
            perm("a", "", 0),
            perm("a.b", "a", 0),
            perm("a.b.c", "a.b", 0),
        ]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children[0].children[0].code, "a.b.c");
    }

    #[test]
    fn self_parent_is_root() {
        let tree = build_permission_tree(&[perm("loop", "loop", 0)]);
        assert_eq!(codes(&tree), vec!["loop"]);
        assert!(tree[0].children.is_empty());
    }
}
