//! In-memory snapshot of the membership graph
//!
//! The durable store is read once per recompute into a [`MembershipGraph`];
//! flattening then runs without any I/O. Edges that reference unknown ACLs
//! are dropped while the snapshot is built.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::model::Member;

/// Adjacency lists of the membership graph, keyed by parent ACL id
#[derive(Debug, Clone, Default)]
pub struct MembershipGraph {
    acls: HashSet<String>,
    nested: HashMap<String, Vec<String>>,
    users: HashMap<String, Vec<String>>,
}

impl MembershipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from known ACL ids and raw edges
    ///
    /// Edges whose parent or nested ACL is not among `acl_ids` are dangling
    /// and are logged and skipped.
    pub fn from_parts(
        acl_ids: impl IntoIterator<Item = String>,
        edges: impl IntoIterator<Item = (String, Member)>,
    ) -> Self {
        let mut graph = Self::new();
        for id in acl_ids {
            graph.insert_acl(id);
        }
        for (parent, member) in edges {
            graph.insert_edge(parent, member);
        }
        graph
    }

    /// The graph's own copy of `id`, if the ACL is known
    pub fn acl_id(&self, id: &str) -> Option<&str> {
        self.acls.get(id).map(String::as_str)
    }

    /// Register an ACL (a node with no edges yet)
    pub fn insert_acl(&mut self, id: impl Into<String>) {
        self.acls.insert(id.into());
    }

    /// Add an edge; returns false if it was dangling and therefore skipped
    pub fn insert_edge(&mut self, parent: impl Into<String>, member: Member) -> bool {
        let parent = parent.into();
        if !self.acls.contains(&parent) {
            warn!(parent = %parent, member = %member, "Skipping edge from unknown ACL");
            return false;
        }
        match member {
            Member::Acl(child) => {
                if !self.acls.contains(&child) {
                    warn!(parent = %parent, child = %child, "Skipping edge to unknown ACL");
                    return false;
                }
                let children = self.nested.entry(parent).or_default();
                if !children.contains(&child) {
                    children.push(child);
                }
            }
            Member::User(user) => {
                let users = self.users.entry(parent).or_default();
                if !users.contains(&user) {
                    users.push(user);
                }
            }
        }
        true
    }

    pub fn contains_acl(&self, id: &str) -> bool {
        self.acls.contains(id)
    }

    pub fn acl_ids(&self) -> impl Iterator<Item = &str> {
        self.acls.iter().map(String::as_str)
    }

    pub fn acl_count(&self) -> usize {
        self.acls.len()
    }

    /// ACLs nested directly inside `parent`
    pub fn nested_acls(&self, parent: &str) -> &[String] {
        self.nested.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Users granted membership in `parent` directly
    pub fn direct_users(&self, parent: &str) -> &[String] {
        self.users.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `id` plus every ACL that reaches `id` through nesting edges
    ///
    /// These are the ACLs whose flattened sets can change when an edge of
    /// `id` changes.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut parents_of: HashMap<&str, Vec<&str>> = HashMap::new();
        for (parent, children) in &self.nested {
            for child in children {
                parents_of.entry(child.as_str()).or_default().push(parent.as_str());
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        seen.insert(id.to_string());
        queue.push_back(id);

        while let Some(current) = queue.pop_front() {
            for &parent in parents_of.get(current).into_iter().flatten() {
                if seen.insert(parent.to_string()) {
                    queue.push_back(parent);
                }
            }
        }

        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(id: &str) -> Member {
        Member::Acl(id.to_string())
    }

    fn user(id: &str) -> Member {
        Member::User(id.to_string())
    }

    #[test]
    fn test_dangling_edges_are_skipped() {
        let mut graph = MembershipGraph::from_parts(["a".to_string()], []);
        assert!(!graph.insert_edge("missing", user("u1")));
        assert!(!graph.insert_edge("a", acl("missing")));
        assert!(graph.insert_edge("a", user("u1")));

        assert!(graph.nested_acls("a").is_empty());
        assert_eq!(graph.direct_users("a"), ["u1".to_string()]);
        assert!(graph.direct_users("missing").is_empty());
    }

    #[test]
    fn test_acl_id_lookup() {
        let graph = MembershipGraph::from_parts(["a".to_string()], []);
        assert_eq!(graph.acl_id("a"), Some("a"));
        assert_eq!(graph.acl_id("b"), None);
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut graph = MembershipGraph::from_parts(["a".to_string(), "b".to_string()], []);
        graph.insert_edge("a", acl("b"));
        graph.insert_edge("a", acl("b"));
        graph.insert_edge("a", user("u1"));
        graph.insert_edge("a", user("u1"));

        assert_eq!(graph.nested_acls("a").len(), 1);
        assert_eq!(graph.direct_users("a").len(), 1);
    }

    #[test]
    fn test_ancestors() {
        // root -> mid -> leaf, other -> leaf, unrelated
        let ids = ["root", "mid", "leaf", "other", "unrelated"].map(String::from);
        let graph = MembershipGraph::from_parts(
            ids,
            [
                ("root".to_string(), acl("mid")),
                ("mid".to_string(), acl("leaf")),
                ("other".to_string(), acl("leaf")),
            ],
        );

        let ancestors = graph.ancestors("leaf");
        let expected: HashSet<String> = ["leaf", "mid", "root", "other"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(ancestors, expected);

        assert_eq!(graph.ancestors("unrelated").len(), 1);
    }

    #[test]
    fn test_ancestors_with_cycle() {
        let ids = ["a", "b"].map(String::from);
        let graph = MembershipGraph::from_parts(
            ids,
            [("a".to_string(), acl("b")), ("b".to_string(), acl("a"))],
        );
        assert_eq!(graph.ancestors("a").len(), 2);
    }
}
