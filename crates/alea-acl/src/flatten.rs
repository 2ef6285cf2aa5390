//! Membership flattening
//!
//! Computes, for one root ACL, the set of ACLs reachable through nesting
//! edges and the set of users reachable through those ACLs. The traversal is
//! a depth-first closure with a cycle guard:
//!
//! - an ACL already on the recursion stack contributes nothing further, so
//!   cycles (including an ACL nesting itself) terminate;
//! - an ACL already finished in this pass is served from its memo.
//!
//! The visiting/visited state lives in a [`Flattener`] that is created fresh
//! for each root. Memos of intermediate ACLs can be truncated by the cycle
//! guard, so only the root's result is ever reported or cached.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, instrument};

use crate::cache::{keys, CacheError, CacheStore};
use crate::graph::MembershipGraph;

/// Flattened view of one ACL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flattened {
    /// ACL ids reachable through one or more nesting edges
    pub closure: BTreeSet<String>,
    /// User ids with a direct edge from the root or any ACL in `closure`
    pub members: BTreeSet<String>,
}

/// Single-root closure computation over a graph snapshot
pub struct Flattener<'g> {
    graph: &'g MembershipGraph,
    visiting: HashSet<&'g str>,
    visited: HashMap<&'g str, BTreeSet<&'g str>>,
}

impl<'g> Flattener<'g> {
    fn new(graph: &'g MembershipGraph) -> Self {
        Self {
            graph,
            visiting: HashSet::new(),
            visited: HashMap::new(),
        }
    }

    /// Flatten `root` against `graph`
    ///
    /// A root that is not in the graph flattens to empty sets.
    pub fn flatten(graph: &'g MembershipGraph, root: &str) -> Flattened {
        let mut flattener = Flattener::new(graph);

        let closure: BTreeSet<String> = match graph.acl_id(root) {
            Some(root) => flattener
                .closure_of(root)
                .into_iter()
                .map(String::from)
                .collect(),
            None => BTreeSet::new(),
        };

        let members = std::iter::once(root)
            .chain(closure.iter().map(String::as_str))
            .flat_map(|acl| graph.direct_users(acl))
            .cloned()
            .collect();

        Flattened { closure, members }
    }

    fn closure_of(&mut self, acl: &'g str) -> BTreeSet<&'g str> {
        if let Some(done) = self.visited.get(acl) {
            return done.clone();
        }
        if !self.visiting.insert(acl) {
            debug!(acl, "Cycle detected, not descending again");
            return BTreeSet::new();
        }

        let graph = self.graph;
        let mut closure = BTreeSet::new();
        for child in graph.nested_acls(acl) {
            closure.insert(child.as_str());
            closure.extend(self.closure_of(child.as_str()));
        }

        self.visiting.remove(acl);
        self.visited.insert(acl, closure.clone());
        closure
    }

    /// Flatten `root` and publish the result under its cache keys
    ///
    /// Both sets are swapped in whole, then the computed marker is written,
    /// so a reader that finds the marker always finds complete sets.
    #[instrument(skip(cache, graph))]
    pub async fn flatten_into_cache(
        cache: &dyn CacheStore,
        graph: &MembershipGraph,
        root: &str,
    ) -> Result<Flattened, CacheError> {
        let flattened = Flattener::flatten(graph, root);

        let closure: Vec<String> = flattened.closure.iter().cloned().collect();
        let members: Vec<String> = flattened.members.iter().cloned().collect();

        cache.replace_set(&keys::closure(root), &closure).await?;
        cache.replace_set(&keys::members(root), &members).await?;
        cache
            .set_entry(&keys::computed(root), &Utc::now().to_rfc3339())
            .await?;
        cache
            .add_to_set(keys::ACL_INDEX, &[root.to_string()])
            .await?;

        debug!(
            closure = closure.len(),
            members = members.len(),
            "Flattened ACL"
        );
        Ok(flattened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::model::Member;

    fn graph(acls: &[&str], edges: &[(&str, Member)]) -> MembershipGraph {
        MembershipGraph::from_parts(
            acls.iter().map(|s| s.to_string()),
            edges.iter().map(|(p, m)| (p.to_string(), m.clone())),
        )
    }

    fn acl(id: &str) -> Member {
        Member::Acl(id.to_string())
    }

    fn user(id: &str) -> Member {
        Member::User(id.to_string())
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_nested_membership() {
        let g = graph(
            &["a", "b", "c"],
            &[
                ("a", acl("b")),
                ("b", acl("c")),
                ("b", user("u1")),
                ("c", user("u2")),
                ("a", user("u0")),
            ],
        );

        let flat = Flattener::flatten(&g, "a");
        assert_eq!(flat.closure, set(&["b", "c"]));
        assert_eq!(flat.members, set(&["u0", "u1", "u2"]));

        let flat = Flattener::flatten(&g, "b");
        assert_eq!(flat.closure, set(&["c"]));
        assert_eq!(flat.members, set(&["u1", "u2"]));
    }

    #[test]
    fn test_no_edges() {
        let g = graph(&["lonely"], &[]);
        assert_eq!(Flattener::flatten(&g, "lonely"), Flattened::default());
    }

    #[test]
    fn test_unknown_root() {
        let g = graph(&["a"], &[("a", user("u1"))]);
        assert_eq!(Flattener::flatten(&g, "nope"), Flattened::default());
    }

    #[test]
    fn test_self_loop_terminates() {
        let g = graph(&["a"], &[("a", acl("a")), ("a", user("u2"))]);

        let flat = Flattener::flatten(&g, "a");
        assert_eq!(flat.closure, set(&["a"]));
        assert_eq!(flat.members, set(&["u2"]));
    }

    #[test]
    fn test_cycle_terminates_with_full_membership() {
        // a -> b -> c -> a, each with one user
        let g = graph(
            &["a", "b", "c"],
            &[
                ("a", acl("b")),
                ("b", acl("c")),
                ("c", acl("a")),
                ("a", user("ua")),
                ("b", user("ub")),
                ("c", user("uc")),
            ],
        );

        for root in ["a", "b", "c"] {
            let flat = Flattener::flatten(&g, root);
            assert_eq!(flat.closure, set(&["a", "b", "c"]), "closure of {}", root);
            assert_eq!(flat.members, set(&["ua", "ub", "uc"]), "members of {}", root);
        }
    }

    #[test]
    fn test_diamond_shares_memo() {
        // a -> b -> d, a -> c -> d
        let g = graph(
            &["a", "b", "c", "d"],
            &[
                ("a", acl("b")),
                ("a", acl("c")),
                ("b", acl("d")),
                ("c", acl("d")),
                ("d", user("u")),
            ],
        );
        let flat = Flattener::flatten(&g, "a");
        assert_eq!(flat.closure, set(&["b", "c", "d"]));
        assert_eq!(flat.members, set(&["u"]));
    }

    #[test]
    fn test_separate_roots_do_not_share_state() {
        // Flattening "b" first must not change what "a" sees
        let g = graph(
            &["a", "b"],
            &[("a", acl("b")), ("b", acl("a")), ("b", user("u"))],
        );
        let b = Flattener::flatten(&g, "b");
        let a = Flattener::flatten(&g, "a");
        assert_eq!(a.members, set(&["u"]));
        assert_eq!(b.members, set(&["u"]));
        assert_eq!(a.closure, set(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_flatten_into_cache() {
        let g = graph(&["a", "b"], &[("a", acl("b")), ("b", user("u1"))]);
        let cache = MemoryCache::new();

        Flattener::flatten_into_cache(&cache, &g, "a").await.unwrap();

        assert!(cache.get_entry(&keys::computed("a")).await.unwrap().is_some());
        assert!(cache.is_member_of_set(&keys::members("a"), "u1").await.unwrap());
        assert!(cache.is_member_of_set(&keys::closure("a"), "b").await.unwrap());
        assert!(cache.is_member_of_set(keys::ACL_INDEX, "a").await.unwrap());
        // Only the root is published
        assert!(cache.get_entry(&keys::computed("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flatten_into_cache_replaces_previous_members() {
        let cache = MemoryCache::new();

        let before = graph(&["a"], &[("a", user("u1"))]);
        Flattener::flatten_into_cache(&cache, &before, "a").await.unwrap();

        let after = graph(&["a"], &[("a", user("u2"))]);
        Flattener::flatten_into_cache(&cache, &after, "a").await.unwrap();

        assert!(!cache.is_member_of_set(&keys::members("a"), "u1").await.unwrap());
        assert!(cache.is_member_of_set(&keys::members("a"), "u2").await.unwrap());
    }
}
