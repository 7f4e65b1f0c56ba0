// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolution of name-based position directives into a total order.
//!
//! Each entry is either unanchored or placed immediately before/after one
//! other entry. The "anchored to" relation forms a graph with an edge from
//! anchor to entry; entries are visited in topological order of that graph,
//! ties broken by registration index, and spliced into the result next to
//! their anchor. Unanchored entries are appended.

use std::collections::{HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// Relative position of a hook within one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// Immediately before the named hook.
    Before(String),
    /// Immediately after the named hook.
    After(String),
}

impl Anchor {
    fn target(&self) -> &str {
        match self {
            Self::Before(name) | Self::After(name) => name,
        }
    }
}

/// Graph of one (resource type, phase, layer). Node weights are registration
/// indices; node indices are assigned in registration order.
struct AnchorGraph<'a> {
    graph: DiGraph<usize, ()>,
    entries: &'a [(&'a str, Option<&'a Anchor>)],
}

impl<'a> AnchorGraph<'a> {
    fn build(entries: &'a [(&'a str, Option<&'a Anchor>)]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(entries.len(), entries.len());
        let mut by_name: HashMap<&str, NodeIndex> = HashMap::with_capacity(entries.len());
        for (i, (name, _)) in entries.iter().enumerate() {
            by_name.insert(*name, graph.add_node(i));
        }

        for (i, (name, anchor)) in entries.iter().enumerate() {
            let Some(anchor) = anchor else { continue };
            let target = anchor.target();
            let &from = by_name.get(target).ok_or_else(|| {
                Error::InterceptorConfiguration(format!(
                    "interceptor '{}' is positioned relative to unknown interceptor '{}'",
                    name, target
                ))
            })?;
            graph.add_edge(from, NodeIndex::new(i), ());
        }

        Ok(Self { graph, entries })
    }

    /// Kahn's algorithm; ready nodes and their dependents are taken in
    /// registration order.
    fn toposort(&self) -> Result<Vec<usize>> {
        let mut in_degree = vec![0usize; self.graph.node_count()];
        for edge in self.graph.edge_references() {
            in_degree[edge.target().index()] += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(in_degree.len());

        while let Some(idx) = queue.pop_front() {
            sorted.push(self.graph[idx]);

            let mut dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            dependents.sort_unstable();
            for dependent in dependents {
                let degree = &mut in_degree[dependent.index()];
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if sorted.len() != in_degree.len() {
            let mut cyclic: Vec<&str> = self
                .graph
                .node_indices()
                .filter(|idx| in_degree[idx.index()] > 0)
                .map(|idx| self.entries[self.graph[idx]].0)
                .collect();
            cyclic.sort_unstable();
            return Err(Error::InterceptorConfiguration(format!(
                "cyclic position directives between interceptors {}",
                cyclic.join(", ")
            )));
        }

        Ok(sorted)
    }
}

/// Order entries given as `(name, anchor)` in registration order.
///
/// Returns registration indices in execution order.
pub(crate) fn resolve(entries: &[(&str, Option<&Anchor>)]) -> Result<Vec<usize>> {
    let graph = AnchorGraph::build(entries)?;
    let mut order: Vec<usize> = Vec::with_capacity(entries.len());

    for i in graph.toposort()? {
        let anchor = entries[i].1;
        let at = anchor.and_then(|a| {
            let target = a.target();
            order.iter().position(|&o| entries[o].0 == target)
        });
        match (anchor, at) {
            (Some(Anchor::Before(_)), Some(at)) => order.insert(at, i),
            (Some(Anchor::After(_)), Some(at)) => order.insert(at + 1, i),
            _ => order.push(i),
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names<'a>(entries: &[(&'a str, Option<&Anchor>)]) -> Vec<&'a str> {
        resolve(entries)
            .unwrap()
            .into_iter()
            .map(|i| entries[i].0)
            .collect()
    }

    #[test]
    fn test_unanchored_keep_registration_order() {
        assert_eq!(names(&[("a", None), ("b", None), ("c", None)]), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_before_and_after_splice_next_to_anchor() {
        let before_one = Anchor::Before("1".to_string());
        let after_one = Anchor::After("1".to_string());
        let entries = [
            ("1", None),
            ("0", Some(&before_one)),
            ("2", Some(&after_one)),
        ];
        assert_eq!(names(&entries), vec!["0", "1", "2"]);
    }

    #[test]
    fn test_anchor_registered_later() {
        let before_b = Anchor::Before("b".to_string());
        let entries = [("x", None), ("a", Some(&before_b)), ("b", None)];
        assert_eq!(names(&entries), vec!["x", "a", "b"]);
    }

    #[test]
    fn test_chained_anchors() {
        let after_two = Anchor::After("2".to_string());
        let before_ba = Anchor::Before("BA".to_string());
        let before_one = Anchor::Before("1".to_string());
        let after_one = Anchor::After("1".to_string());
        let entries = [
            ("1", None),
            ("0", Some(&before_one)),
            ("2", Some(&after_one)),
            ("BA", Some(&after_two)),
            ("AB", Some(&before_ba)),
        ];
        assert_eq!(names(&entries), vec!["0", "1", "2", "AB", "BA"]);
    }

    #[test]
    fn test_later_after_lands_closer_to_anchor() {
        let after_a = Anchor::After("a".to_string());
        let entries = [("a", None), ("b", Some(&after_a)), ("c", Some(&after_a))];
        assert_eq!(names(&entries), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_anchor_graph_visits_anchors_first() {
        let after_c = Anchor::After("c".to_string());
        let before_a = Anchor::Before("a".to_string());
        let entries = [
            ("a", None),
            ("b", Some(&after_c)),
            ("c", Some(&before_a)),
            ("d", None),
        ];
        let graph = AnchorGraph::build(&entries).unwrap();
        assert_eq!(graph.graph.edge_count(), 2);
        assert_eq!(graph.toposort().unwrap(), vec![0, 3, 2, 1]);
        assert_eq!(names(&entries), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_unknown_anchor_is_rejected() {
        let before_missing = Anchor::Before("missing".to_string());
        let err = resolve(&[("a", Some(&before_missing))]).unwrap_err();
        assert!(matches!(err, Error::InterceptorConfiguration(ref msg) if msg.contains("missing")));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let before_b = Anchor::Before("b".to_string());
        let after_a = Anchor::After("a".to_string());
        let err = resolve(&[("a", Some(&before_b)), ("b", Some(&after_a)), ("c", None)])
            .unwrap_err();
        assert!(
            matches!(err, Error::InterceptorConfiguration(ref msg) if msg.contains("a, b"))
        );
    }

    #[test]
    fn test_self_anchor_is_a_cycle() {
        let before_self = Anchor::Before("a".to_string());
        assert!(resolve(&[("a", Some(&before_self))]).is_err());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let after_a = Anchor::After("a".to_string());
        let before_c = Anchor::Before("c".to_string());
        let entries = [
            ("c", None),
            ("b", Some(&before_c)),
            ("a", None),
            ("d", Some(&after_a)),
        ];
        let first = resolve(&entries).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve(&entries).unwrap(), first);
        }
        assert_eq!(names(&entries), vec!["b", "c", "a", "d"]);
    }
}
