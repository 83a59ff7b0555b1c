//! File-level dependency graph and dependency-hash relaxation.
//!
//! An edge `a -> b` means `a` uses at least one symbol of `b`, so `a`'s
//! dependency hash must move when `b` changes. Unused and external imports
//! never become edges.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::indexer::filesystem::hash_entries;
use crate::models::Reference;

pub struct DependencyGraph {
    /// Sorted paths; indices below refer to this vector.
    nodes: Vec<String>,
    content_hashes: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<BTreeSet<usize>>,
}

/// Outcome of the fixed-point computation.
#[derive(Clone, Debug, Default)]
pub struct HashResolution {
    pub hashes: BTreeMap<String, String>,
    /// Files still changing when the iteration cap was reached.
    pub unresolved: BTreeSet<String>,
    pub iterations: usize,
    pub converged: bool,
}

impl DependencyGraph {
    /// Build a graph over `(path, content_hash)` nodes with no edges.
    pub fn new<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut pairs: Vec<(String, String)> = files
            .into_iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect();
        pairs.sort();
        pairs.dedup_by(|a, b| a.0 == b.0);

        let index = pairs
            .iter()
            .enumerate()
            .map(|(i, (p, _))| (p.clone(), i))
            .collect();
        let edges = vec![BTreeSet::new(); pairs.len()];
        let (nodes, content_hashes) = pairs.into_iter().unzip();
        Self {
            nodes,
            content_hashes,
            index,
            edges,
        }
    }

    /// Add an edge for every used reference into another known file.
    pub fn add_references(&mut self, references: &[Reference]) {
        for reference in references {
            if !reference.used {
                continue;
            }
            let Some(target) = reference.target.internal_path() else {
                continue;
            };
            let (Some(&from), Some(&to)) =
                (self.index.get(&reference.consumer), self.index.get(target))
            else {
                continue;
            };
            if from != to {
                self.edges[from].insert(to);
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(BTreeSet::len).sum()
    }

    /// Dependencies before dependents. Nodes on a cycle appear in DFS
    /// post-order from the lexicographically smallest entry point.
    fn order_indices(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut visited = vec![false; n];
        let mut order = Vec::with_capacity(n);

        for start in 0..n {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut stack: Vec<(usize, Vec<usize>)> =
                vec![(start, self.edges[start].iter().rev().copied().collect())];
            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) if !visited[next] => {
                        visited[next] = true;
                        let children = self.edges[next].iter().rev().copied().collect();
                        stack.push((next, children));
                    }
                    Some(_) => {}
                    None => {
                        order.push(node);
                        stack.pop();
                    }
                }
            }
        }
        order
    }

    /// Compute every file's dependency hash by iterative union.
    ///
    /// Each file starts with itself; every pass merges in the sets of its
    /// dependencies, in topological order. Sets only grow, so the loop
    /// reaches a fixed point; an acyclic graph needs one pass plus one
    /// confirming pass, and each cycle ends up sharing a single set. When
    /// `cap` passes run out first, the files changed by the last pass are
    /// reported as unresolved.
    pub fn resolve_hashes(&self, cap: usize) -> HashResolution {
        let order = self.order_indices();
        let mut closure: Vec<BTreeSet<usize>> =
            (0..self.nodes.len()).map(|i| BTreeSet::from([i])).collect();

        let mut iterations = 0;
        let mut converged = false;
        let mut last_changed: BTreeSet<usize> = BTreeSet::new();

        while iterations < cap.max(1) {
            iterations += 1;
            let mut changed = BTreeSet::new();
            for &node in &order {
                let mut merged = closure[node].clone();
                for &dep in &self.edges[node] {
                    merged.extend(closure[dep].iter().copied());
                }
                if merged.len() != closure[node].len() {
                    closure[node] = merged;
                    changed.insert(node);
                }
            }
            debug!("dependency pass {iterations}: {} files changed", changed.len());
            if changed.is_empty() {
                converged = true;
                break;
            }
            last_changed = changed;
        }

        let unresolved: BTreeSet<String> = if converged {
            BTreeSet::new()
        } else {
            last_changed
                .iter()
                .map(|&i| self.nodes[i].clone())
                .collect()
        };
        if !unresolved.is_empty() {
            warn!(
                "dependency hashes did not settle after {iterations} passes; {} files forced dirty",
                unresolved.len()
            );
        }

        let hashes = closure
            .iter()
            .enumerate()
            .map(|(i, members)| {
                let hash = hash_entries(
                    members
                        .iter()
                        .map(|&m| (self.nodes[m].as_str(), self.content_hashes[m].as_str())),
                );
                (self.nodes[i].clone(), hash)
            })
            .collect();

        HashResolution {
            hashes,
            unresolved,
            iterations,
            converged,
        }
    }
}
