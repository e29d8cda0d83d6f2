//! Cascade dependency graph and the per-cycle written-destination tracker.
//!
//! Pair X feeds pair Y when X's destination root lies at or under Y's source
//! and is not excluded by Y. Pairs connected through such edges (in either
//! direction) form a [`CascadeGroup`]; each group is evaluated in
//! topological order so a downstream pair always scans after its upstream
//! pair has written.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use backer_core::{DirectoryPair, PairId};

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A weakly connected set of pairs plus their feed edges.
#[derive(Debug, Clone)]
pub struct CascadeGroup {
    /// Topological order; pairs stuck on a cycle trail in configuration order.
    pairs: Vec<DirectoryPair>,
    downstream: BTreeMap<PairId, Vec<PairId>>,
    cycle: Option<Vec<PairId>>,
}

impl CascadeGroup {
    pub fn pairs(&self) -> &[DirectoryPair] {
        &self.pairs
    }

    pub fn ids(&self) -> Vec<PairId> {
        self.pairs.iter().map(|p| p.id).collect()
    }

    pub fn contains(&self, id: PairId) -> bool {
        self.pairs.iter().any(|p| p.id == id)
    }

    /// Pairs fed directly by `id`.
    pub fn downstream(&self, id: PairId) -> &[PairId] {
        self.downstream.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pairs stuck on a cycle (and anything only reachable through one).
    pub fn cycle(&self) -> Option<&[PairId]> {
        self.cycle.as_deref()
    }

    /// Shortest scan delay in the group; the group's task ticks at this rate.
    pub fn min_delay(&self) -> Duration {
        self.pairs
            .iter()
            .map(|p| p.scan_delay)
            .min()
            .unwrap_or(Duration::from_secs(1))
    }

    /// The pairs a cycle must visit for the `due` set: every due pair plus
    /// everything reachable downstream of one, in topological order. Pairs
    /// stuck on a cycle are never included.
    pub fn evaluation_order(&self, due: &[PairId]) -> Vec<&DirectoryPair> {
        let reach = self.reach(due);
        self.pairs
            .iter()
            .filter(|p| reach.contains(&p.id) && !self.is_stuck(p.id))
            .collect()
    }

    /// Pairs the `due` set would reach that are stuck on a cycle.
    pub fn blocked(&self, due: &[PairId]) -> Vec<PairId> {
        let reach = self.reach(due);
        self.pairs
            .iter()
            .map(|p| p.id)
            .filter(|id| reach.contains(id) && self.is_stuck(*id))
            .collect()
    }

    fn is_stuck(&self, id: PairId) -> bool {
        self.cycle.as_ref().is_some_and(|stuck| stuck.contains(&id))
    }

    fn reach(&self, due: &[PairId]) -> BTreeSet<PairId> {
        let mut reach: BTreeSet<PairId> = BTreeSet::new();
        let mut stack: Vec<PairId> = due.iter().copied().filter(|id| self.contains(*id)).collect();
        while let Some(id) = stack.pop() {
            if reach.insert(id) {
                stack.extend(self.downstream(id).iter().copied());
            }
        }
        reach
    }
}

/// All cascade groups for a configuration, ordered by lowest pair id.
#[derive(Debug, Clone, Default)]
pub struct CascadeGraph {
    groups: Vec<CascadeGroup>,
}

impl CascadeGraph {
    pub fn build(pairs: &[DirectoryPair]) -> Self {
        let n = pairs.len();
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (x, upstream) in pairs.iter().enumerate() {
            for (y, downstream) in pairs.iter().enumerate() {
                if downstream.receives(&upstream.destination) {
                    edges.push((x, y));
                }
            }
        }

        // Union-find over pair positions for weak connectivity.
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        for &(x, y) in &edges {
            let (rx, ry) = (find(&mut parent, x), find(&mut parent, y));
            if rx != ry {
                parent[rx.max(ry)] = rx.min(ry);
            }
        }

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            members.entry(root).or_default().push(i);
        }

        let mut groups: Vec<CascadeGroup> = members
            .into_values()
            .map(|positions| {
                let in_group: BTreeSet<usize> = positions.iter().copied().collect();
                let group_edges: Vec<(PairId, PairId)> = edges
                    .iter()
                    .filter(|(x, _)| in_group.contains(x))
                    .map(|&(x, y)| (pairs[x].id, pairs[y].id))
                    .collect();
                let group_pairs: Vec<DirectoryPair> =
                    positions.iter().map(|&i| pairs[i].clone()).collect();
                order_group(group_pairs, &group_edges)
            })
            .collect();
        groups.sort_by_key(|g| g.pairs.iter().map(|p| p.id).min());

        for group in &groups {
            match group.cycle() {
                Some(cycle) => tracing::warn!(?cycle, "cascade cycle detected"),
                None if group.pairs.len() > 1 => {
                    tracing::debug!(order = ?group.ids(), "cascade group");
                }
                None => {}
            }
        }

        Self { groups }
    }

    pub fn groups(&self) -> &[CascadeGroup] {
        &self.groups
    }

    pub fn into_groups(self) -> Vec<CascadeGroup> {
        self.groups
    }
}

/// Kahn's algorithm with ties broken by lowest pair id.
fn order_group(pairs: Vec<DirectoryPair>, edges: &[(PairId, PairId)]) -> CascadeGroup {
    let mut downstream: BTreeMap<PairId, Vec<PairId>> = BTreeMap::new();
    let mut in_degree: BTreeMap<PairId, usize> = pairs.iter().map(|p| (p.id, 0)).collect();
    for &(x, y) in edges {
        downstream.entry(x).or_default().push(y);
        *in_degree.entry(y).or_default() += 1;
    }

    let mut ready: BTreeSet<PairId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order: Vec<PairId> = Vec::with_capacity(pairs.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for next in downstream.get(&id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    let placed: BTreeSet<PairId> = order.iter().copied().collect();
    let stuck: Vec<PairId> = pairs
        .iter()
        .map(|p| p.id)
        .filter(|id| !placed.contains(id))
        .collect();
    order.extend(stuck.iter().copied());

    let mut by_id: BTreeMap<PairId, DirectoryPair> =
        pairs.into_iter().map(|p| (p.id, p)).collect();
    let pairs = order.iter().filter_map(|id| by_id.remove(id)).collect();
    CascadeGroup {
        pairs,
        downstream,
        cycle: (!stuck.is_empty()).then_some(stuck),
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Backup folders written during the current cycle.
#[derive(Debug, Clone, Default)]
pub struct CascadeTracker {
    written: Vec<PathBuf>,
}

impl CascadeTracker {
    pub fn mark_written(&mut self, folder: impl Into<PathBuf>) {
        self.written.push(folder.into());
    }

    /// Whether anything written this cycle landed in `pair`'s scanned tree.
    pub fn was_just_written(&self, pair: &DirectoryPair) -> bool {
        self.written.iter().any(|w| pair.receives(w))
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    pub fn reset(&mut self) {
        self.written.clear();
    }
}
