//! Generic dependency graph with cycle-aware ordered traversal.
//!
//! The graph is directed: an edge `u -> v` means "u depends on v". Nodes are
//! opaque equality-comparable values owned by the graph; adjacency lives in a
//! [`StableDiGraph`] arena keyed by index, so parent and child sets never
//! hold references into each other.
//!
//! Both traversal directions are frontier-driven: a node becomes eligible
//! once all of its prerequisites have been yielded. A consequence worth
//! spelling out is that cycle members, and anything whose prerequisite
//! chain runs through a cycle, are never yielded at all — the walk simply
//! runs dry. Callers that need to report cycles run
//! [`DependencyGraph::cycles`] first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use petgraph::Direction;
use petgraph::algo::kosaraju_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};

pub struct DependencyGraph<T> {
    arena: StableDiGraph<T, ()>,
    index: HashMap<T, NodeIndex>,
}

impl<T> Default for DependencyGraph<T>
where
    T: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DependencyGraph<T>
where
    T: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            arena: StableDiGraph::default(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.node_count() == 0
    }

    pub fn contains(&self, node: &T) -> bool {
        self.index.contains_key(node)
    }

    /// Insert a node if it isn't present yet. Returns whether it was added.
    pub fn add_node(&mut self, node: T) -> bool {
        if self.index.contains_key(&node) {
            return false;
        }

        let ix = self.arena.add_node(node.clone());
        self.index.insert(node, ix);
        true
    }

    /// Remove a node together with all of its edges.
    pub fn remove_node(&mut self, node: &T) -> bool {
        match self.index.remove(node) {
            Some(ix) => {
                self.arena.remove_node(ix);
                true
            }
            None => false,
        }
    }

    /// Record that `dependent` depends on `dependency`. Nodes are inserted
    /// implicitly; a duplicate edge collapses into the existing one.
    pub fn add_edge(&mut self, dependent: T, dependency: T) {
        self.add_node(dependent.clone());
        self.add_node(dependency.clone());

        let a = self.index[&dependent];
        let b = self.index[&dependency];
        self.arena.update_edge(a, b, ());
    }

    pub fn remove_edge(&mut self, dependent: &T, dependency: &T) -> bool {
        let (Some(&a), Some(&b)) = (self.index.get(dependent), self.index.get(dependency))
        else {
            return false;
        };

        match self.arena.find_edge(a, b) {
            Some(edge) => {
                self.arena.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    pub fn has_edge(&self, dependent: &T, dependency: &T) -> bool {
        match (self.index.get(dependent), self.index.get(dependency)) {
            (Some(&a), Some(&b)) => self.arena.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.arena.node_indices().map(|ix| &self.arena[ix])
    }

    /// Direct dependencies of `node`, in insertion order.
    pub fn dependencies_of(&self, node: &T) -> Vec<T> {
        self.neighbors(node, Direction::Outgoing)
    }

    /// Direct dependents of `node`, in insertion order.
    pub fn dependents_of(&self, node: &T) -> Vec<T> {
        self.neighbors(node, Direction::Incoming)
    }

    fn neighbors(&self, node: &T, dir: Direction) -> Vec<T> {
        let Some(&ix) = self.index.get(node) else {
            return Vec::new();
        };

        self.sorted_neighbors(ix, dir)
            .into_iter()
            .map(|n| self.arena[n].clone())
            .collect()
    }

    // Neighbor iteration order in petgraph is most-recent-edge first; sort
    // by node index to get a stable, insertion-ordered view.
    fn sorted_neighbors(&self, ix: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<_> = self.arena.neighbors_directed(ix, dir).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Every node reachable from `seeds` by repeatedly following dependent
    /// edges, excluding the seeds themselves. Breadth-first order.
    pub fn dependents_closure<'a>(&self, seeds: impl IntoIterator<Item = &'a T>) -> Vec<T>
    where
        T: 'a,
    {
        self.closure(seeds, Direction::Incoming)
    }

    /// Mirror of [`Self::dependents_closure`] over dependency edges.
    pub fn dependencies_closure<'a>(&self, seeds: impl IntoIterator<Item = &'a T>) -> Vec<T>
    where
        T: 'a,
    {
        self.closure(seeds, Direction::Outgoing)
    }

    fn closure<'a>(&self, seeds: impl IntoIterator<Item = &'a T>, dir: Direction) -> Vec<T>
    where
        T: 'a,
    {
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        let mut seen: HashSet<NodeIndex> = HashSet::new();

        for seed in seeds {
            if let Some(&ix) = self.index.get(seed) {
                seen.insert(ix);
                queue.push_back(ix);
            }
        }

        let roots = seen.clone();
        let mut out = Vec::new();

        while let Some(ix) = queue.pop_front() {
            for next in self.sorted_neighbors(ix, dir) {
                if seen.insert(next) {
                    out.push(self.arena[next].clone());
                    queue.push_back(next);
                }
            }
        }

        // A seed can reappear through another seed's edges; drop those too.
        out.retain(|n| !roots.contains(&self.index[n]));
        out
    }

    /// Strongly connected components that constitute genuine cycles: every
    /// component of size greater than one, plus singletons with a self-edge.
    /// Members are reported in insertion order.
    pub fn cycles(&self) -> Vec<Vec<T>> {
        kosaraju_scc(&self.arena)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.arena.find_edge(scc[0], scc[0]).is_some())
            .map(|mut scc| {
                scc.sort_unstable();
                scc.iter().map(|&ix| self.arena[ix].clone()).collect()
            })
            .collect()
    }

    /// Walk the graph dependencies-first: every node is yielded strictly
    /// after all of its dependencies (acyclic subgraphs only; see the module
    /// docs for cycle behavior).
    pub fn dependency_order(&self) -> Walk<'_, T> {
        Walk::new(self, Direction::Outgoing)
    }

    /// Walk the graph dependents-first: every node is yielded strictly
    /// before all of its dependencies.
    pub fn dependent_order(&self) -> Walk<'_, T> {
        Walk::new(self, Direction::Incoming)
    }
}

/// A frontier cursor over a [`DependencyGraph`].
///
/// Not an [`Iterator`]: [`Walk::cut_from_last`] mutates the remaining
/// traversal based on what happened to the node yielded last, which is the
/// whole point of walking instead of collecting an order up front.
pub struct Walk<'g, T> {
    graph: &'g DependencyGraph<T>,
    /// Edge direction pointing at a node's prerequisites.
    prerequisites: Direction,
    /// Prerequisite counts still outstanding, for nodes not yet eligible.
    pending: HashMap<NodeIndex, usize>,
    ready: VecDeque<NodeIndex>,
    yielded: HashSet<NodeIndex>,
    cut: HashSet<NodeIndex>,
    last: Option<NodeIndex>,
}

impl<'g, T> Walk<'g, T>
where
    T: Clone + Eq + Hash,
{
    fn new(graph: &'g DependencyGraph<T>, prerequisites: Direction) -> Self {
        let mut pending = HashMap::new();
        let mut ready = VecDeque::new();

        for ix in graph.arena.node_indices() {
            let count = graph.sorted_neighbors(ix, prerequisites).len();
            if count == 0 {
                ready.push_back(ix);
            } else {
                pending.insert(ix, count);
            }
        }

        Self {
            graph,
            prerequisites,
            pending,
            ready,
            yielded: HashSet::new(),
            cut: HashSet::new(),
            last: None,
        }
    }

    pub fn next(&mut self) -> Option<T> {
        loop {
            let ix = self.ready.pop_front()?;
            if self.cut.contains(&ix) {
                continue;
            }

            self.yielded.insert(ix);
            self.last = Some(ix);

            for follower in self.graph.sorted_neighbors(ix, self.prerequisites.opposite()) {
                if self.cut.contains(&follower) || self.yielded.contains(&follower) {
                    continue;
                }
                if let Some(count) = self.pending.get_mut(&follower) {
                    *count -= 1;
                    if *count == 0 {
                        self.pending.remove(&follower);
                        self.ready.push_back(follower);
                    }
                }
            }

            return Some(self.graph.arena[ix].clone());
        }
    }

    /// Remove every not-yet-yielded node reachable forward from the node
    /// yielded last, and return the removed nodes in the order the walk
    /// would have reached them. Used to cut off a failed unit's entire
    /// dependent subtree (or, walking the other way, its dependencies).
    pub fn cut_from_last(&mut self) -> Vec<T> {
        let Some(last) = self.last else {
            return Vec::new();
        };

        let mut queue = VecDeque::from([last]);
        let mut removed = Vec::new();

        while let Some(ix) = queue.pop_front() {
            for follower in self.graph.sorted_neighbors(ix, self.prerequisites.opposite()) {
                if self.yielded.contains(&follower) || !self.cut.insert(follower) {
                    continue;
                }
                self.pending.remove(&follower);
                removed.push(self.graph.arena[follower].clone());
                queue.push_back(follower);
            }
        }

        removed
    }
}
