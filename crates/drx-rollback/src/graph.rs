//! Component dependency graph
//!
//! Nodes are components, an edge `a -> b` means "a depends on b". Rollback
//! walks the graph dependents-first so nothing is left running against a base
//! that has already moved; deployment walks it bases-first. Ties are broken
//! by component name so the order is reproducible.

use drx_core::{ComponentVersionRecord, DrxError};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("{0} cannot depend on itself")]
    SelfLoop(String),

    #[error("dependency cycle through {0}")]
    CycleDetected(String),

    #[error("component {0} is not in the graph")]
    NodeNotFound(String),
}

impl From<GraphError> for DrxError {
    fn from(err: GraphError) -> Self {
        DrxError::DependencyOrder(err.to_string())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    inner: DiGraphMap<usize, ()>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph over `records`, keeping only edges between listed components
    ///
    /// # Errors
    /// `SelfLoop` or `CycleDetected` if the records do not form a DAG.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a ComponentVersionRecord>,
    ) -> Result<Self, GraphError> {
        let records: Vec<_> = records.into_iter().collect();
        let mut graph = Self::new();
        for record in &records {
            graph.add_component(&record.component_name);
        }
        for record in &records {
            for dependency in record.dependency_names() {
                if graph.contains(dependency) {
                    graph.add_dependency(&record.component_name, dependency)?;
                }
            }
        }
        Ok(graph)
    }

    pub fn add_component(&mut self, name: &str) -> usize {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        self.inner.add_node(id);
        id
    }

    /// Record that `dependent` depends on `dependency`
    ///
    /// # Errors
    /// `SelfLoop` for `a -> a`; `CycleDetected` if the edge closes a cycle,
    /// in which case the edge is not kept.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) -> Result<(), GraphError> {
        if dependent == dependency {
            return Err(GraphError::SelfLoop(dependent.to_string()));
        }
        let from = self.add_component(dependent);
        let to = self.add_component(dependency);
        self.inner.add_edge(from, to, ());

        if petgraph::algo::is_cyclic_directed(&self.inner) {
            self.inner.remove_edge(from, to);
            return Err(GraphError::CycleDetected(format!("{dependent} -> {dependency}")));
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Direct dependencies of `name`, sorted
    ///
    /// # Errors
    /// `NodeNotFound` for unknown components.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Components that depend directly on `name`, sorted
    ///
    /// # Errors
    /// `NodeNotFound` for unknown components.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Result<Vec<&str>, GraphError> {
        let id = self
            .index
            .get(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))?;
        let mut out: Vec<&str> = self
            .inner
            .neighbors_directed(*id, dir)
            .map(|n| self.names[n].as_str())
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Rollback order: dependents first, shared bases last
    ///
    /// # Errors
    /// `CycleDetected` if the graph is not acyclic.
    pub fn rollback_order(&self) -> Result<Vec<String>, GraphError> {
        self.kahn(Direction::Incoming)
    }

    /// Deployment order: bases first
    ///
    /// # Errors
    /// `CycleDetected` if the graph is not acyclic.
    pub fn deploy_order(&self) -> Result<Vec<String>, GraphError> {
        self.kahn(Direction::Outgoing)
    }

    /// Rollback order grouped into layers with no edges inside a layer
    ///
    /// Every component of a layer can be rolled back concurrently once the
    /// previous layers are done.
    ///
    /// # Errors
    /// `CycleDetected` if the graph is not acyclic.
    pub fn rollback_layers(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut pending = self.pending_counts(Direction::Incoming);
        let mut layers = Vec::new();
        let mut ready: BTreeSet<&str> = self.ready(&pending);
        let mut seen = 0;

        while !ready.is_empty() {
            let layer: Vec<String> = ready.iter().map(|s| (*s).to_string()).collect();
            let mut next = BTreeSet::new();
            for name in &ready {
                let id = self.index[*name];
                pending.remove(name);
                for dep in self.inner.neighbors_directed(id, Direction::Outgoing) {
                    let dep_name = self.names[dep].as_str();
                    if let Some(count) = pending.get_mut(dep_name) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(dep_name);
                        }
                    }
                }
            }
            seen += layer.len();
            layers.push(layer);
            ready = next;
        }

        if seen != self.names.len() {
            return Err(self.cycle_error(&pending));
        }
        Ok(layers)
    }

    /// Kahn's algorithm, always taking the smallest ready name
    ///
    /// With `Incoming` a node is ready once everything depending on it has
    /// been emitted; with `Outgoing` once all its dependencies have.
    fn kahn(&self, gate: Direction) -> Result<Vec<String>, GraphError> {
        let mut pending = self.pending_counts(gate);
        let mut ready = self.ready(&pending);
        let mut order = Vec::with_capacity(self.names.len());

        while let Some(name) = ready.pop_first() {
            pending.remove(name);
            order.push(name.to_string());
            let id = self.index[name];
            for next in self.inner.neighbors_directed(id, gate.opposite()) {
                let next_name = self.names[next].as_str();
                if let Some(count) = pending.get_mut(next_name) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(next_name);
                    }
                }
            }
        }

        if order.len() != self.names.len() {
            return Err(self.cycle_error(&pending));
        }
        Ok(order)
    }

    fn pending_counts(&self, gate: Direction) -> BTreeMap<&str, usize> {
        self.names
            .iter()
            .enumerate()
            .map(|(id, name)| {
                (
                    name.as_str(),
                    self.inner.neighbors_directed(id, gate).count(),
                )
            })
            .collect()
    }

    fn ready<'a>(&self, pending: &BTreeMap<&'a str, usize>) -> BTreeSet<&'a str> {
        pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect()
    }

    fn cycle_error(&self, pending: &BTreeMap<&str, usize>) -> GraphError {
        let stuck: Vec<&str> = pending.keys().copied().collect();
        GraphError::CycleDetected(stuck.join(", "))
    }
}
