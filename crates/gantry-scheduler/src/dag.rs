//! DAG resolution for pipeline stages.

use gantry_core::pipeline::{PipelineDefinition, StageDefinition};
use gantry_core::run::StageStatus;
use gantry_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// A node in the pipeline DAG.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub name: String,
    pub definition: StageDefinition,
}

/// Whether a stage may leave `Pending`/`Blocked`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency is not terminal yet.
    Waiting,
    /// Every dependency succeeded or was skipped.
    Ready,
    /// A dependency failed; the stage can never run.
    DependencyFailed(String),
}

/// Directed acyclic graph representing stage dependencies.
///
/// Edges point from a dependency to its dependent.
#[derive(Debug)]
pub struct PipelineDag {
    graph: DiGraph<DagNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl PipelineDag {
    /// Get the root stages (stages with no dependencies).
    pub fn roots(&self) -> Vec<&DagNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Get stages that depend directly on a given stage.
    pub fn successors(&self, stage_name: &str) -> Vec<&DagNode> {
        self.name_to_index
            .get(stage_name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get topologically sorted stages, ties broken by declaration order.
    pub fn topological_order(&self) -> Vec<&DagNode> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut done = vec![false; self.graph.node_count()];

        while order.len() < self.graph.node_count() {
            let Some(next) = self
                .graph
                .node_indices()
                .find(|idx| !done[idx.index()] && in_degree[idx.index()] == 0)
            else {
                break;
            };
            done[next.index()] = true;
            for succ in self.graph.neighbors_directed(next, Direction::Outgoing) {
                in_degree[succ.index()] -= 1;
            }
            if let Some(node) = self.graph.node_weight(next) {
                order.push(node);
            }
        }
        order
    }

    /// Whether `stage` depends on `ancestor`, directly or through other stages.
    ///
    /// A stage is never its own ancestor.
    pub fn depends_transitively(&self, stage: &str, ancestor: &str) -> bool {
        match (self.name_to_index.get(ancestor), self.name_to_index.get(stage)) {
            (Some(&from), Some(&to)) if from != to => {
                has_path_connecting(&self.graph, from, to, None)
            }
            _ => false,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&DagNode> {
        self.name_to_index
            .get(name)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Decide whether a stage can leave the waiting states.
    ///
    /// Pure: depends only on the definition and the given status table.
    pub fn readiness(&self, stage_name: &str, statuses: &HashMap<String, StageStatus>) -> Readiness {
        let Some(node) = self.stage(stage_name) else {
            return Readiness::Waiting;
        };

        let mut waiting = false;
        for dep in &node.definition.depends_on {
            match statuses.get(dep).copied().unwrap_or(StageStatus::Pending) {
                StageStatus::Failed => return Readiness::DependencyFailed(dep.clone()),
                status if status.satisfies_dependency() => {}
                _ => waiting = true,
            }
        }

        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }
}

/// Builder for constructing pipeline DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG from a pipeline definition.
    pub fn build(&self, pipeline: &PipelineDefinition) -> Result<PipelineDag> {
        if pipeline.stages.is_empty() {
            return Err(Error::InvalidPipeline("pipeline has no stages".to_string()));
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        // Add all stages as nodes
        for stage in &pipeline.stages {
            if name_to_index.contains_key(&stage.name) {
                return Err(Error::InvalidPipeline(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            let node = DagNode {
                name: stage.name.clone(),
                definition: stage.clone(),
            };
            let idx = graph.add_node(node);
            name_to_index.insert(stage.name.clone(), idx);
        }

        // Add edges for dependencies
        for stage in &pipeline.stages {
            let stage_idx = name_to_index[&stage.name];
            let mut seen = HashSet::new();
            for dep in &stage.depends_on {
                let dep_idx = name_to_index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dep.clone(),
                })?;
                if seen.insert(dep_idx) {
                    graph.add_edge(*dep_idx, stage_idx, ());
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(Error::CycleDetected {
                path: cycle_path(&graph, cycle.node_id()),
            });
        }

        Ok(PipelineDag {
            graph,
            name_to_index,
        })
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the strongly connected component containing `start` back to itself.
fn cycle_path(graph: &DiGraph<DagNode, ()>, start: NodeIndex) -> Vec<String> {
    let name = |idx: NodeIndex| graph[idx].name.clone();

    let component: HashSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .map(|scc| scc.into_iter().collect())
        .unwrap_or_default();

    // Depth-first search for a path start -> ... -> start inside the component.
    let mut stack = vec![(start, vec![start])];
    let mut visited = HashSet::new();
    while let Some((node, path)) = stack.pop() {
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if next == start {
                let mut names: Vec<String> = path.iter().map(|&idx| name(idx)).collect();
                names.push(name(start));
                return names;
            }
            if component.contains(&next) && visited.insert(next) {
                let mut extended = path.clone();
                extended.push(next);
                stack.push((next, extended));
            }
        }
    }

    vec![name(start)]
}
