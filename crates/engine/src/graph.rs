//! Dependency graph construction and execution planning.
//!
//! Edges are implicit in node-output bindings: a node depends on every node it reads an
//! output from. [`build`] validates the chain, materializes the adjacency as a [`ChainGraph`],
//! rejects cycles with a three-color depth-first search, and groups nodes into layers that
//! can run concurrently.

use std::collections::{HashMap, HashSet, VecDeque};

use chainfury_types::{ChainDefinition, InputBinding};
use indexmap::IndexMap;

use crate::error::GraphError;

/// Explicit adjacency derived from a chain's bindings. Both directions keep declaration order.
#[derive(Debug, Clone, Default)]
pub struct ChainGraph {
    dependencies: IndexMap<String, Vec<String>>,
    dependents: IndexMap<String, Vec<String>>,
}

impl ChainGraph {
    /// Direct dependencies of a node, in binding order.
    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.dependencies.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Direct dependents of a node, in declaration order.
    pub fn dependents(&self, node_id: &str) -> &[String] {
        self.dependents.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Node identifiers in declaration order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Validated, cycle-free ordering of a chain's nodes.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    graph: ChainGraph,
    layers: Vec<Vec<String>>,
    layer_of: HashMap<String, usize>,
}

impl ExecutionPlan {
    pub fn graph(&self) -> &ChainGraph {
        &self.graph
    }

    /// Nodes grouped by layer. Layer 0 has no dependencies; every other node sits one layer
    /// after its deepest dependency. Nodes inside a layer keep declaration order.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Topological order: layers flattened in sequence.
    pub fn order(&self) -> Vec<&str> {
        self.layers.iter().flatten().map(String::as_str).collect()
    }

    pub fn layer_of(&self, node_id: &str) -> Option<usize> {
        self.layer_of.get(node_id).copied()
    }

    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.graph.dependencies(node_id)
    }

    pub fn dependents(&self, node_id: &str) -> &[String] {
        self.graph.dependents(node_id)
    }

    /// Every node reachable through dependent edges, in topological order.
    pub fn transitive_dependents(&self, node_id: &str) -> Vec<&str> {
        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.graph.dependents(current) {
                if reached.insert(dependent.as_str()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }
        self.order().into_iter().filter(|candidate| reached.contains(candidate)).collect()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Validate a chain definition and compute its execution plan.
///
/// Returns an error for empty or duplicate node identifiers, references to unknown nodes or
/// undeclared chain inputs, self references, output mappings naming unknown nodes, and
/// cycles. A cyclic chain never yields a partial order.
pub fn build(chain: &ChainDefinition) -> Result<ExecutionPlan, GraphError> {
    let mut index_of: IndexMap<&str, usize> = IndexMap::new();
    for (position, node) in chain.nodes.iter().enumerate() {
        if node.id.trim().is_empty() {
            return Err(GraphError::EmptyNodeId);
        }
        if index_of.insert(node.id.as_str(), position).is_some() {
            return Err(GraphError::DuplicateNode { node_id: node.id.clone() });
        }
    }

    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(chain.nodes.len());
    for node in &chain.nodes {
        let mut node_edges: Vec<usize> = Vec::new();
        for (input, binding) in &node.input_bindings {
            match binding {
                InputBinding::NodeOutput { node: referenced, .. } => {
                    if referenced == &node.id {
                        return Err(GraphError::SelfReference {
                            node_id: node.id.clone(),
                            input: input.clone(),
                        });
                    }
                    let Some(&dependency) = index_of.get(referenced.as_str()) else {
                        return Err(GraphError::UnknownNode {
                            node_id: node.id.clone(),
                            input: input.clone(),
                            referenced: referenced.clone(),
                        });
                    };
                    if !node_edges.contains(&dependency) {
                        node_edges.push(dependency);
                    }
                }
                InputBinding::ChainInput { input: chain_input } => {
                    if !chain.inputs.is_empty() && !chain.inputs.contains_key(chain_input) {
                        return Err(GraphError::UndeclaredChainInput {
                            node_id: node.id.clone(),
                            input: input.clone(),
                            chain_input: chain_input.clone(),
                        });
                    }
                }
                InputBinding::Literal { .. } => {}
            }
        }
        edges.push(node_edges);
    }

    for (output, target) in &chain.output_mapping {
        if !index_of.contains_key(target.node.as_str()) {
            return Err(GraphError::UnknownOutputNode {
                output: output.clone(),
                node_id: target.node.clone(),
            });
        }
    }

    let ids: Vec<&str> = index_of.keys().copied().collect();
    detect_cycles(&ids, &edges)?;

    let mut layer_by_index: Vec<usize> = vec![0; ids.len()];
    for index in topological_indices(&edges) {
        layer_by_index[index] = edges[index].iter().map(|dependency| layer_by_index[*dependency] + 1).max().unwrap_or(0);
    }

    let layer_count = layer_by_index.iter().max().map(|deepest| deepest + 1).unwrap_or(0);
    let mut layers: Vec<Vec<String>> = vec![Vec::new(); layer_count];
    let mut layer_of = HashMap::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        layers[layer_by_index[index]].push(id.to_string());
        layer_of.insert(id.to_string(), layer_by_index[index]);
    }

    let mut graph = ChainGraph::default();
    for (index, id) in ids.iter().enumerate() {
        let dependencies = edges[index].iter().map(|dependency| ids[*dependency].to_string()).collect();
        graph.dependencies.insert(id.to_string(), dependencies);
        graph.dependents.insert(id.to_string(), Vec::new());
    }
    for (index, id) in ids.iter().enumerate() {
        for dependency in &edges[index] {
            if let Some(dependents) = graph.dependents.get_mut(ids[*dependency]) {
                dependents.push(id.to_string());
            }
        }
    }

    Ok(ExecutionPlan { graph, layers, layer_of })
}

/// Depth-first search over dependency edges with three-color marking.
fn detect_cycles(ids: &[&str], edges: &[Vec<usize>]) -> Result<(), GraphError> {
    let mut marks = vec![Mark::Unvisited; ids.len()];
    for start in 0..ids.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::InProgress;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        while let Some(&(node, cursor)) = stack.last() {
            let Some(&dependency) = edges[node].get(cursor) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            if let Some(frame) = stack.last_mut() {
                frame.1 += 1;
            }
            match marks[dependency] {
                Mark::Unvisited => {
                    marks[dependency] = Mark::InProgress;
                    stack.push((dependency, 0));
                }
                Mark::InProgress => {
                    let cycle_start = stack.iter().position(|(candidate, _)| *candidate == dependency).unwrap_or(0);
                    let mut path: Vec<String> = stack[cycle_start..].iter().map(|(candidate, _)| ids[*candidate].to_string()).collect();
                    path.push(ids[dependency].to_string());
                    return Err(GraphError::Cyclic {
                        node_id: ids[dependency].to_string(),
                        path,
                    });
                }
                Mark::Done => {}
            }
        }
    }
    Ok(())
}

/// Kahn ordering over an acyclic edge set; ready nodes are taken in declaration order.
fn topological_indices(edges: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degrees: Vec<usize> = edges.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); edges.len()];
    for (index, node_edges) in edges.iter().enumerate() {
        for dependency in node_edges {
            dependents[*dependency].push(index);
        }
    }

    let mut queue: VecDeque<usize> = (0..edges.len()).filter(|index| in_degrees[*index] == 0).collect();
    let mut ordered = Vec::with_capacity(edges.len());
    while let Some(index) = queue.pop_front() {
        ordered.push(index);
        for dependent in &dependents[index] {
            in_degrees[*dependent] -= 1;
            if in_degrees[*dependent] == 0 {
                queue.push_back(*dependent);
            }
        }
    }
    ordered
}
