use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, VecDeque};

use crate::error::GraphError;

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: IndexMap<String, Vec<String>>,
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn add_node<I, S>(&mut self, id: &str, depends_on: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.nodes.contains_key(id) {
            return Err(GraphError::DuplicateNode(id.to_string()));
        }

        self.nodes.insert(
            id.to_string(),
            depends_on.into_iter().map(Into::into).collect(),
        );
        Ok(())
    }

    /// Validates every edge and returns the graph. Fails on self dependencies,
    /// dependencies that were never added and cycles.
    pub fn build(self) -> Result<BuildGraph, GraphError> {
        for (id, depends_on) in &self.nodes {
            for dependency in depends_on {
                if dependency == id {
                    return Err(GraphError::SelfDependency(id.clone()));
                }
                if !self.nodes.contains_key(dependency) {
                    return Err(GraphError::UnknownDependency {
                        service: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let graph = BuildGraph { nodes: self.nodes };
        graph.check_cycles()?;
        Ok(graph)
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Acyclic dependency graph of services, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildGraph {
    nodes: IndexMap<String, Vec<String>>,
}

impl BuildGraph {
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.nodes.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The requested nodes plus everything they transitively depend on.
    pub fn subtree<S: AsRef<str>>(&self, ids: &[S]) -> Result<BuildGraph, GraphError> {
        let mut keep = IndexSet::new();
        let mut pending = Vec::new();

        for id in ids {
            let id = id.as_ref();
            if !self.nodes.contains_key(id) {
                return Err(GraphError::UnknownNode(id.to_string()));
            }
            pending.push(id.to_string());
        }

        while let Some(id) = pending.pop() {
            if !keep.insert(id.clone()) {
                continue;
            }
            pending.extend(self.dependencies(&id).iter().cloned());
        }

        let nodes = self
            .nodes
            .iter()
            .filter(|(id, _)| keep.contains(*id))
            .map(|(id, depends_on)| (id.clone(), depends_on.clone()))
            .collect();

        Ok(BuildGraph { nodes })
    }

    /// Topological order. Dependencies always come first; nodes that become
    /// ready at the same time keep their declaration order.
    pub fn ordered(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (id, depends_on) in &self.nodes {
            in_degree.insert(id, depends_on.len());
            for dependency in depends_on {
                dependents.entry(dependency).or_default().push(id);
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|(_, depends_on)| depends_on.is_empty())
            .map(|(id, _)| id.as_str())
            .collect();

        let mut ordered = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            ordered.push(id.to_string());

            for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        ordered
    }

    fn check_cycles(&self) -> Result<(), GraphError> {
        let mut marks: HashMap<&str, Mark> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), Mark::White))
            .collect();

        for id in self.nodes.keys() {
            if marks.get(id.as_str()) == Some(&Mark::White) {
                self.visit(id, &mut marks)?;
            }
        }

        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), GraphError> {
        marks.insert(id, Mark::Gray);

        for dependency in self.dependencies(id) {
            match marks.get(dependency.as_str()) {
                Some(Mark::Gray) => {
                    return Err(GraphError::Cycle {
                        from: dependency.clone(),
                        to: id.to_string(),
                    })
                }
                Some(Mark::White) => self.visit(dependency, marks)?,
                _ => {}
            }
        }

        marks.insert(id, Mark::Black);
        Ok(())
    }
}
