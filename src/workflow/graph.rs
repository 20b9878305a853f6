//! Step dependency graph.
//!
//! Built once per workflow at load time. Edges point from a dependency to the
//! steps that need it; cycles are rejected with Kahn's algorithm.

use super::StepDef;
use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};

/// Index into the workflow's step list.
pub type StepIndex = usize;

#[derive(Debug, Clone)]
pub struct StepGraph {
    ids: Vec<String>,
    index_map: HashMap<String, StepIndex>,
    /// index -> steps that depend on it
    forward_edges: Vec<Vec<StepIndex>>,
    /// index -> steps it depends on
    reverse_edges: Vec<Vec<StepIndex>>,
}

impl StepGraph {
    /// Build the graph, rejecting duplicate ids, unknown dependencies and cycles.
    pub fn build(steps: &[StepDef]) -> Result<Self> {
        let mut index_map = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if index_map.insert(step.id.clone(), i).is_some() {
                bail!("Duplicate step id: {}", step.id);
            }
        }

        let mut forward_edges: Vec<Vec<StepIndex>> = vec![Vec::new(); steps.len()];
        let mut reverse_edges: Vec<Vec<StepIndex>> = vec![Vec::new(); steps.len()];

        for (to_idx, step) in steps.iter().enumerate() {
            for dep in &step.dependencies {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown dependency '{}' in step '{}': no step with that id exists",
                        dep,
                        step.id
                    )
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = StepGraph {
            ids: steps.iter().map(|s| s.id.clone()).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<StepIndex> {
        self.index_map.get(id).copied()
    }

    pub fn id(&self, index: StepIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn dependents(&self, index: StepIndex) -> &[StepIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies(&self, index: StepIndex) -> &[StepIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Steps with no dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .filter_map(|(i, _)| self.id(i))
            .collect()
    }

    /// Every step downstream of `id`, excluding `id` itself.
    pub fn downstream_of(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(start) = self.index_of(id) else {
            return seen;
        };
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &next in self.dependents(node) {
                if let Some(next_id) = self.id(next)
                    && seen.insert(next_id.to_string())
                {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Group steps into waves: every step in wave N depends only on steps in
    /// earlier waves. Used for `workflow check` output.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut current: Vec<StepIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut waves = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in self.dependents(node) {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            waves.push(
                current
                    .iter()
                    .filter_map(|&i| self.id(i).map(str::to_string))
                    .collect(),
            );
            current = next;
        }
        waves
    }

    fn validate_no_cycles(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<StepIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.len() {
            let cycle: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| self.id(i))
                .collect();
            bail!("Cycle detected in step dependencies. Involved steps: {:?}", cycle);
        }
        Ok(())
    }
}
