//! Step dependency graph.
//!
//! A sequence stores its steps as a flat list with `depends_on` name
//! references. `StepGraph` turns that into an arena of steps with index-based
//! edges, proves it acyclic (Kahn's algorithm) and groups the steps into
//! execution waves: wave 0 holds every step with no dependencies, wave k holds
//! every step whose deepest dependency sits in wave k-1.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{FleetError, Result};
use crate::sequence::{SequenceDefinition, Step};

#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    wave_of: Vec<usize>,
    waves: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Build and validate the graph for a definition.
    pub fn build(def: &SequenceDefinition) -> Result<Self> {
        let mut index = HashMap::with_capacity(def.steps.len());
        for (i, step) in def.steps.iter().enumerate() {
            if index.insert(step.name().to_string(), i).is_some() {
                return Err(FleetError::DuplicateStep {
                    sequence: def.sequence_key.clone(),
                    step: step.name().to_string(),
                });
            }
        }

        let n = def.steps.len();
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, step) in def.steps.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut edges = Vec::with_capacity(step.depends_on.len());
            for dep in &step.depends_on {
                let &d = index
                    .get(dep.as_str())
                    .ok_or_else(|| FleetError::UnknownDependency {
                        sequence: def.sequence_key.clone(),
                        step: step.name().to_string(),
                        dependency: dep.clone(),
                    })?;
                if seen.insert(d) {
                    edges.push(d);
                    dependents[d].push(i);
                }
            }
            deps.push(edges);
        }

        // Kahn's algorithm; levels double as wave numbers.
        let mut indegree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
        let mut wave_of = vec![0usize; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0usize;

        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &next in &dependents[i] {
                wave_of[next] = wave_of[next].max(wave_of[i] + 1);
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited != n {
            let steps = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| def.steps[i].name().to_string())
                .collect();
            return Err(FleetError::CyclicDependency {
                sequence: def.sequence_key.clone(),
                steps,
            });
        }

        let wave_count = wave_of.iter().max().map(|m| m + 1).unwrap_or(0);
        let mut waves = vec![Vec::new(); wave_count];
        for (i, &w) in wave_of.iter().enumerate() {
            waves[w].push(i);
        }

        Ok(Self {
            steps: def.steps.clone(),
            index,
            deps,
            dependents,
            wave_of,
            waves,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, idx: usize) -> &Step {
        &self.steps[idx]
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Wave indices of every step, in definition order.
    pub fn wave_indices(&self) -> &[usize] {
        &self.wave_of
    }

    pub fn wave_of(&self, idx: usize) -> usize {
        self.wave_of[idx]
    }

    /// Step indices grouped by wave; each wave is in definition order.
    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }
}
