//! Plans and dependency validation.
//!
//! A plan is validated before any step runs: duplicate step ids, unknown
//! dependency ids, and cycles are rejected up front, with the offending
//! cycle named, so a defective plan never reaches the executor.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::SchedulingError;

/// One plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    /// Files this step expects to touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Relative cost estimate, planner-defined units.
    #[serde(default)]
    pub estimated_cost: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            files: Vec::new(),
            estimated_cost: 0,
            depends_on: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

/// Dependency-annotated plan produced by the planner delegate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validate the dependency graph: non-empty, unique step ids, every
    /// dependency id known, no cycles. Returns a topological order as
    /// evidence.
    pub fn validate(&self) -> Result<Vec<String>, SchedulingError> {
        if self.steps.is_empty() {
            return Err(SchedulingError::EmptyPlan);
        }

        let mut ids: HashSet<&str> = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(SchedulingError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(SchedulingError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle.
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for &dependent in dependents.get(id).into_iter().flatten() {
                let degree = indegree.get_mut(dependent).expect("known step");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() < self.steps.len() {
            let stuck: HashSet<&str> = indegree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(&id, _)| id)
                .collect();
            return Err(SchedulingError::CyclicDependency {
                cycle: self.extract_cycle(&stuck),
            });
        }
        Ok(order)
    }

    /// Walk dependencies inside the stuck set until a step repeats, then
    /// report the closed walk `a -> ... -> a`.
    fn extract_cycle(&self, stuck: &HashSet<&str>) -> Vec<String> {
        let start = self
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .find(|id| stuck.contains(id))
            .expect("stuck set is non-empty");

        let mut path = vec![start];
        let mut seen: HashMap<&str, usize> = HashMap::from([(start, 0)]);
        let mut current = start;

        loop {
            let step = self.step(current).expect("known step");
            let next = step
                .depends_on
                .iter()
                .map(String::as_str)
                .find(|dep| stuck.contains(dep))
                .expect("stuck step has a stuck dependency");

            if let Some(&at) = seen.get(next) {
                let mut cycle: Vec<String> =
                    path[at..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return cycle;
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }

    /// Steps not yet completed whose dependencies are all completed.
    pub fn ready_set(&self, completed: &HashSet<String>) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|step| !completed.contains(&step.id))
            .filter(|step| step.depends_on.iter().all(|dep| completed.contains(dep)))
            .collect()
    }
}
