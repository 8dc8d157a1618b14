//! Workflow graph model.
//!
//! A [`WorkflowDag`] holds named steps, each declaring the data products it
//! consumes (`inputs`) and produces (`outputs`), and the edges between them.
//! Steps keep their insertion order, which breaks ties in
//! [`WorkflowDag::execution_order`] so the same graph always schedules the
//! same way.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::validation::validate_name;

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step name
    pub name: String,
    /// Registered implementation kind
    pub kind: String,
    /// Data products this step requires
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Data products this step produces
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Step parameters
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    Value::Object(serde_json::Map::new())
}

impl StepDefinition {
    /// A step with no inputs, outputs or parameters.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: empty_parameters(),
        }
    }

    /// Declare inputs.
    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Declare outputs.
    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Set parameters.
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A directed dependency between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream step
    pub from: String,
    /// Downstream step
    pub to: String,
}

/// A problem found by [`WorkflowDag::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagIssue {
    /// These steps lie on at least one cycle
    Cycle {
        /// Steps involved, in insertion order
        steps: Vec<String>,
    },
    /// No upstream step (or existing store content) provides an input
    UnmetInput {
        /// Consuming step
        step: String,
        /// Missing input
        input: String,
    },
    /// Step lies outside the largest connected part of the graph
    Orphan {
        /// Disconnected step
        step: String,
    },
}

impl fmt::Display for DagIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DagIssue::Cycle { steps } => write!(f, "cycle through [{}]", steps.join(" -> ")),
            DagIssue::UnmetInput { step, input } => {
                write!(f, "step '{step}' requires '{input}', which no upstream step produces")
            }
            DagIssue::Orphan { step } => {
                write!(f, "step '{step}' is not connected to the rest of the graph")
            }
        }
    }
}

/// Steps plus edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowDag {
    name: String,
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl WorkflowDag {
    /// An empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in insertion order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Add a step. Names must be unique within the workflow.
    pub fn add_step(&mut self, step: StepDefinition) -> StoreResult<()> {
        validate_name(&step.name)?;
        if self.index.contains_key(&step.name) {
            return Err(StoreError::Duplicate {
                entity: "workflow step",
                detail: step.name,
            });
        }
        self.index.insert(step.name.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    /// Add an explicit edge. Adding an existing edge again is a no-op.
    pub fn connect(&mut self, from: &str, to: &str) -> StoreResult<()> {
        for name in [from, to] {
            if !self.index.contains_key(name) {
                return Err(StoreError::UnknownStep(name.to_string()));
            }
        }
        let edge = Edge {
            from: from.to_string(),
            to: to.to_string(),
        };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        Ok(())
    }

    /// Connect every producer of a named output to every consumer of it.
    ///
    /// Returns the number of edges added.
    pub fn auto_connect(&mut self) -> usize {
        let mut pairs = Vec::new();
        for producer in &self.steps {
            for output in &producer.outputs {
                for consumer in &self.steps {
                    if consumer.name != producer.name && consumer.inputs.contains(output) {
                        pairs.push((producer.name.clone(), consumer.name.clone()));
                    }
                }
            }
        }

        let before = self.edges.len();
        for (from, to) in pairs {
            let edge = Edge { from, to };
            if !self.edges.contains(&edge) {
                self.edges.push(edge);
            }
        }
        self.edges.len() - before
    }

    /// Validate the graph on its own: every input must come from an upstream step.
    pub fn validate(&self) -> Vec<DagIssue> {
        self.validate_against(&BTreeSet::new())
    }

    /// Validate the graph, treating `available` products as already present.
    ///
    /// Reports every finding rather than stopping at the first.
    pub fn validate_against(&self, available: &BTreeSet<String>) -> Vec<DagIssue> {
        let mut issues = Vec::new();

        let cyclic = self.cyclic_steps();
        if !cyclic.is_empty() {
            issues.push(DagIssue::Cycle { steps: cyclic });
        }

        for step in &self.steps {
            let ancestors = self.ancestors(&step.name);
            for input in &step.inputs {
                let produced_upstream = ancestors.iter().any(|ancestor| {
                    self.step(ancestor)
                        .is_some_and(|producer| producer.outputs.contains(input))
                });
                if !produced_upstream && !available.contains(input) {
                    issues.push(DagIssue::UnmetInput {
                        step: step.name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }

        let components = self.components();
        if components.len() > 1 {
            // Largest component is the graph; the earliest one wins a tie.
            let mut main = 0;
            for (index, component) in components.iter().enumerate() {
                if component.len() > components[main].len() {
                    main = index;
                }
            }
            let mut orphans: Vec<usize> = components
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != main)
                .flat_map(|(_, component)| component.iter().copied())
                .collect();
            orphans.sort_unstable();
            issues.extend(orphans.into_iter().map(|index| DagIssue::Orphan {
                step: self.steps[index].name.clone(),
            }));
        }

        issues
    }

    /// Weakly connected components as step indices, each sorted, ordered by
    /// their first step.
    fn components(&self) -> Vec<Vec<usize>> {
        let mut neighbours = vec![Vec::new(); self.steps.len()];
        for edge in &self.edges {
            if let (Some(&from), Some(&to)) = (self.index.get(&edge.from), self.index.get(&edge.to)) {
                neighbours[from].push(to);
                neighbours[to].push(from);
            }
        }

        let mut seen = vec![false; self.steps.len()];
        let mut components = Vec::new();
        for start in 0..self.steps.len() {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut component = vec![start];
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                for &next in &neighbours[node] {
                    if !seen[next] {
                        seen[next] = true;
                        component.push(next);
                        stack.push(next);
                    }
                }
            }
            component.sort_unstable();
            components.push(component);
        }
        components
    }

    /// Topological order, ties broken by insertion order.
    pub fn execution_order(&self) -> StoreResult<Vec<String>> {
        let (order, leftover) = self.kahn();
        if leftover.is_empty() {
            Ok(order)
        } else {
            Err(StoreError::DagValidation(vec![DagIssue::Cycle {
                steps: leftover,
            }]))
        }
    }

    /// Steps whose inputs are all present in `available`.
    ///
    /// Depends only on current store content, not on execution history.
    pub fn steps_ready(&self, available: &BTreeSet<String>) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| step.inputs.iter().all(|input| available.contains(input)))
            .map(|step| step.name.as_str())
            .collect()
    }

    /// Direct upstream steps of `name`, in edge order.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|edge| edge.to == name)
            .map(|edge| edge.from.as_str())
            .collect()
    }

    /// Every step from which `name` is reachable.
    pub fn ancestors(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.dependencies(name).into_iter().collect();
        while let Some(current) = queue.pop_front() {
            if seen.insert(current.to_string()) {
                queue.extend(self.dependencies(current));
            }
        }
        seen.remove(name);
        seen
    }

    fn kahn(&self) -> (Vec<String>, Vec<String>) {
        let mut in_degree = vec![0usize; self.steps.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for edge in &self.edges {
            if let (Some(&from), Some(&to)) = (self.index.get(&edge.from), self.index.get(&edge.to)) {
                successors[from].push(to);
                in_degree[to] += 1;
            }
        }

        // Smallest insertion index first
        let mut ready: BTreeSet<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &succ in &successors[next] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }

        let placed: HashSet<usize> = order.iter().copied().collect();
        let leftover = (0..self.steps.len())
            .filter(|i| !placed.contains(i))
            .map(|i| self.steps[i].name.clone())
            .collect();
        let order = order.into_iter().map(|i| self.steps[i].name.clone()).collect();
        (order, leftover)
    }

    /// Steps on a cycle, in insertion order.
    ///
    /// Kahn's leftover also contains steps merely downstream of a cycle, so
    /// keep only those that can reach themselves.
    fn cyclic_steps(&self) -> Vec<String> {
        let (_, leftover) = self.kahn();
        leftover
            .into_iter()
            .filter(|name| self.ancestors_including_self(name))
            .collect()
    }

    fn ancestors_including_self(&self, name: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.dependencies(name).into_iter().collect();
        while let Some(current) = queue.pop_front() {
            if current == name {
                return true;
            }
            if seen.insert(current) {
                queue.extend(self.dependencies(current));
            }
        }
        false
    }
}
