//! Step implementations and their registry.
//!
//! A workflow document names a step *kind*; the [`StepRegistry`] maps kinds to
//! implementations registered up front. There is no runtime discovery.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use uuid::Uuid;

use super::dag::StepDefinition;
use crate::error::{StoreError, StoreResult};
use crate::store::ExperimentStore;

/// What a step sees while it runs.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    /// Step name within the workflow
    pub step_name: &'a str,
    /// Parameters from the step definition
    pub parameters: &'a Value,
    /// Id of the current engine run
    pub run_id: Uuid,
}

/// A unit of work operating on an experiment store.
pub trait Step: Send + Sync {
    /// Products this step requires by default.
    fn inputs(&self) -> Vec<String>;

    /// Products this step produces by default.
    fn outputs(&self) -> Vec<String>;

    /// Extra precondition check beyond input availability.
    fn can_run(&self, _store: &ExperimentStore, _parameters: &Value) -> bool {
        true
    }

    /// Do the work. Returns an optional message for the execution log.
    fn execute(
        &self,
        store: &mut ExperimentStore,
        ctx: &StepContext<'_>,
    ) -> anyhow::Result<Option<String>>;
}

type StepFn =
    dyn Fn(&mut ExperimentStore, &StepContext<'_>) -> anyhow::Result<Option<String>> + Send + Sync;

/// A step backed by a closure.
pub struct FnStep {
    inputs: Vec<String>,
    outputs: Vec<String>,
    run: Box<StepFn>,
}

impl FnStep {
    /// Wrap a closure with declared inputs and outputs.
    pub fn new<F>(inputs: &[&str], outputs: &[&str], run: F) -> Self
    where
        F: Fn(&mut ExperimentStore, &StepContext<'_>) -> anyhow::Result<Option<String>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            run: Box::new(run),
        }
    }
}

impl Step for FnStep {
    fn inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn execute(
        &self,
        store: &mut ExperimentStore,
        ctx: &StepContext<'_>,
    ) -> anyhow::Result<Option<String>> {
        (self.run)(store, ctx)
    }
}

/// Kind name to implementation table.
#[derive(Default)]
pub struct StepRegistry {
    steps: BTreeMap<String, Box<dyn Step>>,
}

impl StepRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation. Re-registering a kind is a duplicate.
    pub fn register(&mut self, kind: impl Into<String>, step: Box<dyn Step>) -> StoreResult<()> {
        let kind = kind.into();
        if self.steps.contains_key(&kind) {
            return Err(StoreError::Duplicate {
                entity: "step kind",
                detail: kind,
            });
        }
        self.steps.insert(kind, step);
        Ok(())
    }

    /// Implementation for a kind.
    pub fn get(&self, kind: &str) -> StoreResult<&dyn Step> {
        self.steps
            .get(kind)
            .map(|step| step.as_ref())
            .ok_or_else(|| StoreError::UnknownStepKind(kind.to_string()))
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> BTreeSet<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    /// A step definition using the kind's declared inputs and outputs.
    pub fn definition(&self, name: &str, kind: &str) -> StoreResult<StepDefinition> {
        let step = self.get(kind)?;
        Ok(StepDefinition::new(name, kind)
            .inputs(step.inputs())
            .outputs(step.outputs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(inputs: &[&str], outputs: &[&str]) -> Box<dyn Step> {
        Box::new(FnStep::new(inputs, outputs, |_, _| Ok(None)))
    }

    #[test]
    fn definitions_use_declared_io() {
        let mut registry = StepRegistry::new();
        registry
            .register("segment", noop(&["images"], &["labels", "cells"]))
            .unwrap();

        let definition = registry.definition("seg_dapi", "segment").unwrap();
        assert_eq!(definition.kind, "segment");
        assert_eq!(definition.inputs, vec!["images"]);
        assert_eq!(definition.outputs, vec!["labels", "cells"]);
    }

    #[test]
    fn unknown_and_duplicate_kinds_are_errors() {
        let mut registry = StepRegistry::new();
        registry.register("import", noop(&[], &["images"])).unwrap();
        assert!(matches!(
            registry.register("import", noop(&[], &[])),
            Err(StoreError::Duplicate { .. })
        ));
        assert!(matches!(
            registry.get("export"),
            Err(StoreError::UnknownStepKind(kind)) if kind == "export"
        ));
        assert_eq!(registry.kinds().into_iter().collect::<Vec<_>>(), vec!["import"]);
    }
}
