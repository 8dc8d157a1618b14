//! Statically registered analysis plugins.
//!
//! An [`AnalysisPlugin`] declares the channels it needs, checks its
//! preconditions against a store, and returns a structured
//! [`AnalysisResult`]. Plugins are registered by name in a
//! [`PluginRegistry`]; there is no runtime discovery. Each plugin can be
//! exposed to workflows through [`AnalysisStep`], which records the result as
//! an analysis run.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::store::{CellFilter, ExperimentStore, FovFilter};
use crate::workflow::{Step, StepContext, StepRegistry};

/// Structured output of a plugin run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    /// Plugin-specific summary, stored verbatim
    pub summary: Value,
    /// Number of cells the analysis covered
    pub cell_count: u64,
}

/// A named analysis routine over store contents.
pub trait AnalysisPlugin: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Channels that must be declared in the store.
    fn required_channels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Check parameters and store contents before running.
    fn validate(&self, store: &ExperimentStore, parameters: &Value) -> StoreResult<()>;

    /// Run the analysis. Does not record anything in the store.
    fn run(&self, store: &ExperimentStore, parameters: &Value) -> anyhow::Result<AnalysisResult>;
}

/// Name to plugin table.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn AnalysisPlugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.plugins.insert(
            CellMorphology::NAME.to_string(),
            Arc::new(CellMorphology),
        );
        registry
    }

    /// Add a plugin under its own name.
    pub fn register(&mut self, plugin: Arc<dyn AnalysisPlugin>) -> StoreResult<()> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(StoreError::Duplicate {
                entity: "analysis plugin",
                detail: name,
            });
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Plugin registered as `name`.
    pub fn get(&self, name: &str) -> StoreResult<Arc<dyn AnalysisPlugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownPlugin(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    /// Validate, run and record one plugin outside of a workflow.
    pub fn run(
        &self,
        name: &str,
        store: &mut ExperimentStore,
        parameters: &Value,
    ) -> anyhow::Result<i64> {
        let plugin = self.get(name)?;
        execute_plugin(plugin.as_ref(), store, parameters)
    }

    /// Register every plugin as a workflow step kind of the same name.
    pub fn register_steps(&self, steps: &mut StepRegistry) -> StoreResult<()> {
        for (name, plugin) in &self.plugins {
            steps.register(name.clone(), Box::new(AnalysisStep::new(Arc::clone(plugin))))?;
        }
        Ok(())
    }
}

fn execute_plugin(
    plugin: &dyn AnalysisPlugin,
    store: &mut ExperimentStore,
    parameters: &Value,
) -> anyhow::Result<i64> {
    plugin.validate(store, parameters)?;
    let result = plugin
        .run(store, parameters)
        .with_context(|| format!("analysis plugin '{}' failed", plugin.name()))?;
    let id = store.add_analysis_run(
        plugin.name(),
        None,
        parameters,
        &result.summary,
        result.cell_count,
    )?;
    info!(plugin = plugin.name(), id, cells = result.cell_count, "Analysis complete");
    Ok(id)
}

/// Workflow adapter for an analysis plugin.
pub struct AnalysisStep {
    plugin: Arc<dyn AnalysisPlugin>,
}

impl AnalysisStep {
    /// Wrap a plugin.
    pub fn new(plugin: Arc<dyn AnalysisPlugin>) -> Self {
        Self { plugin }
    }
}

impl Step for AnalysisStep {
    fn inputs(&self) -> Vec<String> {
        vec!["cells".to_string()]
    }

    fn outputs(&self) -> Vec<String> {
        vec!["analysis_runs".to_string()]
    }

    fn can_run(&self, store: &ExperimentStore, _parameters: &Value) -> bool {
        let Ok(channels) = store.list_channels() else {
            return false;
        };
        self.plugin
            .required_channels()
            .iter()
            .all(|required| channels.iter().any(|channel| &channel.name == required))
    }

    fn execute(
        &self,
        store: &mut ExperimentStore,
        ctx: &StepContext<'_>,
    ) -> anyhow::Result<Option<String>> {
        let id = execute_plugin(self.plugin.as_ref(), store, ctx.parameters)?;
        Ok(Some(format!("analysis run {id}")))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MorphologyParams {
    bio_rep: Option<String>,
    condition: Option<String>,
    timepoint: Option<String>,
    #[serde(default)]
    min_area: u64,
}

impl MorphologyParams {
    fn parse(parameters: &Value) -> StoreResult<Self> {
        if parameters.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(parameters.clone()).map_err(|err| StoreError::InvalidParameters {
            context: CellMorphology::NAME.to_string(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct FovMorphology {
    fov_id: i64,
    bio_rep: String,
    condition: String,
    timepoint: Option<String>,
    fov: String,
    cell_count: u64,
    mean_area: f64,
    min_area: u64,
    max_area: u64,
}

/// Per-FOV cell counts and area statistics over current cells.
///
/// Parameters (all optional): `bio_rep`, `condition` and `timepoint` narrow
/// the FOVs considered; `min_area` drops smaller cells before summarising.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellMorphology;

impl CellMorphology {
    /// Registry name.
    pub const NAME: &'static str = "cell_morphology";
}

impl AnalysisPlugin for CellMorphology {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn validate(&self, store: &ExperimentStore, parameters: &Value) -> StoreResult<()> {
        MorphologyParams::parse(parameters)?;
        if store.count_cells(&CellFilter::default())? == 0 {
            return Err(StoreError::InvalidParameters {
                context: Self::NAME.to_string(),
                reason: "store holds no cells to analyse".to_string(),
            });
        }
        Ok(())
    }

    fn run(&self, store: &ExperimentStore, parameters: &Value) -> anyhow::Result<AnalysisResult> {
        let params = MorphologyParams::parse(parameters)?;

        let mut fov_filter = FovFilter::default();
        let mut cell_filter = CellFilter::default();
        if let Some(bio_rep) = &params.bio_rep {
            fov_filter = fov_filter.bio_rep(bio_rep);
            cell_filter = cell_filter.bio_rep(bio_rep);
        }
        if let Some(condition) = &params.condition {
            fov_filter = fov_filter.condition(condition);
            cell_filter = cell_filter.condition(condition);
        }
        if let Some(timepoint) = &params.timepoint {
            fov_filter = fov_filter.timepoint(timepoint);
            cell_filter = cell_filter.timepoint(timepoint);
        }

        let mut areas: BTreeMap<i64, Vec<u64>> = BTreeMap::new();
        for cell in store.get_cells(&cell_filter)? {
            if cell.area >= params.min_area {
                areas.entry(cell.fov_id).or_default().push(cell.area);
            }
        }

        let mut per_fov = Vec::new();
        let mut total = 0u64;
        for fov in store.list_fovs(&fov_filter)? {
            let Some(fov_areas) = areas.get(&fov.fov_id) else {
                continue;
            };
            let count = fov_areas.len() as u64;
            let sum: u64 = fov_areas.iter().sum();
            total += count;
            per_fov.push(FovMorphology {
                fov_id: fov.fov_id,
                bio_rep: fov.bio_rep,
                condition: fov.condition,
                timepoint: fov.timepoint,
                fov: fov.fov,
                cell_count: count,
                mean_area: sum as f64 / count as f64,
                min_area: fov_areas.iter().copied().min().unwrap_or(0),
                max_area: fov_areas.iter().copied().max().unwrap_or(0),
            });
        }

        Ok(AnalysisResult {
            summary: json!({
                "total_cells": total,
                "min_area": params.min_area,
                "fovs": per_fov,
            }),
            cell_count: total,
        })
    }
}
