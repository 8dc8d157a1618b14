//! Declarative workflow documents.
//!
//! TOML form:
//!
//! ```toml
//! name = "standard"
//!
//! [[steps]]
//! name = "import"
//! kind = "import"
//!
//! [[steps]]
//! name = "segment"
//! kind = "segment"
//! parameters = { model = "cyto3", diameter = 30 }
//!
//! [[edges]]
//! from = "import"
//! to = "segment"
//! ```
//!
//! Steps that omit `inputs`/`outputs` take them from the registered kind.
//! Edges are optional; producer/consumer edges are added automatically after
//! the explicit ones. JSON documents use the same shape, except that `null`
//! parameter values are rejected because TOML cannot express them.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::dag::{Edge, StepDefinition, WorkflowDag};
use super::step::StepRegistry;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Serialize, Deserialize)]
struct WorkflowDocument {
    name: String,
    #[serde(default)]
    steps: Vec<StepEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    edges: Vec<Edge>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepEntry {
    name: String,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "is_empty_object")]
    parameters: Option<Value>,
}

fn is_empty_object(value: &Option<Value>) -> bool {
    match value {
        None => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Document format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl DocumentFormat {
    /// Format for a path, if its extension is recognized.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(DocumentFormat::Toml),
            "json" => Some(DocumentFormat::Json),
            _ => None,
        }
    }
}

/// Loads and saves [`WorkflowDag`]s.
pub struct WorkflowSerializer<'r> {
    registry: &'r StepRegistry,
}

impl<'r> WorkflowSerializer<'r> {
    /// Serializer filling step I/O from `registry`.
    pub fn new(registry: &'r StepRegistry) -> Self {
        Self { registry }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(&self, text: &str) -> StoreResult<WorkflowDag> {
        self.build(toml::from_str(text)?)
    }

    /// Parse a JSON document.
    pub fn from_json_str(&self, text: &str) -> StoreResult<WorkflowDag> {
        self.build(serde_json::from_str(text)?)
    }

    /// Load a `.toml` or `.json` file.
    pub fn load(&self, path: impl AsRef<Path>) -> StoreResult<WorkflowDag> {
        let path = path.as_ref();
        let format = format_for(path)?;
        let text = fs::read_to_string(path)?;
        let dag = match format {
            DocumentFormat::Toml => self.from_toml_str(&text)?,
            DocumentFormat::Json => self.from_json_str(&text)?,
        };
        info!(path = %path.display(), workflow = dag.name(), steps = dag.len(), "Loaded workflow");
        Ok(dag)
    }

    /// Emit TOML.
    ///
    /// Fails with [`StoreError::InvalidParameters`] if a step carries a
    /// `null` parameter.
    pub fn to_toml_string(&self, dag: &WorkflowDag) -> StoreResult<String> {
        for step in dag.steps() {
            reject_null(&step.name, &step.parameters)?;
        }
        Ok(toml::to_string_pretty(&document(dag))?)
    }

    /// Emit pretty JSON.
    pub fn to_json_string(&self, dag: &WorkflowDag) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(&document(dag))?)
    }

    /// Write a `.toml` or `.json` file.
    pub fn save(&self, dag: &WorkflowDag, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        let text = match format_for(path)? {
            DocumentFormat::Toml => self.to_toml_string(dag)?,
            DocumentFormat::Json => self.to_json_string(dag)?,
        };
        fs::write(path, text)?;
        info!(path = %path.display(), workflow = dag.name(), "Saved workflow");
        Ok(())
    }

    fn build(&self, doc: WorkflowDocument) -> StoreResult<WorkflowDag> {
        let mut dag = WorkflowDag::new(doc.name);
        for entry in doc.steps {
            let mut step = StepDefinition::new(entry.name, entry.kind);
            if entry.inputs.is_none() || entry.outputs.is_none() {
                let registered = self.registry.get(&step.kind)?;
                step.inputs = entry.inputs.unwrap_or_else(|| registered.inputs());
                step.outputs = entry.outputs.unwrap_or_else(|| registered.outputs());
            } else {
                step.inputs = entry.inputs.unwrap_or_default();
                step.outputs = entry.outputs.unwrap_or_default();
            }
            if let Some(parameters) = entry.parameters {
                reject_null(&step.name, &parameters)?;
                step.parameters = parameters;
            }
            dag.add_step(step)?;
        }
        for edge in &doc.edges {
            dag.connect(&edge.from, &edge.to)?;
        }
        let added = dag.auto_connect();
        debug!(workflow = dag.name(), explicit = doc.edges.len(), added, "Connected workflow");
        Ok(dag)
    }
}

fn reject_null(step: &str, parameters: &Value) -> StoreResult<()> {
    match null_path(parameters, "parameters") {
        Some(path) => Err(StoreError::InvalidParameters {
            context: format!("step '{step}'"),
            reason: format!("{path} is null"),
        }),
        None => Ok(()),
    }
}

/// Dotted path of the first `null` inside `value`.
fn null_path(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::Null => Some(path.to_string()),
        Value::Object(map) => map
            .iter()
            .find_map(|(key, value)| null_path(value, &format!("{path}.{key}"))),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(index, value)| null_path(value, &format!("{path}[{index}]"))),
        _ => None,
    }
}

fn format_for(path: &Path) -> StoreResult<DocumentFormat> {
    DocumentFormat::from_path(path).ok_or_else(|| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unrecognized workflow file extension: {}", path.display()),
        ))
    })
}

fn document(dag: &WorkflowDag) -> WorkflowDocument {
    WorkflowDocument {
        name: dag.name().to_string(),
        steps: dag
            .steps()
            .iter()
            .map(|step| StepEntry {
                name: step.name.clone(),
                kind: step.kind.clone(),
                inputs: Some(step.inputs.clone()),
                outputs: Some(step.outputs.clone()),
                parameters: Some(step.parameters.clone()),
            })
            .collect(),
        edges: dag.edges().to_vec(),
    }
}
