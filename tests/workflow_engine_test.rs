//! Workflow engine integration tests
//!
//! Runs small import/segment/measure pipelines built from closure steps
//! against a real experiment store and checks scheduling, skip-if-done
//! re-runs, failure isolation and the persisted execution history.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use cytostore::analysis::PluginRegistry;
use cytostore::config::Settings;
use cytostore::store::{
    BoundingBox, CellFilter, ChannelSpec, ExperimentStore, FovCoord, MeasurementRecord, NewCell,
};
use cytostore::workflow::{
    DagIssue, ExecutionStatus, FailureKind, FnStep, StepDefinition, StepOutcome, StepRegistry,
    WorkflowDag, WorkflowEngine, WorkflowSerializer, WorkflowState,
};
use cytostore::StoreError;
use ndarray::Array2;
use tempfile::TempDir;

// =============================================================================
// Test Pipeline
// =============================================================================

fn coord() -> FovCoord {
    FovCoord::new("control", "FOV_1")
}

fn new_store() -> (TempDir, ExperimentStore) {
    let dir = TempDir::new().unwrap();
    let mut store = ExperimentStore::create(dir.path(), &Settings::default()).unwrap();
    store.add_bio_rep("N1").unwrap();
    store
        .add_channel(&ChannelSpec::new("DAPI").segmentation(true))
        .unwrap();
    (dir, store)
}

/// Step kinds for a tiny threshold-based pipeline.
///
/// `segment` fails while `fail_segment` is set. `calls` counts every executed step.
fn pipeline_registry(fail_segment: &Arc<AtomicBool>, calls: &Arc<AtomicUsize>) -> StepRegistry {
    let mut registry = StepRegistry::new();

    let counter = Arc::clone(calls);
    registry
        .register(
            "import",
            Box::new(FnStep::new(&[], &["fovs", "images"], move |store, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                if store.resolve_fov(&coord()).is_err() {
                    store.add_fov(&coord(), Some(0.5))?;
                }
                let image = Array2::from_shape_fn((64, 64), |(r, c)| {
                    if (16..32).contains(&r) && (16..32).contains(&c) {
                        4000u16
                    } else {
                        100
                    }
                });
                store.write_image(&coord(), "DAPI", &image)?;
                Ok(None)
            })),
        )
        .unwrap();

    let counter = Arc::clone(calls);
    let fail = Arc::clone(fail_segment);
    registry
        .register(
            "segment",
            Box::new(FnStep::new(
                &["images"],
                &["labels", "cells", "segmentation_runs"],
                move |store, ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if fail.load(Ordering::SeqCst) {
                        return Err(anyhow!("model weights not found"))
                            .context("loading segmentation model");
                    }
                    let image = store.read_image::<u16>(&coord(), "DAPI")?;
                    let labels = image.mapv(|v| u32::from(v > 1000));
                    store.write_labels(&coord(), "DAPI", &labels)?;
                    let run = store.add_segmentation_run(&coord(), "DAPI", "threshold", ctx.parameters)?;
                    let area = labels.iter().filter(|v| **v == 1).count() as u64;
                    store.add_cells(
                        &coord(),
                        run,
                        &[NewCell {
                            label_value: 1,
                            bbox: BoundingBox {
                                min_row: 16,
                                min_col: 16,
                                max_row: 32,
                                max_col: 32,
                            },
                            centroid: (23.5, 23.5),
                            area,
                        }],
                    )?;
                    Ok(Some(format!("{area} foreground pixels")))
                },
            )),
        )
        .unwrap();

    let counter = Arc::clone(calls);
    registry
        .register(
            "measure",
            Box::new(FnStep::new(
                &["images", "cells"],
                &["measurements"],
                move |store, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let image = store.read_image::<u16>(&coord(), "DAPI")?;
                    let labels = store.read_labels::<u32>(&coord(), "DAPI")?;
                    let mut records = Vec::new();
                    for cell in store.get_cells(&CellFilter::default())? {
                        let (sum, count) = image
                            .iter()
                            .zip(labels.iter())
                            .filter(|(_, label)| i64::from(**label) == cell.label_value)
                            .fold((0.0, 0u64), |(sum, n), (v, _)| (sum + f64::from(*v), n + 1));
                        records.push(MeasurementRecord::new(
                            cell.id,
                            "DAPI",
                            "mean_intensity",
                            sum / count.max(1) as f64,
                        ));
                    }
                    store.add_measurements(&records)?;
                    Ok(None)
                },
            )),
        )
        .unwrap();

    let counter = Arc::clone(calls);
    registry
        .register(
            "qc",
            Box::new(FnStep::new(&["images"], &[], move |store, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                let image = store.read_image::<u16>(&coord(), "DAPI")?;
                let saturated = image.iter().filter(|v| **v == u16::MAX).count();
                Ok(Some(format!("{saturated} saturated pixels")))
            })),
        )
        .unwrap();

    registry
}

fn standard_dag(registry: &StepRegistry) -> WorkflowDag {
    let mut dag = WorkflowDag::new("standard");
    for name in ["import", "segment", "measure"] {
        dag.add_step(registry.definition(name, name).unwrap()).unwrap();
    }
    dag.auto_connect();
    dag
}

// =============================================================================
// Graph validation
// =============================================================================

#[test]
fn three_step_graph_orders_and_detects_cycle() {
    let mut dag = WorkflowDag::new("standard");
    dag.add_step(StepDefinition::new("import", "import").outputs(["images"]))
        .unwrap();
    dag.add_step(
        StepDefinition::new("segment", "segment")
            .inputs(["images"])
            .outputs(["cells"]),
    )
    .unwrap();
    dag.add_step(StepDefinition::new("measure", "measure").inputs(["cells"]))
        .unwrap();
    dag.connect("import", "segment").unwrap();
    dag.connect("segment", "measure").unwrap();

    assert!(dag.validate().is_empty());
    assert_eq!(
        dag.execution_order().unwrap(),
        vec!["import", "segment", "measure"]
    );

    dag.connect("measure", "import").unwrap();
    let issues = dag.validate();
    assert!(issues
        .iter()
        .any(|issue| matches!(issue, DagIssue::Cycle { .. })));
    assert!(matches!(
        dag.execution_order(),
        Err(StoreError::DagValidation(_))
    ));
}

#[test]
fn invalid_graph_is_rejected_before_any_write() {
    let (_dir, mut store) = new_store();
    let fail = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = pipeline_registry(&fail, &calls);

    let mut dag = WorkflowDag::new("broken");
    dag.add_step(registry.definition("measure", "measure").unwrap())
        .unwrap();

    let before = store.total_changes().unwrap();
    let err = WorkflowEngine::new(&registry)
        .run(&dag, &mut store)
        .unwrap_err();
    match err {
        StoreError::DagValidation(issues) => {
            assert!(issues
                .iter()
                .any(|issue| matches!(issue, DagIssue::UnmetInput { input, .. } if input == "images")));
        }
        other => panic!("expected DagValidation, got {other:?}"),
    }
    assert_eq!(store.total_changes().unwrap(), before);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Execution
// =============================================================================

#[test]
fn rerun_of_completed_workflow_only_writes_skip_records() {
    let (_dir, mut store) = new_store();
    let fail = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = pipeline_registry(&fail, &calls);
    let dag = standard_dag(&registry);
    let engine = WorkflowEngine::new(&registry);

    let first = engine.run(&dag, &mut store).unwrap();
    assert_eq!(first.steps_completed(), 3);
    assert!(first.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let pivot = store.get_measurement_pivot(&Default::default()).unwrap();
    assert_eq!(pivot.rows.len(), 1);
    assert_eq!(pivot.rows[0].values, vec![Some(4000.0)]);

    let before = store.total_changes().unwrap();
    let second = engine.run(&dag, &mut store).unwrap();
    assert_eq!(second.steps_skipped(), second.total_steps());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.total_changes().unwrap() - before, 3);
    assert_ne!(first.run_id, second.run_id);

    let history = WorkflowState::new(&store).get_step_history("segment").unwrap();
    let statuses: Vec<_> = history.iter().map(|row| row.status).collect();
    assert_eq!(
        statuses,
        vec![ExecutionStatus::Completed, ExecutionStatus::Skipped]
    );
    assert_eq!(history[0].message.as_deref(), Some("256 foreground pixels"));
}

#[test]
fn adding_a_step_runs_only_the_new_step() {
    let (_dir, mut store) = new_store();
    let fail = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = pipeline_registry(&fail, &calls);
    PluginRegistry::with_builtins()
        .register_steps(&mut registry)
        .unwrap();

    let engine = WorkflowEngine::new(&registry);
    engine.run(&standard_dag(&registry), &mut store).unwrap();

    let mut extended = standard_dag(&registry);
    extended
        .add_step(registry.definition("morphology", "cell_morphology").unwrap())
        .unwrap();
    extended.auto_connect();

    let report = engine.run(&extended, &mut store).unwrap();
    assert_eq!(report.steps_skipped(), 3);
    assert_eq!(report.steps_completed(), 1);
    assert!(matches!(
        report.step("morphology").unwrap().outcome,
        StepOutcome::Completed { .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let runs = store.list_analysis_runs(Some("cell_morphology")).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].cell_count, 1);
    assert_eq!(runs[0].result["fovs"][0]["mean_area"], 256.0);
}

#[test]
fn failure_blocks_dependents_but_not_independent_branches() {
    let (_dir, mut store) = new_store();
    let fail = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = pipeline_registry(&fail, &calls);
    let mut dag = standard_dag(&registry);
    dag.add_step(registry.definition("qc", "qc").unwrap()).unwrap();
    dag.auto_connect();
    let engine = WorkflowEngine::new(&registry);

    let report = engine.run(&dag, &mut store).unwrap();
    assert_eq!(report.steps_completed(), 2);
    assert_eq!(report.steps_failed(), 1);
    assert_eq!(report.steps_blocked(), 1);
    assert!(!report.is_success());
    assert_eq!(
        report.step("measure").unwrap().outcome,
        StepOutcome::Blocked {
            dependency: "segment".to_string()
        }
    );
    match &report.step("segment").unwrap().outcome {
        StepOutcome::Failed { kind, message } => {
            assert_eq!(*kind, FailureKind::Step);
            assert_eq!(message, "loading segmentation model");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let state = WorkflowState::new(&store);
    let failed = state.last_run("segment").unwrap().unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed
        .detail
        .as_deref()
        .unwrap()
        .contains("model weights not found"));
    assert!(state.get_step_history("measure").unwrap().is_empty());

    // Fixing the step re-runs it and its dependents; the finished branch is skipped
    fail.store(false, Ordering::SeqCst);
    let report = engine.run(&dag, &mut store).unwrap();
    assert!(report.is_success());
    assert!(matches!(
        report.step("import").unwrap().outcome,
        StepOutcome::Skipped
    ));
    assert!(matches!(
        report.step("qc").unwrap().outcome,
        StepOutcome::Skipped
    ));
    assert!(matches!(
        report.step("segment").unwrap().outcome,
        StepOutcome::Completed { .. }
    ));
    assert!(matches!(
        report.step("measure").unwrap().outcome,
        StepOutcome::Completed { .. }
    ));
}

#[test]
fn workflow_document_drives_the_engine() {
    let (dir, mut store) = new_store();
    let fail = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = pipeline_registry(&fail, &calls);
    let serializer = WorkflowSerializer::new(&registry);

    let dag = serializer
        .from_toml_str(
            r#"
name = "standard"

[[steps]]
name = "import"
kind = "import"

[[steps]]
name = "segment"
kind = "segment"
parameters = { threshold = 1000 }

[[steps]]
name = "measure"
kind = "measure"
"#,
        )
        .unwrap();

    let path = dir.path().join("standard.json");
    serializer.save(&dag, &path).unwrap();
    let reloaded = serializer.load(&path).unwrap();
    assert_eq!(
        reloaded.execution_order().unwrap(),
        dag.execution_order().unwrap()
    );

    let report = WorkflowEngine::new(&registry)
        .run(&reloaded, &mut store)
        .unwrap();
    assert_eq!(report.steps_completed(), 3);
    assert_eq!(
        store.list_segmentation_runs(&coord()).unwrap()[0].parameters["threshold"],
        1000
    );
}

#[test]
fn reordered_parameters_from_another_document_are_skipped() {
    let (_dir, mut store) = new_store();
    let fail = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = pipeline_registry(&fail, &calls);
    let serializer = WorkflowSerializer::new(&registry);
    let engine = WorkflowEngine::new(&registry);

    let from_toml = serializer
        .from_toml_str(
            r#"
name = "standard"

[[steps]]
name = "import"
kind = "import"

[[steps]]
name = "segment"
kind = "segment"
parameters = { threshold = 1000, model = { name = "cyto3", diameter = 30 } }

[[steps]]
name = "measure"
kind = "measure"
"#,
        )
        .unwrap();
    assert_eq!(engine.run(&from_toml, &mut store).unwrap().steps_completed(), 3);

    let from_json = serializer
        .from_json_str(
            r#"{
  "name": "standard",
  "steps": [
    {"name": "import", "kind": "import"},
    {"name": "segment", "kind": "segment",
     "parameters": {"model": {"diameter": 30, "name": "cyto3"}, "threshold": 1000}},
    {"name": "measure", "kind": "measure"}
  ]
}"#,
        )
        .unwrap();
    let report = engine.run(&from_json, &mut store).unwrap();
    assert_eq!(report.steps_skipped(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
