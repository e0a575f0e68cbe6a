//! Parameter-sweep benchmark harness.
//!
//! A sweep config is expanded into instances ([`Expander`]), each instance
//! runs the solver binary under a timeout wrapper in its own process group
//! ([`InstanceRunner`]), a bounded pool dispatches them ([`Scheduler`]), and
//! the outcomes are collected ([`RunReport`]) and persisted with version
//! control provenance ([`write_run_record`]).

pub mod config;
pub mod error;
pub mod expand;
pub mod process;
pub mod record;
pub mod report;
pub mod runner;
pub mod scheduler;

pub use config::{
    load_sweep_spec, parse_sweep_spec, AgentCounts, PerSolverAgents, SolverSweep, SweepSpec,
};
pub use error::{RunnerError, SweepError};
pub use expand::{render_value, Expander, InstanceParams};
pub use process::ScopedProcess;
pub use record::{write_run_record, ResolvedConfig, RunRecord};
pub use report::{ReportRow, RunReport};
pub use runner::{Dispatch, InstanceRunner, RunOutcome, RunStatus, RunnerConfig};
pub use scheduler::{Execute, ProgressCounter, Scheduler, SweepPlan};
pub use sweep_provenance::{GitCheckout, Provenance, ProvenanceSource};

use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct SweepOverrides {
    pub label: Option<String>,
    pub binary: Option<PathBuf>,
    pub maps_dir: Option<PathBuf>,
    pub max_workers: Option<usize>,
}

/// A spec with overrides applied and its instances expanded, ready to run.
#[derive(Debug, Clone)]
pub struct PreparedSweep {
    pub spec: SweepSpec,
    pub instances: Vec<InstanceParams>,
    pub plan: SweepPlan,
}

pub struct SweepResult {
    pub plan: SweepPlan,
    pub report: RunReport,
    pub record: RunRecord,
}

pub fn prepare_sweep_file(
    path: &Path,
    overrides: &SweepOverrides,
) -> Result<PreparedSweep, SweepError> {
    prepare_sweep(load_sweep_spec(path)?, overrides)
}

/// Applies overrides and expands. Every configuration error surfaces here,
/// before anything is launched.
pub fn prepare_sweep(
    mut spec: SweepSpec,
    overrides: &SweepOverrides,
) -> Result<PreparedSweep, SweepError> {
    if let Some(label) = &overrides.label {
        spec.label = Some(label.clone());
    }
    if let Some(binary) = &overrides.binary {
        spec.binary = Some(binary.clone());
    }
    if let Some(maps_dir) = &overrides.maps_dir {
        spec.maps_dir = Some(maps_dir.clone());
    }
    if let Some(max_workers) = overrides.max_workers {
        spec.max_workers = max_workers;
    }
    spec.validate()?;

    let instances = Expander::new(spec.maps_dir_path()).expand(&spec)?;
    let plan = Scheduler::new(spec.max_workers).plan(&instances);
    info!(
        "Running {} instances across {} workers",
        plan.instances, plan.max_workers
    );
    Ok(PreparedSweep {
        spec,
        instances,
        plan,
    })
}

/// Runs every instance, then writes the run record.
pub fn execute_sweep(
    prepared: &PreparedSweep,
    provenance: &dyn ProvenanceSource,
) -> Result<SweepResult, SweepError> {
    execute_sweep_with(
        prepared,
        &InstanceRunner::new(RunnerConfig::from_spec(&prepared.spec)),
        provenance,
    )
}

pub fn execute_sweep_with<E: Execute>(
    prepared: &PreparedSweep,
    executor: &E,
    provenance: &dyn ProvenanceSource,
) -> Result<SweepResult, SweepError> {
    let started = Instant::now();
    let counter = ProgressCounter::new();
    let results = Scheduler::new(prepared.spec.max_workers).dispatch(
        executor,
        &prepared.instances,
        &counter,
    )?;
    let report = RunReport::collect(&prepared.instances, results);
    let counts = report.status_counts();
    info!(
        "Sweep finished: {} succeeded, {} failed, {} timed out, {} dropped",
        counts.get(RunStatus::Succeeded.as_str()).copied().unwrap_or(0),
        counts.get(RunStatus::Failed.as_str()).copied().unwrap_or(0),
        counts.get(RunStatus::TimedOut.as_str()).copied().unwrap_or(0),
        report.dropped()
    );

    let provenance = sweep_provenance::resolve_or_unknown(provenance);
    let record = write_run_record(&prepared.spec, provenance, &report, started.elapsed())?;
    Ok(SweepResult {
        plan: prepared.plan,
        report,
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Scripted;

    impl Execute for Scripted {
        fn execute(
            &self,
            params: &InstanceParams,
            _dispatch: Dispatch,
        ) -> Result<RunOutcome, RunnerError> {
            match params.get("solver").map(render_value).as_deref() {
                Some("A") => Ok(RunOutcome::succeeded(17, Duration::from_millis(40))),
                Some("B") => Ok(RunOutcome::timed_out(Some(124))),
                _ => Err(RunnerError::MissingResult {
                    path: PathBuf::from("tasks.txt"),
                }),
            }
        }
    }

    fn spec(root: &Path, solvers: &str) -> SweepSpec {
        parse_sweep_spec(&format!(
            "\
solvers: {}
maps: [m1]
num_agents: [5, 10]
simulation_windows: [5]
seeds: [0, 1]
simulation_time: 100
time_limit_sec: 1
root: {}
max_workers: 2
",
            solvers,
            root.display()
        ))
        .expect("spec")
    }

    #[test]
    fn overrides_take_precedence_over_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overrides = SweepOverrides {
            label: Some("cli".to_string()),
            binary: Some(PathBuf::from("/opt/solver")),
            maps_dir: Some(PathBuf::from("/data/maps")),
            max_workers: Some(3),
        };
        let prepared = prepare_sweep(spec(dir.path(), "[A, B]"), &overrides).expect("prepare");
        assert_eq!(prepared.spec.binary_path(), PathBuf::from("/opt/solver"));
        assert_eq!(prepared.spec.label.as_deref(), Some("cli"));
        assert_eq!(
            prepared.plan,
            SweepPlan {
                instances: 8,
                max_workers: 3
            }
        );
        assert_eq!(
            prepared.instances[0].get("map"),
            Some(&serde_json::Value::from("/data/maps/m1"))
        );
    }

    #[test]
    fn zero_worker_override_is_a_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overrides = SweepOverrides {
            max_workers: Some(0),
            ..SweepOverrides::default()
        };
        let err = prepare_sweep(spec(dir.path(), "[A]"), &overrides).expect_err("zero workers");
        assert!(err.is_configuration());
    }

    #[test]
    fn sweep_report_matches_instances_minus_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prepared =
            prepare_sweep(spec(dir.path(), "[A, B, C]"), &SweepOverrides::default())
                .expect("prepare");
        assert_eq!(prepared.plan.instances, 12);
        let result = execute_sweep_with(&prepared, &Scripted, &Provenance::default())
            .expect("execute");
        assert_eq!(result.report.len(), 8);
        assert_eq!(result.report.dropped(), 4);
        let solvers: Vec<String> = result
            .report
            .rows()
            .iter()
            .map(|r| render_value(r.params.get("solver").expect("solver")))
            .collect();
        assert_eq!(solvers, vec!["A", "A", "A", "A", "B", "B", "B", "B"]);
        assert!(result.record.result_path.exists());
        assert!(result.record.config_path.exists());
    }

    #[test]
    fn missing_config_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = prepare_sweep_file(&dir.path().join("nope.yaml"), &SweepOverrides::default())
            .expect_err("missing file");
        assert!(err.is_configuration());
    }
}
