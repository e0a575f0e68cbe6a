use crate::config::{sweep_spec_from_value, SweepSpec};
use crate::error::SweepError;
use crate::report::RunReport;
use chrono::{Local, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use serde_yaml::{Mapping, Value as YamlValue};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_provenance::{canonical_json_digest, Provenance};
use tracing::info;

pub const CONFIG_FILE: &str = "config.yaml";
pub const RESULT_FILE: &str = "result.csv";
pub const MANIFEST_FILE: &str = "manifest.json";

const RUN_DIR_TIMESTAMP: &str = "%Y-%m-%dT%H-%M-%S";
const MAX_RUN_DIR_ATTEMPTS: usize = 1000;
const PROVENANCE_KEYS: [&str; 3] = ["git_dirty", "git_branch", "git_hash"];

/// The sweep config exactly as it was run, plus where it was run from.
///
/// Written as one flat mapping; [`ResolvedConfig::parse`] splits the `git_*`
/// keys back out so the spec itself is still parsed strictly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    #[serde(flatten)]
    pub spec: SweepSpec,
    #[serde(flatten)]
    pub provenance: Provenance,
}

impl ResolvedConfig {
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| SweepError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&raw).map_err(|e| SweepError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(raw: &str) -> Result<Self, SweepError> {
        let mut document: Mapping = serde_yaml::from_str(raw)
            .map_err(|e| SweepError::config(format!("invalid YAML: {}", e)))?;
        let mut provenance = Mapping::new();
        for key in PROVENANCE_KEYS {
            if let Some(value) = document.remove(key) {
                provenance.insert(YamlValue::from(key), value);
            }
        }
        let provenance: Provenance = serde_yaml::from_value(YamlValue::Mapping(provenance))
            .map_err(|e| SweepError::config(format!("invalid provenance: {}", e)))?;
        let spec = sweep_spec_from_value(YamlValue::Mapping(document))?;
        Ok(Self { spec, provenance })
    }
}

/// Paths of a persisted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub config_path: PathBuf,
    pub result_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Writes `config.yaml`, `result.csv` and `manifest.json` into a new run
/// directory under `spec.root`. Existing runs are never touched.
pub fn write_run_record(
    spec: &SweepSpec,
    provenance: Provenance,
    report: &RunReport,
    wall_time: Duration,
) -> Result<RunRecord, SweepError> {
    let base_name = run_dir_name(
        &Local::now().format(RUN_DIR_TIMESTAMP).to_string(),
        spec.label.as_deref(),
    );
    let (run_dir, run_id) = create_run_dir(&spec.root, &base_name)?;

    let resolved = ResolvedConfig {
        spec: spec.clone(),
        provenance,
    };
    let config_yaml = serde_yaml::to_string(&resolved).map_err(|e| SweepError::Serialization {
        what: "resolved config",
        message: e.to_string(),
    })?;
    let config_path = run_dir.join(CONFIG_FILE);
    write_new_file(&config_path, config_yaml.as_bytes())?;
    info!("Config saved to {}", display_path(&config_path));

    let result_path = run_dir.join(RESULT_FILE);
    write_new_file(&result_path, report.to_csv().as_bytes())?;
    info!("Results saved to {}", display_path(&result_path));

    let manifest = build_manifest(&run_id, &resolved, report, wall_time)?;
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).map_err(|e| SweepError::Serialization {
            what: "run manifest",
            message: e.to_string(),
        })?;
    let manifest_path = run_dir.join(MANIFEST_FILE);
    write_new_file(&manifest_path, &manifest_bytes)?;

    Ok(RunRecord {
        run_id,
        run_dir,
        config_path,
        result_path,
        manifest_path,
    })
}

fn build_manifest(
    run_id: &str,
    resolved: &ResolvedConfig,
    report: &RunReport,
    wall_time: Duration,
) -> Result<Value, SweepError> {
    let spec_value = serde_json::to_value(&resolved.spec).map_err(|e| SweepError::Serialization {
        what: "sweep spec",
        message: e.to_string(),
    })?;
    Ok(json!({
        "schema_version": "sweep_manifest_v1",
        "run_id": run_id,
        "runner_version": concat!("rust-", env!("CARGO_PKG_VERSION")),
        "created_at": Utc::now().to_rfc3339(),
        "config_digest": canonical_json_digest(&spec_value),
        "instances": report.len() + report.dropped(),
        "rows": report.len(),
        "dropped": report.dropped(),
        "max_workers": resolved.spec.max_workers,
        "status_counts": report.status_counts(),
        "wall_time_s": wall_time.as_secs_f64(),
        "provenance": resolved.provenance,
    }))
}

fn run_dir_name(timestamp: &str, label: Option<&str>) -> String {
    match label.map(sanitize_label).filter(|l| !l.is_empty()) {
        Some(label) => format!("{}_{}", timestamp, label),
        None => timestamp.to_string(),
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Creates `<root>/<base>`, or `<base>-1`, `<base>-2`, ... if taken.
fn create_run_dir(root: &Path, base: &str) -> Result<(PathBuf, String), SweepError> {
    fs::create_dir_all(root).map_err(SweepError::persist(root))?;
    for attempt in 0..MAX_RUN_DIR_ATTEMPTS {
        let run_id = if attempt == 0 {
            base.to_string()
        } else {
            format!("{}-{}", base, attempt)
        };
        let dir = root.join(&run_id);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((dir, run_id)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(SweepError::persist(&dir)(e)),
        }
    }
    Err(SweepError::Persistence {
        path: root.join(base),
        source: io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free run directory name left for this timestamp",
        ),
    })
}

fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), SweepError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(SweepError::persist(path))?;
    file.write_all(bytes).map_err(SweepError::persist(path))?;
    file.sync_all().map_err(SweepError::persist(path))?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_sweep_spec;
    use crate::runner::RunOutcome;
    use crate::InstanceParams;

    fn spec_in(root: &Path) -> SweepSpec {
        let raw = format!(
            "\
solvers:
  PBS: {{num_agents: [100, 200]}}
  LaCAM: [300]
maps: [sorting.map]
simulation_windows: [5]
n_seeds: 2
simulation_time: 5000
time_limit_sec: 600
root: {}
max_workers: 4
label: nightly
constants:
  cutoffTime: 60
",
            root.display()
        );
        parse_sweep_spec(&raw).expect("spec")
    }

    fn provenance() -> Provenance {
        Provenance {
            git_dirty: Some(false),
            git_branch: Some("main".to_string()),
            git_hash: Some("0123456789abcdef".to_string()),
        }
    }

    fn report() -> RunReport {
        RunReport::collect(
            &[InstanceParams::new().with("solver", "PBS")],
            vec![Ok(RunOutcome::succeeded(17, Duration::from_secs(3)))],
        )
    }

    #[test]
    fn persisted_config_reloads_to_spec_plus_provenance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec_in(&dir.path().join("results"));
        let record =
            write_run_record(&spec, provenance(), &report(), Duration::from_secs(9)).expect("write");
        let reloaded = ResolvedConfig::load(&record.config_path).expect("reload");
        assert_eq!(reloaded.spec, spec);
        assert_eq!(reloaded.provenance, provenance());

        let raw = fs::read_to_string(&record.config_path).expect("raw config");
        assert!(raw.contains("git_dirty: false"), "{}", raw);
        assert!(raw.contains("git_branch: main"), "{}", raw);
        assert!(raw.contains("git_hash:"), "{}", raw);
    }

    #[test]
    fn reload_still_rejects_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec_in(dir.path());
        let mut raw = serde_yaml::to_string(&ResolvedConfig {
            spec,
            provenance: provenance(),
        })
        .expect("serialize");
        assert!(ResolvedConfig::parse(&raw).is_ok());
        raw.push_str("max_worker: 8\n");
        let err = ResolvedConfig::parse(&raw).expect_err("typo");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("max_worker"), "{}", err);
    }

    #[test]
    fn unknown_provenance_round_trips_as_null() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec_in(dir.path());
        let record = write_run_record(
            &spec,
            Provenance::default(),
            &report(),
            Duration::from_secs(1),
        )
        .expect("write");
        let reloaded = ResolvedConfig::load(&record.config_path).expect("reload");
        assert_eq!(reloaded.provenance, Provenance::default());
        assert_eq!(reloaded.spec, spec);
    }

    #[test]
    fn run_directory_holds_all_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("nested").join("results");
        let spec = spec_in(&root);
        let record =
            write_run_record(&spec, provenance(), &report(), Duration::from_secs(9)).expect("write");
        assert!(record.run_dir.starts_with(&root));
        assert!(record.run_id.ends_with("_nightly"), "{}", record.run_id);
        assert_eq!(
            fs::read_to_string(&record.result_path).expect("csv"),
            "solver,completed_tasks,runtime_s,status\nPBS,17,3,succeeded\n"
        );
        let manifest: Value =
            serde_json::from_slice(&fs::read(&record.manifest_path).expect("manifest"))
                .expect("manifest json");
        assert_eq!(manifest["schema_version"], "sweep_manifest_v1");
        assert_eq!(manifest["run_id"], record.run_id.as_str());
        assert_eq!(manifest["instances"], 1);
        assert_eq!(manifest["status_counts"]["succeeded"], 1);
        assert_eq!(manifest["provenance"]["git_branch"], "main");
        assert!(manifest["config_digest"]
            .as_str()
            .expect("digest")
            .starts_with("sha256:"));
    }

    #[test]
    fn existing_run_directory_is_never_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (first, first_id) = create_run_dir(dir.path(), "2024-01-01T00-00-00").expect("first");
        fs::write(first.join(RESULT_FILE), "keep me").expect("seed existing run");
        let (second, second_id) =
            create_run_dir(dir.path(), "2024-01-01T00-00-00").expect("second");
        let (_, third_id) = create_run_dir(dir.path(), "2024-01-01T00-00-00").expect("third");
        assert_ne!(first, second);
        assert_eq!(first_id, "2024-01-01T00-00-00");
        assert_eq!(second_id, "2024-01-01T00-00-00-1");
        assert_eq!(third_id, "2024-01-01T00-00-00-2");
        assert_eq!(
            fs::read_to_string(first.join(RESULT_FILE)).expect("existing"),
            "keep me"
        );
    }

    #[test]
    fn write_new_file_refuses_to_truncate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        write_new_file(&path, b"first").expect("first write");
        let err = write_new_file(&path, b"second").expect_err("second write must fail");
        assert!(matches!(err, SweepError::Persistence { .. }));
        assert_eq!(fs::read_to_string(&path).expect("read"), "first");
    }

    #[test]
    fn labels_are_made_path_safe() {
        assert_eq!(run_dir_name("T", None), "T");
        assert_eq!(run_dir_name("T", Some("  ")), "T");
        assert_eq!(run_dir_name("T", Some("pbs vs/lacam")), "T_pbs-vs-lacam");
    }

    #[test]
    fn unwritable_root_is_a_persistence_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a directory").expect("blocker");
        let spec = spec_in(&blocker.join("results"));
        let err = write_run_record(&spec, provenance(), &report(), Duration::from_secs(1))
            .expect_err("root under a file");
        assert!(matches!(err, SweepError::Persistence { .. }), "{:?}", err);
    }
}
