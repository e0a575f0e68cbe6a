use crate::error::SweepError;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::{Mapping, Value as YamlValue};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BINARY: &str = "./lifelong";
pub const DEFAULT_MAPS_DIR: &str = "maps";
pub const DEFAULT_TIMEOUT_COMMAND: &str = "timeout";
pub const DEFAULT_KILL_GRACE_SEC: u64 = 5;
pub const DEFAULT_SCENARIO: &str = "MT";

/// Names a `constants` entry may not take: instance fields, the flag the
/// runner owns, and the outcome columns of the result table.
const RESERVED_CONSTANT_KEYS: [&str; 12] = [
    "scenario",
    "solver",
    "map",
    "agentNum",
    "simulation_window",
    "planning_window",
    "seed",
    "simulation_time",
    "output",
    "completed_tasks",
    "runtime_s",
    "status",
];

/// A sweep definition as read from the YAML config file.
///
/// Varying fields are lists crossed into instances by [`crate::Expander`];
/// the rest are scalars shared by every instance or by the harness itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<Vec<String>>,
    pub solvers: SolverSweep,
    pub maps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_agents: Option<Vec<u64>>,
    pub simulation_windows: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_windows: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeds: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_seeds: Option<u64>,
    pub simulation_time: u64,
    pub time_limit_sec: u64,
    pub root: PathBuf,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maps_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_grace_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub constants: Mapping,
}

fn default_max_workers() -> usize {
    1
}

/// Either one list of solvers crossed with the top-level `num_agents`, or a
/// mapping giving each solver its own agent counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SolverSweep {
    Flat(Vec<String>),
    PerSolver(PerSolverAgents),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentCounts {
    Listed(Vec<u64>),
    Scoped { num_agents: Vec<u64> },
}

impl AgentCounts {
    pub fn counts(&self) -> &[u64] {
        match self {
            AgentCounts::Listed(counts) => counts,
            AgentCounts::Scoped { num_agents } => num_agents,
        }
    }
}

/// Solver → agent counts in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerSolverAgents(pub Vec<(String, AgentCounts)>);

impl Serialize for PerSolverAgents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (solver, counts) in &self.0 {
            map.serialize_entry(solver, counts)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PerSolverAgents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = PerSolverAgents;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of solver name to agent counts")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, AgentCounts)> = Vec::new();
                while let Some((solver, counts)) = access.next_entry::<String, AgentCounts>()? {
                    if entries.iter().any(|(seen, _)| seen == &solver) {
                        return Err(de::Error::custom(format!("duplicate solver `{}`", solver)));
                    }
                    entries.push((solver, counts));
                }
                Ok(PerSolverAgents(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

const REQUIRED_FIELDS: [&str; 6] = [
    "solvers",
    "maps",
    "simulation_windows",
    "simulation_time",
    "time_limit_sec",
    "root",
];

pub fn load_sweep_spec(path: &Path) -> Result<SweepSpec, SweepError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| SweepError::config(format!("cannot read {}: {}", path.display(), e)))?;
    parse_sweep_spec(&raw)
        .map_err(|e| SweepError::config(format!("{}: {}", path.display(), strip_prefix(&e))))
}

fn strip_prefix(err: &SweepError) -> String {
    match err {
        SweepError::Configuration(message) => message.clone(),
        other => other.to_string(),
    }
}

pub fn parse_sweep_spec(raw: &str) -> Result<SweepSpec, SweepError> {
    let value: YamlValue = serde_yaml::from_str(raw)
        .map_err(|e| SweepError::config(format!("invalid YAML: {}", e)))?;
    sweep_spec_from_value(value)
}

pub(crate) fn sweep_spec_from_value(value: YamlValue) -> Result<SweepSpec, SweepError> {
    validate_required_fields(&value)?;
    let spec: SweepSpec = serde_yaml::from_value(value)
        .map_err(|e| SweepError::config(format!("invalid sweep config: {}", e)))?;
    spec.validate()?;
    Ok(spec)
}

fn validate_required_fields(value: &YamlValue) -> Result<(), SweepError> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| SweepError::config("sweep config must be a mapping at the top level"))?;
    let mut missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|key| mapping.get(*key).map_or(true, YamlValue::is_null))
        .collect();
    if mapping.get("seeds").is_none() && mapping.get("n_seeds").is_none() {
        missing.push("seeds|n_seeds");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SweepError::config(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

impl SweepSpec {
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.max_workers == 0 {
            return Err(SweepError::config("max_workers must be at least 1"));
        }
        if self.time_limit_sec == 0 {
            return Err(SweepError::config("time_limit_sec must be at least 1"));
        }
        match (&self.seeds, &self.n_seeds) {
            (Some(_), Some(_)) => {
                return Err(SweepError::config(
                    "declare either seeds or n_seeds, not both",
                ))
            }
            (None, None) => return Err(SweepError::config("missing seeds or n_seeds")),
            _ => {}
        }
        match (&self.solvers, &self.num_agents) {
            (SolverSweep::Flat(_), None) => {
                return Err(SweepError::config(
                    "a flat solver list needs a top-level num_agents list",
                ))
            }
            (SolverSweep::PerSolver(_), Some(_)) => {
                return Err(SweepError::config(
                    "per-solver agent counts cannot be combined with top-level num_agents",
                ))
            }
            _ => {}
        }
        for (key, value) in &self.constants {
            let name = key
                .as_str()
                .ok_or_else(|| SweepError::config("constants keys must be strings"))?;
            if RESERVED_CONSTANT_KEYS.contains(&name) {
                return Err(SweepError::config(format!(
                    "constant `{}` clashes with a sweep field or result column",
                    name
                )));
            }
            if !matches!(
                value,
                YamlValue::String(_) | YamlValue::Number(_) | YamlValue::Bool(_)
            ) {
                return Err(SweepError::config(format!(
                    "constant `{}` must be a string, number or boolean",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Declared scenarios, or the single default scenario when none are.
    pub fn scenario_values(&self) -> Vec<&str> {
        match &self.scenarios {
            Some(list) => list.iter().map(String::as_str).collect(),
            None => vec![DEFAULT_SCENARIO],
        }
    }

    pub fn seed_values(&self) -> Vec<u64> {
        match (&self.seeds, self.n_seeds) {
            (Some(seeds), _) => seeds.clone(),
            (None, Some(n)) => (0..n).collect(),
            (None, None) => Vec::new(),
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY))
    }

    pub fn maps_dir_path(&self) -> PathBuf {
        self.maps_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MAPS_DIR))
    }

    pub fn timeout_wrapper(&self) -> &str {
        self.timeout_command
            .as_deref()
            .unwrap_or(DEFAULT_TIMEOUT_COMMAND)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_sec)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_sec.unwrap_or(DEFAULT_KILL_GRACE_SEC))
    }
}
