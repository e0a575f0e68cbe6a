use crate::config::{SolverSweep, SweepSpec};
use crate::error::SweepError;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Number, Value};
use serde_yaml::Value as YamlValue;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One concrete assignment of every varying field, in argument order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceParams {
    fields: Vec<(String, Value)>,
}

impl InstanceParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(key, value);
        self
    }

    /// Sets `key`, replacing an earlier value in place so the order of first
    /// declaration is kept.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// `--key=value` for every field.
    pub fn to_args(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|(k, v)| format!("--{}={}", k, render_value(v)))
            .collect()
    }
}

impl Serialize for InstanceParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Renders a parameter the way it appears on the command line and in the
/// result table: strings bare, null empty, everything else as JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Turns a [`SweepSpec`] into its ordered list of instances.
#[derive(Debug, Clone)]
pub struct Expander {
    maps_dir: PathBuf,
}

impl Expander {
    pub fn new(maps_dir: impl Into<PathBuf>) -> Self {
        Self {
            maps_dir: maps_dir.into(),
        }
    }

    pub fn maps_dir(&self) -> &Path {
        &self.maps_dir
    }

    pub fn expand(&self, spec: &SweepSpec) -> Result<Vec<InstanceParams>, SweepError> {
        spec.validate()?;
        let solver_scopes: Vec<(&str, &[u64])> = match &spec.solvers {
            SolverSweep::Flat(solvers) => {
                let counts = spec.num_agents.as_deref().unwrap_or(&[]);
                solvers.iter().map(|s| (s.as_str(), counts)).collect()
            }
            SolverSweep::PerSolver(per_solver) => per_solver
                .0
                .iter()
                .map(|(s, counts)| (s.as_str(), counts.counts()))
                .collect(),
        };
        let scenarios = spec.scenario_values();
        let seeds = spec.seed_values();
        let constants = constant_fields(spec)?;

        warn_on_empty_fields(spec, &solver_scopes, &seeds);

        let mut instances = Vec::new();
        for scenario in &scenarios {
            for (solver, agent_counts) in &solver_scopes {
                for map in &spec.maps {
                    let map_path = self.maps_dir.join(map).to_string_lossy().to_string();
                    for simulation_window in &spec.simulation_windows {
                        let planning_windows = match &spec.planning_windows {
                            Some(explicit) => explicit.clone(),
                            None => vec![simulation_window * 2],
                        };
                        for agents in agent_counts.iter() {
                            for planning_window in &planning_windows {
                                for seed in &seeds {
                                    let mut params = InstanceParams::new();
                                    params.push("scenario", *scenario);
                                    params.push("solver", *solver);
                                    params.push("map", map_path.as_str());
                                    params.push("agentNum", *agents);
                                    params.push("simulation_window", *simulation_window);
                                    params.push("planning_window", *planning_window);
                                    params.push("seed", *seed);
                                    params.push("simulation_time", spec.simulation_time);
                                    for (key, value) in &constants {
                                        params.push(key.as_str(), value.clone());
                                    }
                                    instances.push(params);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(instances)
    }
}

fn warn_on_empty_fields(spec: &SweepSpec, solver_scopes: &[(&str, &[u64])], seeds: &[u64]) {
    let mut empty = Vec::new();
    if spec.scenarios.as_ref().is_some_and(|s| s.is_empty()) {
        empty.push("scenarios".to_string());
    }
    if solver_scopes.is_empty() {
        empty.push("solvers".to_string());
    }
    if spec.maps.is_empty() {
        empty.push("maps".to_string());
    }
    if spec.num_agents.as_ref().is_some_and(|n| n.is_empty()) {
        empty.push("num_agents".to_string());
    }
    for (solver, counts) in solver_scopes {
        if counts.is_empty() && matches!(spec.solvers, SolverSweep::PerSolver(_)) {
            empty.push(format!("solvers.{}.num_agents", solver));
        }
    }
    if spec.simulation_windows.is_empty() {
        empty.push("simulation_windows".to_string());
    }
    if spec.planning_windows.as_ref().is_some_and(|p| p.is_empty()) {
        empty.push("planning_windows".to_string());
    }
    if seeds.is_empty() {
        empty.push("seeds".to_string());
    }
    for field in empty {
        warn!("sweep field `{}` is empty; it contributes zero instances", field);
    }
}

fn constant_fields(spec: &SweepSpec) -> Result<Vec<(String, Value)>, SweepError> {
    spec.constants
        .iter()
        .map(|(key, value)| {
            let key = key
                .as_str()
                .ok_or_else(|| SweepError::config("constants keys must be strings"))?;
            Ok((key.to_string(), scalar_to_json(value)))
        })
        .collect()
}

fn scalar_to_json(value: &YamlValue) -> Value {
    match value {
        YamlValue::Bool(b) => Value::Bool(*b),
        YamlValue::String(s) => Value::String(s.clone()),
        YamlValue::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(n.to_string()))
            }
        }
        YamlValue::Null => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}
