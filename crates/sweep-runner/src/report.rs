use crate::error::RunnerError;
use crate::expand::{render_value, InstanceParams};
use crate::runner::{RunOutcome, RunStatus};
use std::collections::BTreeMap;
use tracing::warn;

pub const COMPLETED_TASKS_COLUMN: &str = "completed_tasks";
pub const RUNTIME_COLUMN: &str = "runtime_s";
pub const STATUS_COLUMN: &str = "status";

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub params: InstanceParams,
    pub outcome: RunOutcome,
}

/// Outcomes of a sweep, one row per instance that produced an outcome, in
/// submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    rows: Vec<ReportRow>,
    dropped: usize,
}

impl RunReport {
    /// Pairs each instance with its result. Instances whose runner failed
    /// internally are logged and left out.
    pub fn collect(
        instances: &[InstanceParams],
        results: Vec<Result<RunOutcome, RunnerError>>,
    ) -> Self {
        debug_assert_eq!(instances.len(), results.len());
        let mut report = RunReport::default();
        for (idx, (params, result)) in instances.iter().zip(results).enumerate() {
            match result {
                Ok(outcome) => report.rows.push(ReportRow {
                    params: params.clone(),
                    outcome,
                }),
                Err(err) => {
                    warn!(
                        "dropping instance {}/{} ({}): {}",
                        idx + 1,
                        instances.len(),
                        params.to_args().join(" "),
                        err
                    );
                    report.dropped += 1;
                }
            }
        }
        report
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Instances dropped because their runner failed before an outcome existed.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for status in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::TimedOut] {
            counts.insert(status.as_str(), 0);
        }
        for row in &self.rows {
            *counts.entry(row.outcome.status.as_str()).or_default() += 1;
        }
        counts
    }

    /// Every parameter key in first-seen order, then the outcome columns.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            for key in row.params.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.to_string());
                }
            }
        }
        columns.extend(
            [COMPLETED_TASKS_COLUMN, RUNTIME_COLUMN, STATUS_COLUMN]
                .iter()
                .map(|c| c.to_string()),
        );
        columns
    }

    /// Comma-separated with a header row; null cells are empty.
    pub fn to_csv(&self) -> String {
        let columns = self.columns();
        let param_columns = &columns[..columns.len() - 3];
        let mut out = String::new();
        push_record(&mut out, columns.iter().map(String::as_str));
        for row in &self.rows {
            let mut cells: Vec<String> = param_columns
                .iter()
                .map(|c| row.params.get(c).map(render_value).unwrap_or_default())
                .collect();
            cells.push(
                row.outcome
                    .completed_tasks
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
            );
            cells.push(
                row.outcome
                    .runtime_s()
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            );
            cells.push(row.outcome.status.as_str().to_string());
            push_record(&mut out, cells.iter().map(String::as_str));
        }
        out
    }
}

fn push_record<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    let line = cells.map(csv_field).collect::<Vec<_>>().join(",");
    out.push_str(&line);
    out.push('\n');
}

fn csv_field(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
