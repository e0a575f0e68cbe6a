use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Instant;
use sweep_runner::{
    GitCheckout, InstanceRunner, PreparedSweep, RunnerConfig, SweepError, SweepOverrides,
    SweepResult,
};

#[derive(Parser)]
#[command(name = "sweep", version = "0.3.0", about = "Parameter sweep benchmark runner")]
struct Cli {
    /// Sweep config (YAML)
    config: PathBuf,
    /// Expand and print the plan without launching anything
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
    /// Appended to the run directory name
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    binary: Option<PathBuf>,
    #[arg(long)]
    maps_dir: Option<PathBuf>,
    #[arg(long)]
    max_workers: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = cli.json;
    let started = Instant::now();
    let result = run(cli);
    let elapsed = started.elapsed().as_secs_f64();
    match result {
        Ok(Some(mut payload)) => {
            payload["total_runtime_s"] = json!(elapsed);
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => {
            println!("Total experiment runtime: {:.2}s", elapsed);
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run(cli: Cli) -> Result<Option<Value>> {
    let overrides = SweepOverrides {
        label: cli.label,
        binary: cli.binary,
        maps_dir: cli.maps_dir,
        max_workers: cli.max_workers,
    };
    let prepared = sweep_runner::prepare_sweep_file(&cli.config, &overrides)?;

    if cli.dry_run {
        let commands = planned_commands(&prepared);
        if cli.json {
            return Ok(Some(json!({
                "ok": true,
                "command": "sweep",
                "dry_run": true,
                "plan": prepared.plan,
                "instances": prepared.instances,
                "commands": commands
            })));
        }
        println!("instances: {}", prepared.plan.instances);
        println!("max_workers: {}", prepared.plan.max_workers);
        for line in &commands {
            println!("{}", line);
        }
        return Ok(None);
    }

    let cwd = std::env::current_dir()?;
    let result = sweep_runner::execute_sweep(&prepared, &GitCheckout::new(cwd))?;
    if cli.json {
        return Ok(Some(json!({
            "ok": true,
            "command": "sweep",
            "dry_run": false,
            "plan": result.plan,
            "run": run_result_to_json(&result)
        })));
    }
    print_result(&result);
    Ok(None)
}

fn planned_commands(prepared: &PreparedSweep) -> Vec<String> {
    let runner = InstanceRunner::new(RunnerConfig::from_spec(&prepared.spec));
    let output_dir = Path::new("<scratch>/output");
    prepared
        .instances
        .iter()
        .map(|params| sweep_runner::runner::shell_join(&runner.command_line(output_dir, params)))
        .collect()
}

fn run_result_to_json(result: &SweepResult) -> Value {
    json!({
        "run_id": result.record.run_id,
        "run_dir": result.record.run_dir.display().to_string(),
        "config": result.record.config_path.display().to_string(),
        "result": result.record.result_path.display().to_string(),
        "manifest": result.record.manifest_path.display().to_string(),
        "rows": result.report.len(),
        "dropped": result.report.dropped(),
        "status_counts": result.report.status_counts()
    })
}

fn print_result(result: &SweepResult) {
    println!("run_id: {}", result.record.run_id);
    println!("run_dir: {}", result.record.run_dir.display());
    println!("rows: {}", result.report.len());
    if result.report.dropped() > 0 {
        println!("dropped: {}", result.report.dropped());
    }
    for (status, count) in result.report.status_counts() {
        println!("{}: {}", status, count);
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::Configuration(_)) => "configuration_error",
        Some(SweepError::Persistence { .. }) => "persistence_error",
        Some(SweepError::Serialization { .. }) => "serialization_error",
        Some(SweepError::WorkerPool(_)) => "worker_pool_error",
        None => "command_failed",
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
