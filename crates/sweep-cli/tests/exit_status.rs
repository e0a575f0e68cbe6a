use std::fs;
use std::process::Command;

fn sweep() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sweep"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn incomplete_config_exits_non_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("sweep.yaml");
    fs::write(&config, "solvers: [A]\nmaps: [m1]\n").expect("write config");

    let output = sweep().arg(&config).output().expect("run sweep");
    assert!(!output.status.success());

    let output = sweep()
        .arg(&config)
        .arg("--json")
        .output()
        .expect("run sweep --json");
    assert_eq!(output.status.code(), Some(1));
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("json error payload");
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["error"]["code"], "configuration_error");
}

#[test]
fn dry_run_exits_zero_and_reports_runtime() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("sweep.yaml");
    fs::write(
        &config,
        format!(
            "\
solvers: [A]
maps: [m1]
num_agents: [5]
simulation_windows: [5, 10]
n_seeds: 3
simulation_time: 100
time_limit_sec: 30
root: {}
",
            dir.path().join("results").display()
        ),
    )
    .expect("write config");

    let output = sweep()
        .arg(&config)
        .arg("--dry-run")
        .output()
        .expect("run sweep --dry-run");
    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("instances: 6"), "{}", stdout);
    assert!(stdout.contains("Total experiment runtime:"), "{}", stdout);
    assert!(!dir.path().join("results").exists());
}
