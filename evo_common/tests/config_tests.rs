//! Network configuration loading tests.
//!
//! Tests for `NetworkConfig::load_validated()`: defaults, group derivation,
//! liveness policy inputs, unknown field rejection and validation bounds.

use evo_common::canopen::config::NetworkConfig;
use evo_common::config::{ConfigError, LogLevel};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write `content` as canopen.toml in `dir`.
fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("canopen.toml");
    fs::write(&path, content).unwrap();
    path
}

fn nodes(count: u8) -> String {
    (1..=count)
        .map(|id| format!("\n[[nodes]]\nid = {id}\nname = \"axis{id}\"\n"))
        .collect()
}

#[test]
fn full_file_loads() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        r#"
[shared]
service_name = "evo-canopen"
log_level = "debug"

[bus]
driver = "virtual"
device = "can1"
sync_interval_ms = 4
scheduler_cpu = 2

[supervision]
guard_time_ms = 250
life_time_factor = 3

[motor]
transition_timeout_ms = 1500

[[nodes]]
id = 12
name = "shoulder"
group = "arm"

[[nodes]]
id = 20
name = "turntable"
bus = "can2"

[[nodes]]
id = 13
name = "elbow"
group = "arm"
"#,
    );

    let config = NetworkConfig::load_validated(&path).unwrap();
    assert_eq!(config.shared.log_level, LogLevel::Debug);
    assert_eq!(config.bus.device, "can1");
    assert_eq!(config.bus.sync_interval_ms, 4);
    assert_eq!(config.bus.scheduler_cpu, Some(2));
    assert_eq!(config.effective_guard_time_ms(), 250);
    assert_eq!(config.effective_life_time_factor(), 3);
    assert_eq!(config.motor.transition_timeout_ms, 1500);

    assert_eq!(config.node_bus(&config.nodes[0]), "can1");
    assert_eq!(config.node_bus(&config.nodes[1]), "can2");

    let groups = config.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].0, "arm");
    let ids: Vec<_> = groups[0].1.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![12, 13]);
}

#[test]
fn life_time_factor_defaults_to_twice_node_count() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(tmp.path(), &format!("[shared]\nservice_name = \"t\"\n{}", nodes(3)));

    let config = NetworkConfig::load_validated(&path).unwrap();
    assert_eq!(config.effective_guard_time_ms(), 500);
    assert_eq!(config.effective_life_time_factor(), 6);
}

#[test]
fn guard_time_scaling_is_opt_in() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        &format!(
            "[shared]\nservice_name = \"t\"\n\n[supervision]\nguard_time_ms = 100\nscale_guard_time_by_node_count = true\n{}",
            nodes(4)
        ),
    );

    let config = NetworkConfig::load_validated(&path).unwrap();
    assert_eq!(config.effective_guard_time_ms(), 400);
    assert_eq!(config.effective_life_time_factor(), 8);
}

#[test]
fn longest_sync_interval_fits_interpolation_period() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        &format!("[shared]\nservice_name = \"t\"\n\n[bus]\nsync_interval_ms = 255\n{}", nodes(1)),
    );
    let config = NetworkConfig::load_validated(&path).unwrap();
    assert_eq!(config.bus.sync_interval_ms, 255);

    let path = write_config(
        tmp.path(),
        &format!("[shared]\nservice_name = \"t\"\n\n[bus]\nsync_interval_ms = 500\n{}", nodes(1)),
    );
    let err = NetworkConfig::load_validated(&path).unwrap_err();
    assert!(matches!(&err, ConfigError::ValidationError(msg) if msg.contains("sync_interval_ms")));
}

#[test]
fn missing_file_is_reported() {
    let tmp = TempDir::new().unwrap();
    let result = NetworkConfig::load_validated(&tmp.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn unknown_fields_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        "[shared]\nservice_name = \"t\"\n\n[bus]\nbitrate = 500000\n",
    );
    assert!(matches!(
        NetworkConfig::load_validated(&path),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn invalid_values_fail_validation() {
    let tmp = TempDir::new().unwrap();
    let cases = [
        "[[nodes]]\nid = 0\nname = \"zero\"\n",
        "[[nodes]]\nid = 128\nname = \"high\"\n",
        "[[nodes]]\nid = 5\nname = \"\"\n",
        "[[nodes]]\nid = 5\nname = \"a\"\n\n[[nodes]]\nid = 5\nname = \"b\"\n",
        "[[nodes]]\nid = 5\nname = \"a\"\n\n[[nodes]]\nid = 6\nname = \"a\"\n",
        "[bus]\nsync_interval_ms = 0\n",
        "[bus]\nsync_interval_ms = 256\n",
        "[supervision]\nguard_time_ms = 0\n",
        "[supervision]\nlife_time_factor = 0\n",
        "[motor]\nstatus_poll_interval_ms = 0\n",
        "[supervision]\nguard_time_ms = 70000\n",
    ];

    for body in cases {
        let path = write_config(tmp.path(), &format!("[shared]\nservice_name = \"t\"\n\n{body}"));
        assert!(
            matches!(NetworkConfig::load_validated(&path), Err(ConfigError::ValidationError(_))),
            "accepted: {body}"
        );
    }
}
