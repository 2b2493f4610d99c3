use pgrelay::config::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const MINIMAL: &str = r#"
[[backend]]
host = "10.0.0.1"
"#;

#[test]
fn test_minimal_config_uses_defaults() {
    let file = write_config(MINIMAL);
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.listen_addresses, "127.0.0.1");
    assert_eq!(config.port, 9999);
    assert_eq!(config.num_workers, 32);
    assert_eq!(config.max_pool, 4);
    assert!(config.load_balance_mode);
    assert!(!config.statement_level_load_balance);
    assert!(config.ignore_leading_white_space);
    assert_eq!(config.health_check_period, Duration::from_secs(10));
    assert_eq!(config.health_check_max_retries, 3);
    assert_eq!(config.backends.len(), 1);
    assert_eq!(config.backends[0].port, 5432);
    assert_eq!(config.backends[0].weight, 1.0);
}

#[test]
fn test_full_config_parses() {
    let file = write_config(
        r#"
listen_addresses = "0.0.0.0"
port = 6432
num_workers = 8
max_pool = 2
child_life_time = "5m"
child_max_connections = 100
statement_level_load_balance = true
delay_threshold = 1048576
health_check_period = "30s"
health_check_timeout = "5s"
health_check_user = "monitor"
health_check_database = "postgres"
failover_command = "/etc/pgrelay/failover.sh %d %h %m"
use_watchdog = true
wd_priority = 5
wd_port = 9000
wd_heartbeat_interval = "1s"
wd_heartbeat_deadtime = "10s"
enable_pool_hba = true
pool_passwd = "/etc/pgrelay/pool_passwd"
log_destination = "stderr"
pid_file_name = "/run/pgrelay.pid"

[[backend]]
host = "10.0.0.1"
port = 5432
weight = 2.0
role = "primary"
data_directory = "/var/lib/pgsql/data"
application_name = "node0"

[[backend]]
host = "10.0.0.2"
weight = 1.0
role = "standby"

[[watchdog_peer]]
host = "10.0.1.2"
wd_port = 9000
pgrelay_port = 6432

[[watchdog_peer]]
host = "10.0.1.3"
wd_port = 9000
pgrelay_port = 6432

[ssl]
enabled = false

[admin]
enabled = true
port = 8080
jwt_secret = "sekrit"
password = "adminpw"
"#,
    );
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.port, 6432);
    assert_eq!(config.backends.len(), 2);
    assert_eq!(config.backends[0].weight, 2.0);
    assert_eq!(config.child_life_time, Duration::from_secs(300));
    assert_eq!(config.watchdog_peers.len(), 2);
    // Three nodes total (self + 2 peers) need a strict majority of 2.
    assert_eq!(config.watchdog_quorum(), 2);
    assert!(config.admin.enabled);
}

#[test]
fn test_rejects_missing_backends() {
    let file = write_config("port = 6432\n");
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("backend"));
}

#[test]
fn test_rejects_zero_port() {
    let file = write_config(&format!("port = 0\n{MINIMAL}"));
    assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
}

#[test]
fn test_rejects_two_primaries() {
    let file = write_config(
        r#"
[[backend]]
host = "a"
role = "primary"

[[backend]]
host = "b"
role = "primary"
"#,
    );
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("primary"));
}

#[test]
fn test_rejects_negative_weight() {
    let file = write_config(
        r#"
[[backend]]
host = "a"
weight = -1.0
"#,
    );
    assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
}

#[test]
fn test_rejects_watchdog_without_peers() {
    let file = write_config(&format!("use_watchdog = true\n{MINIMAL}"));
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("watchdog_peer"));
}

#[test]
fn test_rejects_admin_port_clash() {
    let file = write_config(&format!(
        "port = 8080\n[admin]\nenabled = true\nport = 8080\npassword = \"x\"\n{MINIMAL}"
    ));
    assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
}

#[test]
fn test_rejects_pool_hba_without_passwd_file() {
    let file = write_config(&format!("enable_pool_hba = true\n{MINIMAL}"));
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("pool_passwd"));
}
