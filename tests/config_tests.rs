//! Configuration loading from files.

use std::io::Write;

use anyhow::Result;
use rabbithole::{ConnectionConfig, EndpointSelection, Error};

#[test]
fn load_reads_a_toml_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"
        endpoints = ["amqp://rabbit-1:5672", "rabbit-2"]
        client_name = "ingest"
        network_recovery_interval_ms = 1500
        endpoint_selection = "round-robin"

        [credentials]
        username = "svc"
        password = "pw"
        "#
    )?;

    let config = ConnectionConfig::load(file.path())?;
    config.validate()?;
    assert_eq!(config.client_name.as_deref(), Some("ingest"));
    assert_eq!(config.network_recovery_interval_ms, 1500);
    assert_eq!(config.endpoint_selection, EndpointSelection::RoundRobin);
    assert_eq!(config.credentials.username, "svc");

    let endpoints = config.resolved_endpoints()?;
    assert_eq!(endpoints[0].host(), "rabbit-1");
    assert_eq!(endpoints[1].port(), 5672);
    Ok(())
}

#[test]
fn load_reports_missing_files() {
    let err = ConnectionConfig::load("/nonexistent/rabbithole.toml").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn from_toml_rejects_garbage() {
    assert!(matches!(
        ConnectionConfig::from_toml("endpoints = 5"),
        Err(Error::Config(_))
    ));
}
