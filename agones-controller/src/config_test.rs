use anyhow::Result;

use super::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "8081".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "agones-controller-0".into()),
        ("MIN_PORT".into(), "7000".into()),
        ("MAX_PORT".into(), "8000".into()),
        ("WORKERS".into(), "4".into()),
        ("WEBHOOK_KEY".into(), "a2V5".into()),
        ("WEBHOOK_CERT".into(), "Y2VydA==".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}", config.rust_log);
    assert!(config.http_port == 8081, "unexpected value parsed for HTTP_PORT, got {}", config.http_port);
    assert!(config.namespace == "default", "unexpected value parsed for NAMESPACE, got {}", config.namespace);
    assert!(config.pod_name == "agones-controller-0", "unexpected value parsed for POD_NAME, got {}", config.pod_name);
    assert!(config.min_port == 7000, "unexpected value parsed for MIN_PORT, got {}", config.min_port);
    assert!(config.max_port == 8000, "unexpected value parsed for MAX_PORT, got {}", config.max_port);
    assert!(config.workers == 4, "unexpected value parsed for WORKERS, got {}", config.workers);

    Ok(())
}

#[test]
fn config_defaults_worker_count() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "8081".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "agones-controller-0".into()),
        ("MIN_PORT".into(), "7000".into()),
        ("MAX_PORT".into(), "8000".into()),
        ("WEBHOOK_KEY".into(), "a2V5".into()),
        ("WEBHOOK_CERT".into(), "Y2VydA==".into()),
    ])?;

    assert!(config.workers == 2, "unexpected default value for WORKERS, got {}", config.workers);

    Ok(())
}
