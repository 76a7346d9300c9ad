//! Configuration from TOML files and `ARMADA_*` variables.

use std::path::PathBuf;

use armada::config::{BackendKind, ControlPlaneConfig};
use armada::{ConfigError, ResourceType};
use pretty_assertions::assert_eq;
use rstest::rstest;

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

mod env_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    #[case("memory", BackendKind::Memory)]
    #[case("file", BackendKind::File)]
    #[case("FILE", BackendKind::File)]
    #[case(" redis ", BackendKind::Redis)]
    fn backend_names_are_parsed(#[case] raw: &str, #[case] expected: BackendKind) {
        let mut config = ControlPlaneConfig::default();
        config.apply_env(vars(&[("ARMADA_STORE_BACKEND", raw)])).unwrap();
        assert_eq!(config.store.backend, expected);
    }

    #[rstest]
    #[case("ARMADA_STORE_BACKEND", "postgres")]
    #[case("ARMADA_TASK_TTL_MS", "soon")]
    #[case("ARMADA_RETRY_MAX_ATTEMPTS", "-1")]
    #[case("ARMADA_RETRY_DELAY_MS", "1.5")]
    fn bad_values_name_the_variable(#[case] key: &str, #[case] value: &str) {
        let mut config = ControlPlaneConfig::default();
        let err = config.apply_env(vars(&[(key, value)])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ref k, .. } if k == key));
    }

    #[test]
    fn variables_override_the_file() {
        let mut config = ControlPlaneConfig::from_toml(
            r#"
            log_filter = "warn"

            [store]
            backend = "memory"

            [engine.retry]
            max_attempts = 2
            delay_ms = 50
            "#,
        )
        .unwrap();
        config
            .apply_env(vars(&[
                ("ARMADA_LOG", "armada=trace"),
                ("ARMADA_STORE_BACKEND", "file"),
                ("ARMADA_STORE_PATH", "/var/lib/armada"),
                ("ARMADA_TASK_TTL_MS", "600000"),
                ("ARMADA_RETRY_MAX_ATTEMPTS", "9"),
                ("HOME", "/root"),
                ("ARMADA_SOMETHING_ELSE", "x"),
            ]))
            .unwrap();

        assert_eq!(config.log_filter, "armada=trace");
        assert_eq!(config.store.backend, BackendKind::File);
        assert_eq!(config.store.path, Some(PathBuf::from("/var/lib/armada")));
        assert_eq!(config.engine.default_task_ttl_ms, Some(600_000));
        assert_eq!(config.engine.retry.max_attempts, 9);
        assert_eq!(config.engine.retry.delay_ms, 50);
    }
}

mod file_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn configuration_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("armada.toml");
        std::fs::write(
            &path,
            r#"
            [workflows]
            removal_order = ["CONTAINER", "VOLUME"]

            [workflows.host_connection_retry]
            max_attempts = 3
            delay_ms = 250
            "#,
        )
        .unwrap();

        let config = ControlPlaneConfig::from_file(&path).unwrap();
        assert_eq!(
            config.workflows.removal_order,
            vec![ResourceType::Container, ResourceType::Volume]
        );
        assert_eq!(config.workflows.host_connection_retry.max_attempts, 3);
        assert_eq!(config.workflows.host_connection_retry.delay_ms, 250);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ControlPlaneConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
