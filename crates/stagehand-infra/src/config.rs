//! Engine configuration loader for Stagehand.
//!
//! Reads `stagehand.toml` from the data directory (`~/.stagehand/` by
//! default) and deserializes it into [`EngineConfig`]. Falls back to the
//! defaults when the file is missing or malformed.

use std::path::Path;

use stagehand_types::config::EngineConfig;

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "stagehand.toml";

/// Load engine configuration from `{data_dir}/stagehand.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but cannot be read or parsed, logs a warning and
///   returns the default.
/// - Zero-valued concurrency ceilings are raised to 1 so the scheduler can
///   always make progress.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

fn sanitize(mut config: EngineConfig) -> EngineConfig {
    if config.max_concurrent_phases == 0 {
        tracing::warn!("max_concurrent_phases = 0 would stall every job, using 1");
        config.max_concurrent_phases = 1;
    }
    if config.max_activation_slots == 0 {
        tracing::warn!("max_activation_slots = 0 would stall slot phases, using 1");
        config.max_activation_slots = 1;
    }
    if config.tracker.fallback_concurrency == 0 {
        config.tracker.fallback_concurrency = 1;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
max_concurrent_phases = 20
max_activation_slots = 3
phase_timeout_secs = 600

[tracker]
poll_interval_secs = 5
max_activity_age_secs = 7200
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_phases, 20);
        assert_eq!(config.max_activation_slots, 3);
        assert_eq!(config.phase_timeout_secs, 600);
        assert_eq!(config.tick_interval_ms, 500);
        assert_eq!(config.tracker.poll_interval_secs, 5);
        assert_eq!(config.tracker.max_activity_age_secs, 7200);
        assert_eq!(config.tracker.circuit_breaker_threshold, 5);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_wrong_type_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "max_activation_slots = \"many\"")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_activation_slots, 10);
    }

    #[tokio::test]
    async fn zero_ceilings_are_raised_to_one() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "max_concurrent_phases = 0\nmax_activation_slots = 0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_phases, 1);
        assert_eq!(config.max_activation_slots, 1);
    }
}
