use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Engine configuration: a TOML file with optional sections, each field
/// overridable through the environment. Missing file means defaults;
/// a file that fails to parse is logged and ignored.
#[derive(Debug, Default, Deserialize)]
pub struct EngineConfig {
    pub pool: Option<PoolSection>,
    pub results: Option<ResultsSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolSection {
    pub workers: Option<usize>,
    pub max_contexts_per_worker: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultsSection {
    pub db_path: Option<String>,
    pub flush_ms: Option<u64>,
    pub retention_days: Option<u64>,
}

impl EngineConfig {
    /// Load from `ENGINE_CONFIG`, then `engine.toml` next to the process,
    /// then fall back to defaults.
    pub fn load() -> Self {
        let path = match Self::find_config_path() {
            Some(path) => path,
            None => return Self::default(),
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Self::default(),
        };

        match toml::from_str::<EngineConfig>(&contents) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("failed to parse {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|err| err.to_string())
    }

    /// Pool configuration: defaults, overlaid with the file's `[pool]`
    /// section, overlaid with environment variables.
    pub fn pool_config(&self) -> pool::PoolConfig {
        let mut config = pool::PoolConfig::default();

        if let Some(section) = &self.pool {
            if let Some(workers) = section.workers {
                config.num_workers = workers;
            }
            if let Some(max_contexts) = section.max_contexts_per_worker {
                config.max_contexts_per_worker = max_contexts;
            }
            if let Some(secs) = section.idle_timeout_secs {
                config.idle_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = section.sweep_interval_secs {
                config.sweep_interval = Duration::from_secs(secs);
            }
        }

        if let Some(workers) = env_parse("POOL_WORKERS") {
            config.num_workers = workers;
        }
        if let Some(max_contexts) = env_parse("POOL_MAX_CONTEXTS") {
            config.max_contexts_per_worker = max_contexts;
        }
        if let Some(secs) = env_parse("POOL_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("POOL_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }

        config
    }

    /// Maximum time a recorded result waits before a flush.
    pub fn flush_window(&self) -> Duration {
        let file_value = self
            .results
            .as_ref()
            .and_then(|section| section.flush_ms);
        let ms = env_parse("RESULTS_FLUSH_MS")
            .or(file_value)
            .unwrap_or(1_000);
        Duration::from_millis(ms)
    }

    pub fn results_db_path(&self) -> PathBuf {
        if let Some(path) = std::env::var_os("RESULTS_DB_PATH") {
            return expand_home_path(&path.to_string_lossy());
        }

        if let Some(path) = self
            .results
            .as_ref()
            .and_then(|section| section.db_path.as_ref())
        {
            return expand_home_path(path);
        }

        default_results_db_path()
    }

    pub fn results_retention_days(&self) -> u64 {
        let file_value = self
            .results
            .as_ref()
            .and_then(|section| section.retention_days);
        env_parse("RESULTS_RETENTION_DAYS").or(file_value).unwrap_or(7)
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ENGINE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("ENGINE_CONFIG set but file not found: {}", path.display());
        }

        let local = PathBuf::from("engine.toml");
        local.exists().then_some(local)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn default_results_db_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".engine")
        .join("results.db")
}

fn expand_home_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = EngineConfig::default();
        let pool_config = config.pool_config();

        assert_eq!(pool_config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.flush_window(), Duration::from_millis(1_000));
        assert_eq!(config.results_retention_days(), 7);
    }

    #[test]
    fn file_values_override_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [pool]
            workers = 3
            idle_timeout_secs = 120

            [results]
            flush_ms = 250
            retention_days = 30
            "#,
        )
        .expect("toml");

        let pool_config = config.pool_config();
        assert_eq!(pool_config.num_workers, 3);
        assert_eq!(pool_config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.flush_window(), Duration::from_millis(250));
        assert_eq!(config.results_retention_days(), 30);
    }

    #[test]
    fn environment_beats_file_values() {
        let config = EngineConfig::from_toml(
            r#"
            [pool]
            sweep_interval_secs = 99
            "#,
        )
        .expect("toml");

        unsafe { std::env::set_var("POOL_SWEEP_INTERVAL_SECS", "7") };
        let pool_config = config.pool_config();
        unsafe { std::env::remove_var("POOL_SWEEP_INTERVAL_SECS") };

        assert_eq!(pool_config.sweep_interval, Duration::from_secs(7));
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(EngineConfig::from_toml("not [valid").is_err());
    }

    #[test]
    fn home_prefix_expands_against_home() {
        unsafe { std::env::set_var("HOME", "/home/tester") };
        let expanded = expand_home_path("~/data/results.db");
        assert_eq!(expanded, PathBuf::from("/home/tester/data/results.db"));
    }
}
