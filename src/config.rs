//! Sequencer configuration using Figment.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `DAQSEQ_`
//! 2. TOML configuration file (default: `config/sequencer.toml`, optional)
//! 3. Built-in defaults
//!
//! Nested keys are separated by a double underscore so that field names
//! containing underscores survive:
//!
//! ```text
//! DAQSEQ_APPLICATION__LOG_LEVEL=debug
//! DAQSEQ_WORKER__TICK=100ms
//! DAQSEQ_ENGINE__EVENT_CAPACITY=1024
//! ```

use crate::error::{AppResult, SequencerError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/sequencer.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SequencerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Coordinator settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Wait-condition worker settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name, shown in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Capacity of the engine event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Capacity of the command channel of a spawned engine
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

/// Wait-condition worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Polling period of active wait conditions
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,
}

fn default_name() -> String {
    "daq_sequencer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    64
}

fn default_tick() -> Duration {
    Duration::from_millis(300)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { tick: default_tick() }
    }
}

impl SequencerConfig {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults and environment variables
    /// still apply. The merged result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQSEQ_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Worker tick is non-zero
    /// - Channel capacities are non-zero
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SequencerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.worker.tick.is_zero() {
            return Err(SequencerError::Configuration(
                "worker.tick must be greater than zero".to_string(),
            ));
        }

        if self.engine.event_capacity == 0 {
            return Err(SequencerError::Configuration(
                "engine.event_capacity must be greater than zero".to_string(),
            ));
        }

        if self.engine.command_capacity == 0 {
            return Err(SequencerError::Configuration(
                "engine.command_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = SequencerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.tick, Duration::from_millis(300));
        assert_eq!(config.engine.event_capacity, 256);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "raman-bench"
log_level = "debug"

[worker]
tick = "50ms"
"#
        )
        .unwrap();

        let config = SequencerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "raman-bench");
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.worker.tick, Duration::from_millis(50));
        assert_eq!(config.engine.command_capacity, 64);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        // Jail serializes this with the environment test.
        figment::Jail::expect_with(|_| {
            let config = SequencerConfig::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(config, SequencerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "sequencer.toml",
                r#"
[application]
log_level = "debug"

[worker]
tick = "500ms"
"#,
            )?;
            jail.set_env("DAQSEQ_WORKER__TICK", "50ms");
            jail.set_env("DAQSEQ_ENGINE__EVENT_CAPACITY", "1024");

            let config = SequencerConfig::load_from("sequencer.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.worker.tick, Duration::from_millis(50));
            assert_eq!(config.engine.event_capacity, 1024);
            assert_eq!(config.application.log_level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = SequencerConfig::default();
        config.application.log_level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let mut config = SequencerConfig::default();
        config.worker.tick = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
