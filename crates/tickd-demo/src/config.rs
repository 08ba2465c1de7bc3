//! Daemon configuration, loaded from YAML.
//!
//! ```yaml
//! name: tickd-demo
//! poll_timeout_ms: 10
//! timers:
//!   - name: heartbeat
//!     interval_ms: 1000
//!     repeat: true
//!   - name: warmup
//!     interval_ms: 250
//!     max_fires: 1
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tickd::RuntimeConfig;

use crate::error::DemoError;

/// Longest poll timeout accepted; the loop must stay responsive to signals.
const MAX_POLL_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemoConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub timers: Vec<TimerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerSpec {
    pub name: String,
    pub interval_ms: u64,
    #[serde(default)]
    pub repeat: bool,
    /// Release the timer after this many expirations.
    #[serde(default)]
    pub max_fires: Option<u32>,
}

fn default_name() -> String {
    "tickd-demo".into()
}

fn default_poll_timeout_ms() -> u64 {
    10
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            poll_timeout_ms: default_poll_timeout_ms(),
            timers: vec![TimerSpec {
                name: "heartbeat".into(),
                interval_ms: 1000,
                repeat: true,
                max_fires: None,
            }],
        }
    }
}

impl DemoConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, DemoError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DemoError::Config(format!("read {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| DemoError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let config: Self = serde_yaml_ng::from_str(content).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.poll_timeout_ms > MAX_POLL_TIMEOUT_MS {
            return Err(format!(
                "poll_timeout_ms {} exceeds {MAX_POLL_TIMEOUT_MS}",
                self.poll_timeout_ms
            ));
        }
        let mut seen = HashSet::new();
        for timer in &self.timers {
            if timer.name.trim().is_empty() {
                return Err("timer name must not be empty".into());
            }
            if !seen.insert(timer.name.as_str()) {
                return Err(format!("duplicate timer name: {}", timer.name));
            }
            if timer.max_fires == Some(0) {
                return Err(format!("timer {}: max_fires must be at least 1", timer.name));
            }
        }
        Ok(())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::default().with_poll_timeout(Duration::from_millis(self.poll_timeout_ms))
    }
}

impl TimerSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = DemoConfig::parse(
            r#"
name: edge
poll_timeout_ms: 25
timers:
  - name: heartbeat
    interval_ms: 1000
    repeat: true
  - name: warmup
    interval_ms: 0
    max_fires: 1
"#,
        )
        .unwrap();

        assert_eq!(config.name, "edge");
        assert_eq!(config.runtime_config().poll_timeout, Duration::from_millis(25));
        assert!(config.runtime_config().install_signal_handlers);
        assert_eq!(config.timers.len(), 2);
        assert!(config.timers[0].repeat);
        assert!(!config.timers[1].repeat);
        assert_eq!(config.timers[1].interval(), Duration::ZERO);
        assert_eq!(config.timers[1].max_fires, Some(1));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = DemoConfig::parse("timers: []\n").unwrap();
        assert_eq!(config.name, "tickd-demo");
        assert_eq!(config.poll_timeout_ms, 10);
        assert!(config.timers.is_empty());
    }

    #[test]
    fn default_config_is_valid() {
        let config = DemoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime_config(), RuntimeConfig::default());
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = DemoConfig::parse("name: x\nthreads: 4\n").unwrap_err();
        assert!(err.contains("threads"), "error was: {err}");
    }

    #[test]
    fn rejects_duplicate_timer_names() {
        let err = DemoConfig::parse(
            "timers:\n  - {name: a, interval_ms: 5}\n  - {name: a, interval_ms: 6}\n",
        )
        .unwrap_err();
        assert!(err.contains("duplicate timer name: a"), "error was: {err}");
    }

    #[test]
    fn rejects_zero_max_fires() {
        let yaml = "timers:\n  - {name: a, interval_ms: 5, max_fires: 0}\n";
        let err = DemoConfig::parse(yaml).unwrap_err();
        assert!(err.contains("max_fires"), "error was: {err}");
    }

    #[test]
    fn rejects_long_poll_timeout() {
        let err = DemoConfig::parse("poll_timeout_ms: 5000\n").unwrap_err();
        assert!(err.contains("poll_timeout_ms"), "error was: {err}");
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.yaml");
        std::fs::write(&path, "name: ''\n").unwrap();

        let err = DemoConfig::load(&path).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("demo.yaml"), "error was: {message}");
        assert!(message.contains("name must not be empty"), "error was: {message}");
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = DemoConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, DemoError::Config(_)));
    }
}
