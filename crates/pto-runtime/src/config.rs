//! Runtime configuration.

use pto_core::platform::RUNTIME_MAX_TASKS;
use pto_core::BuildMode;
use std::time::Duration;

/// Environment variable selecting the graph build mode.
pub const BUILD_MODE_ENV: &str = "PTO_AICPU_BUILD_GRAPH_BUILD_MODE";
/// Environment variable selecting the default device.
pub const DEVICE_ID_ENV: &str = "PTO_DEVICE_ID";

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Device selected lazily on first allocation.
    pub device_id: i32,
    /// Default build mode for new runs.
    pub build_mode: BuildMode,
    /// Task-graph capacity of each run.
    pub task_capacity: usize,
    /// How long an idle scheduler thread waits before polling again.
    pub idle_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            build_mode: BuildMode::default(),
            task_capacity: RUNTIME_MAX_TASKS,
            idle_backoff: Duration::from_micros(50),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `PTO_AICPU_BUILD_GRAPH_BUILD_MODE` and
    /// `PTO_DEVICE_ID`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.build_mode = parse_build_mode(
            std::env::var(BUILD_MODE_ENV).ok().as_deref(),
            config.build_mode,
        );
        if let Ok(raw) = std::env::var(DEVICE_ID_ENV) {
            match raw.trim().parse::<i32>() {
                Ok(id) if id >= 0 => config.device_id = id,
                _ => tracing::warn!(value = %raw, "ignoring invalid {DEVICE_ID_ENV}"),
            }
        }
        config
    }

    pub fn with_device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_build_mode(mut self, mode: BuildMode) -> Self {
        self.build_mode = mode;
        self
    }

    pub fn with_task_capacity(mut self, capacity: usize) -> Self {
        self.task_capacity = capacity;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

/// Parse a build-mode setting, falling back to `default` when unset or
/// unrecognised.
pub fn parse_build_mode(value: Option<&str>, default: BuildMode) -> BuildMode {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return default;
    };
    match value.to_ascii_lowercase().as_str() {
        "0" | "sequential" | "serialized" => BuildMode::Serialized,
        "1" | "concurrent" | "overlapped" => BuildMode::Overlapped,
        other => match other.parse::<i64>() {
            Ok(0) => BuildMode::Serialized,
            Ok(_) => BuildMode::Overlapped,
            Err(_) => {
                tracing::warn!(value, "unrecognised build mode, keeping {default:?}");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_mode() {
        let d = BuildMode::Overlapped;
        assert_eq!(parse_build_mode(None, d), BuildMode::Overlapped);
        assert_eq!(parse_build_mode(Some(""), d), BuildMode::Overlapped);
        assert_eq!(parse_build_mode(Some("0"), d), BuildMode::Serialized);
        assert_eq!(parse_build_mode(Some("Sequential"), d), BuildMode::Serialized);
        assert_eq!(parse_build_mode(Some(" serialized "), d), BuildMode::Serialized);
        assert_eq!(parse_build_mode(Some("concurrent"), BuildMode::Serialized), BuildMode::Overlapped);
        assert_eq!(parse_build_mode(Some("7"), BuildMode::Serialized), BuildMode::Overlapped);
        assert_eq!(parse_build_mode(Some("bogus"), BuildMode::Serialized), BuildMode::Serialized);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::default()
            .with_device_id(3)
            .with_build_mode(BuildMode::Serialized)
            .with_task_capacity(16);
        assert_eq!(config.device_id, 3);
        assert_eq!(config.build_mode, BuildMode::Serialized);
        assert_eq!(config.task_capacity, 16);
    }
}
