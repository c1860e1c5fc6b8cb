use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SequencerConfig
// ---------------------------------------------------------------------------

/// Deadlines and reporting knobs for a transaction run.
///
/// Durations are written as whole milliseconds:
///
/// ```yaml
/// action_timeout_ms: 5000
/// run_timeout_ms: 60000
/// log_rollback_failures: true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Longest a single action may take to report.
    #[serde(
        rename = "action_timeout_ms",
        serialize_with = "serialize_ms_opt",
        deserialize_with = "deserialize_ms_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub action_timeout: Option<Duration>,
    /// Longest the whole run may take before it is rolled back.
    #[serde(
        rename = "run_timeout_ms",
        serialize_with = "serialize_ms_opt",
        deserialize_with = "deserialize_ms_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub run_timeout: Option<Duration>,
    /// Emit a `warn` event when a rollback itself fails.
    #[serde(default = "default_log_rollback_failures")]
    pub log_rollback_failures: bool,
}

fn default_log_rollback_failures() -> bool {
    true
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            action_timeout: None,
            run_timeout: None,
            log_rollback_failures: default_log_rollback_failures(),
        }
    }
}

impl SequencerConfig {
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = Some(timeout);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: SequencerConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_yaml::to_string(self)?;
        atomic_write(path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.action_timeout == Some(Duration::ZERO) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "action_timeout_ms is 0: every action would time out".to_string(),
            });
        }

        if self.run_timeout == Some(Duration::ZERO) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "run_timeout_ms is 0: every run would time out".to_string(),
            });
        }

        if let (Some(action), Some(run)) = (self.action_timeout, self.run_timeout) {
            if action >= run && !run.is_zero() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "action_timeout_ms ({}) is not below run_timeout_ms ({}); \
                         the run deadline always fires first",
                        action.as_millis(),
                        run.as_millis()
                    ),
                });
            }
        }

        if !self.log_rollback_failures {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "log_rollback_failures is off: rollback errors are only \
                          visible on the returned error"
                    .to_string(),
            });
        }

        warnings
    }
}

/// Write `data` to `path` through a tempfile in the same directory.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as milliseconds: u64)
// ---------------------------------------------------------------------------

fn serialize_ms_opt<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match d {
        Some(dur) => s.serialize_some(&(dur.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

fn deserialize_ms_opt<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<u64> = Option::deserialize(d)?;
    Ok(opt.map(Duration::from_millis))
}
