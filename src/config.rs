//! Engine configuration parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::supervisor::{has_flag, FLAG_RESUME, FLAG_SESSION_ID};
use crate::{AppError, Result};

/// Timeouts governing control requests and process termination.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// How long `send_control` waits for the matching `control_response`.
    #[serde(default = "default_control_seconds")]
    pub control_seconds: u64,
    /// Grace period between the polite termination signal and a hard kill.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            control_seconds: default_control_seconds(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

fn default_control_seconds() -> u64 {
    30
}

fn default_terminate_grace_ms() -> u64 {
    2000
}

/// Limits applied to the agent's output streams.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Longest stdout line accepted; longer lines are discarded.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Number of trailing stderr lines kept for exit diagnostics.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_stderr_tail_lines() -> usize {
    20
}

fn default_binary() -> String {
    "claude".into()
}

fn default_state_dir_env() -> String {
    "CLAUDE_CONFIG_DIR".into()
}

/// Everything needed to spawn and drive one agent process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Agent binary to execute.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Caller-supplied arguments, placed before the forced protocol flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the child; inherits ours when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Isolation directory for the agent's session artifacts.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Variable name under which `state_dir` is exported to the child.
    #[serde(default = "default_state_dir_env")]
    pub state_dir_env: String,
    /// Start a brand-new conversation instead of resuming a known one.
    #[serde(default)]
    pub fresh_session: bool,
    /// Control and termination timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Output stream limits.
    #[serde(default)]
    pub stream: StreamConfig,
}

/// The subset of [`EngineConfig`] that an engine fixes at construction.
///
/// Two configs with equal signatures can be served by the same engine. Only
/// `fresh_session` is left out; it matters solely when a new engine is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSignature {
    binary: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    state_dir: Option<PathBuf>,
    state_dir_env: String,
    timeouts: TimeoutConfig,
    stream: StreamConfig,
}

impl EngineConfig {
    /// Build a configuration for `binary` with every other field defaulted.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            state_dir: None,
            state_dir_env: default_state_dir_env(),
            fresh_session: false,
            timeouts: TimeoutConfig::default(),
            stream: StreamConfig::default(),
        }
    }

    /// Append caller arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the isolation directory exported to the child.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Add one environment variable for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants and normalize the working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on the first violated rule.
    pub fn validate(&mut self) -> Result<()> {
        if self.binary.trim().is_empty() {
            return Err(AppError::Config("binary must not be empty".into()));
        }

        if has_flag(&self.args, FLAG_SESSION_ID) && has_flag(&self.args, FLAG_RESUME) {
            return Err(AppError::Config(format!(
                "args must not contain both {FLAG_SESSION_ID} and {FLAG_RESUME}"
            )));
        }

        if self.timeouts.control_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.control_seconds must be greater than zero".into(),
            ));
        }

        if self.stream.max_line_bytes == 0 {
            return Err(AppError::Config(
                "stream.max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.state_dir_env.trim().is_empty() {
            return Err(AppError::Config("state_dir_env must not be empty".into()));
        }

        if let Some(dir) = &self.working_dir {
            let canonical = dir
                .canonicalize()
                .map_err(|err| AppError::Config(format!("working_dir invalid: {err}")))?;
            self.working_dir = Some(canonical);
        }

        Ok(())
    }

    /// Whether the caller asked for a new conversation rather than a resume.
    #[must_use]
    pub fn requests_fresh_session(&self) -> bool {
        self.fresh_session || has_flag(&self.args, FLAG_SESSION_ID)
    }

    /// Fields an engine is built with, used to decide whether it can be reused.
    #[must_use]
    pub fn spawn_signature(&self) -> SpawnSignature {
        SpawnSignature {
            binary: self.binary.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            state_dir: self.state_dir.clone(),
            state_dir_env: self.state_dir_env.clone(),
            timeouts: self.timeouts.clone(),
            stream: self.stream.clone(),
        }
    }

    /// Control-response wait as a [`Duration`].
    #[must_use]
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.control_seconds)
    }

    /// Termination grace period as a [`Duration`].
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.terminate_grace_ms)
    }
}
