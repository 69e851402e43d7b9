//! Conductor configuration stored under `.conductor/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::fault::DEFAULT_FAULT_PATTERN;
use crate::core::naming::validate_template;

/// Conductor configuration (TOML).
///
/// Edited by humans and shared by the controller and every agent process.
/// Missing fields default to values that work for a single-host setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Project name used in session/environment names.
    pub project: String,

    /// `{project}-{role}-{id}` style template for session and environment names.
    pub naming_template: String,

    /// Per-item workspace, relative to the repository root.
    pub workspace_template: String,

    pub heartbeat: HeartbeatConfig,
    pub hooks: HookConfig,
    pub sync: SyncConfig,
    pub runtime: RuntimeConfig,
    pub fault: FaultConfig,
    pub forge: ForgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HookConfig {
    /// Default external-command timeout. Commands may run inside a slow environment.
    pub command_timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Redirects allowed between the same pair of stages before escalating.
    pub max_redirects: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote to pull from and push to; `None` keeps the store local.
    pub remote: Option<String>,
    pub branch: String,
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt.
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container CLI used for isolated environments (`docker`, `podman`, ...).
    pub environment_binary: String,
    pub default_image: String,
    /// Attempts to start a session that dies right after creation.
    pub session_start_attempts: u32,
    /// Delay before checking that a freshly created session is still alive.
    pub session_settle_ms: u64,
    /// Lines of session output inspected for fault signatures.
    pub capture_lines: usize,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FaultConfig {
    pub pattern: String,
    /// Used when the signature carries no parseable resume time.
    pub default_backoff_secs: u64,
    pub resume_buffer_secs: u64,
    /// Age past recovery after which a leftover degraded record is an anomaly.
    pub stale_after_secs: u64,
    pub primary_mode: String,
    pub degraded_mode: String,
    /// Keys sent to a session to switch modes; `{mode}` is substituted.
    pub switch_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    /// CI status command; `{pr}` is substituted with the linked pull request.
    pub ci_command: Vec<String>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            project: "conductor".to_string(),
            naming_template: "{project}-{role}-{id}".to_string(),
            workspace_template: ".conductor/worktrees/{id}".to_string(),
            heartbeat: HeartbeatConfig::default(),
            hooks: HookConfig::default(),
            sync: SyncConfig::default(),
            runtime: RuntimeConfig::default(),
            fault: FaultConfig::default(),
            forge: ForgeConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            max_redirects: 5,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: None,
            branch: "main".to_string(),
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment_binary: "docker".to_string(),
            default_image: "ubuntu:24.04".to_string(),
            session_start_attempts: 3,
            session_settle_ms: 500,
            capture_lines: 200,
            command_timeout_secs: 10 * 60,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_FAULT_PATTERN.to_string(),
            default_backoff_secs: 60 * 60,
            resume_buffer_secs: 5 * 60,
            stale_after_secs: 2 * 60 * 60,
            primary_mode: "default".to_string(),
            degraded_mode: "fallback".to_string(),
            switch_template: "/model {mode}".to_string(),
        }
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            ci_command: vec![
                "gh".to_string(),
                "pr".to_string(),
                "checks".to_string(),
                "{pr}".to_string(),
            ],
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(anyhow!("project must not be empty"));
        }
        validate_template(&self.naming_template)?;
        if !self.workspace_template.contains("{id}") {
            return Err(anyhow!("workspace_template must contain {{id}}"));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(anyhow!("heartbeat.interval_secs must be > 0"));
        }
        if self.hooks.command_timeout_secs == 0 {
            return Err(anyhow!("hooks.command_timeout_secs must be > 0"));
        }
        if self.hooks.output_limit_bytes == 0 {
            return Err(anyhow!("hooks.output_limit_bytes must be > 0"));
        }
        if self.hooks.max_redirects == 0 {
            return Err(anyhow!("hooks.max_redirects must be > 0"));
        }
        if self.sync.max_attempts == 0 {
            return Err(anyhow!("sync.max_attempts must be > 0"));
        }
        if self.runtime.session_start_attempts == 0 {
            return Err(anyhow!("runtime.session_start_attempts must be > 0"));
        }
        if self.runtime.environment_binary.trim().is_empty() {
            return Err(anyhow!("runtime.environment_binary must not be empty"));
        }
        Regex::new(&self.fault.pattern)
            .map_err(|err| anyhow!("fault.pattern is not a valid regex: {err}"))?;
        if self.forge.ci_command.is_empty() || self.forge.ci_command[0].trim().is_empty() {
            return Err(anyhow!("forge.ci_command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hooks.command_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
