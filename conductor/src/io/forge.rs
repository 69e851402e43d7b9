//! Pull-request CI status through a configurable forge command.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use super::config::ForgeConfig;
use super::process::{command_from_argv, run_command_with_timeout};

/// Exit code `gh pr checks` uses for checks that are still running.
const PENDING_EXIT: i32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiStatus {
    Passing,
    Pending,
    Failing(String),
}

pub trait Forge {
    fn ci_status(&self, pull_request: &str, workdir: &Path) -> Result<CiStatus>;
}

/// Runs `forge.ci_command` with `{pr}` substituted.
#[derive(Debug, Clone)]
pub struct CommandForge {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandForge {
    pub fn new(config: &ForgeConfig, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command: config.ci_command.clone(),
            timeout,
            output_limit_bytes,
        }
    }
}

impl Forge for CommandForge {
    #[instrument(skip_all, fields(pull_request))]
    fn ci_status(&self, pull_request: &str, workdir: &Path) -> Result<CiStatus> {
        let argv: Vec<String> = self
            .command
            .iter()
            .map(|arg| arg.replace("{pr}", pull_request))
            .collect();
        let cmd = command_from_argv(&argv, workdir)?;
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)?;
        debug!(exit_code = ?output.code(), "ci status command finished");
        Ok(match output.code() {
            Some(0) => CiStatus::Passing,
            Some(PENDING_EXIT) => CiStatus::Pending,
            _ => CiStatus::Failing(output.summary()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forge(script: &str) -> CommandForge {
        CommandForge::new(
            &ForgeConfig {
                ci_command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            },
            Duration::from_secs(10),
            4096,
        )
    }

    #[test]
    fn exit_codes_map_to_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            forge("exit 0").ci_status("12", temp.path()).expect("status"),
            CiStatus::Passing
        );
        assert_eq!(
            forge("exit 8").ci_status("12", temp.path()).expect("status"),
            CiStatus::Pending
        );
        assert!(matches!(
            forge("echo 'lint failed' >&2; exit 1")
                .ci_status("12", temp.path())
                .expect("status"),
            CiStatus::Failing(reason) if reason.contains("lint failed")
        ));
    }

    #[test]
    fn pull_request_is_substituted() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            forge("test \"{pr}\" = 12")
                .ci_status("12", temp.path())
                .expect("status"),
            CiStatus::Passing
        );
    }
}
