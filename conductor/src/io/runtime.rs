//! Environment and session runtimes.
//!
//! Environments are containers driven through a docker-compatible CLI;
//! sessions are tmux sessions. Both are addressed only by their
//! deterministic names, so a restarted controller finds the same processes.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info, instrument};

use super::config::RuntimeConfig;
use super::process::{CommandOutput, run_command_with_timeout};

const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Everything needed to create an isolated environment.
#[derive(Debug, Clone)]
pub struct EnvironmentRequest<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub ports: &'a [u16],
    pub mounts: &'a [String],
    pub env: Vec<(String, String)>,
    /// Host directory mounted as the environment's working directory.
    pub workdir: &'a Path,
}

/// Everything needed to start one session.
#[derive(Debug, Clone)]
pub struct SessionRequest<'a> {
    pub name: &'a str,
    pub command: &'a [String],
    pub workdir: &'a Path,
    pub env: Vec<(String, String)>,
    /// Run the command inside this environment instead of on the host.
    pub environment: Option<&'a str>,
}

pub trait EnvironmentRuntime {
    fn exists(&self, name: &str) -> Result<bool>;
    fn create(&self, request: &EnvironmentRequest<'_>) -> Result<()>;
    /// Remove the environment; removing a missing one is not an error.
    fn destroy(&self, name: &str) -> Result<()>;
    /// Run a command inside the environment; a non-zero exit is an error.
    fn exec(&self, name: &str, command: &[String]) -> Result<()>;
}

pub trait SessionRuntime {
    fn exists(&self, name: &str) -> Result<bool>;
    fn create(&self, request: &SessionRequest<'_>) -> Result<()>;
    /// Kill the session; killing a missing one is not an error.
    fn destroy(&self, name: &str) -> Result<()>;
    /// Last `lines` lines of session output.
    fn capture(&self, name: &str, lines: usize) -> Result<String>;
    /// Type `keys` into the session followed by Enter.
    fn send_keys(&self, name: &str, keys: &str) -> Result<()>;
}

/// [`EnvironmentRuntime`] backed by `docker`, `podman` or another compatible CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    binary: String,
    timeout: Duration,
}

impl ContainerRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            binary: config.environment_binary.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }
}

impl EnvironmentRuntime for ContainerRuntime {
    fn exists(&self, name: &str) -> Result<bool> {
        let output = run_tool(
            &self.binary,
            &["inspect", "--format", "{{.State.Running}}", name],
            self.timeout,
        )?;
        Ok(output.success() && output.stdout_text().trim() == "true")
    }

    #[instrument(skip_all, fields(name = request.name, image = request.image))]
    fn create(&self, request: &EnvironmentRequest<'_>) -> Result<()> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            request.name.to_string(),
            "-v".to_string(),
            format!("{}:/workspace", request.workdir.display()),
            "-w".to_string(),
            "/workspace".to_string(),
        ];
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in request.ports {
            args.push("-p".to_string());
            args.push(format!("{port}:{port}"));
        }
        for mount in request.mounts {
            args.push("-v".to_string());
            args.push(mount.clone());
        }
        args.extend([
            request.image.to_string(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_tool(&self.binary, &args, self.timeout)?;
        if !output.success() {
            bail!(
                "create environment '{}': {}",
                request.name,
                output.summary()
            );
        }
        info!("environment created");
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    fn destroy(&self, name: &str) -> Result<()> {
        let output = run_tool(&self.binary, &["rm", "-f", name], self.timeout)?;
        if !output.success() && !String::from_utf8_lossy(&output.stderr).contains("No such") {
            bail!("destroy environment '{name}': {}", output.summary());
        }
        debug!("environment destroyed");
        Ok(())
    }

    fn exec(&self, name: &str, command: &[String]) -> Result<()> {
        let mut args = vec!["exec", name];
        args.extend(command.iter().map(String::as_str));
        let output = run_tool(&self.binary, &args, self.timeout)?;
        if !output.success() {
            bail!(
                "'{}' in environment '{name}': {}",
                command.join(" "),
                output.summary()
            );
        }
        Ok(())
    }
}

/// [`SessionRuntime`] backed by tmux.
#[derive(Debug, Clone)]
pub struct TmuxRuntime {
    binary: String,
    environment_binary: String,
    timeout: Duration,
}

impl TmuxRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            binary: "tmux".to_string(),
            environment_binary: config.environment_binary.clone(),
            timeout: Duration::from_secs(30),
        }
    }

    /// The argv a session runs: the role command, wrapped in `<binary> exec` for isolated items.
    fn session_argv(&self, request: &SessionRequest<'_>) -> Vec<String> {
        let Some(environment) = request.environment else {
            return request.command.to_vec();
        };
        let mut argv = vec![
            self.environment_binary.clone(),
            "exec".to_string(),
            "-it".to_string(),
        ];
        for (key, value) in &request.env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push(environment.to_string());
        argv.extend(request.command.iter().cloned());
        argv
    }
}

impl SessionRuntime for TmuxRuntime {
    fn exists(&self, name: &str) -> Result<bool> {
        let output = run_tool(&self.binary, &["has-session", "-t", name], self.timeout)?;
        Ok(output.success())
    }

    #[instrument(skip_all, fields(name = request.name, environment = ?request.environment))]
    fn create(&self, request: &SessionRequest<'_>) -> Result<()> {
        let mut args = vec![
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            request.name.to_string(),
            "-c".to_string(),
            request.workdir.display().to_string(),
        ];
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend(self.session_argv(request));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_tool(&self.binary, &args, self.timeout)?;
        if !output.success() {
            bail!("create session '{}': {}", request.name, output.summary());
        }
        info!("session created");
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    fn destroy(&self, name: &str) -> Result<()> {
        let output = run_tool(&self.binary, &["kill-session", "-t", name], self.timeout)?;
        if !output.success() && self.exists(name)? {
            bail!("destroy session '{name}': {}", output.summary());
        }
        Ok(())
    }

    fn capture(&self, name: &str, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        let output = run_tool(
            &self.binary,
            &["capture-pane", "-p", "-t", name, "-S", &start],
            self.timeout,
        )?;
        if !output.success() {
            bail!("capture session '{name}': {}", output.summary());
        }
        Ok(output.stdout_text())
    }

    fn send_keys(&self, name: &str, keys: &str) -> Result<()> {
        for args in [
            vec!["send-keys", "-t", name, "-l", keys],
            vec!["send-keys", "-t", name, "Enter"],
        ] {
            let output = run_tool(&self.binary, &args, self.timeout)?;
            if !output.success() {
                bail!("send keys to session '{name}': {}", output.summary());
            }
        }
        Ok(())
    }
}

fn run_tool(binary: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    debug!(binary, args = %args.join(" "), "runtime command");
    let mut cmd = Command::new(binary);
    cmd.args(args);
    run_command_with_timeout(cmd, None, timeout, OUTPUT_LIMIT_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolated_sessions_exec_into_their_environment() {
        let runtime = TmuxRuntime::new(&RuntimeConfig::default());
        let command = vec!["claude".to_string()];
        let workdir = Path::new("/tmp");
        let request = SessionRequest {
            name: "acme-coder-7",
            command: &command,
            workdir,
            env: vec![("CONDUCTOR_ROLE".to_string(), "coder".to_string())],
            environment: Some("acme-env-7"),
        };
        assert_eq!(
            runtime.session_argv(&request),
            vec![
                "docker",
                "exec",
                "-it",
                "-e",
                "CONDUCTOR_ROLE=coder",
                "acme-env-7",
                "claude"
            ]
        );

        let host = SessionRequest {
            environment: None,
            ..request
        };
        assert_eq!(runtime.session_argv(&host), vec!["claude"]);
    }
}
