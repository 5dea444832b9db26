//! Git command executor.
//!
//! Wraps `git` subprocess calls with optional timeouts and a non-interactive
//! mode that makes credential prompts fail instead of blocking. All methods
//! are async via `tokio::process::Command`.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{GardenError, Result};

/// Environment that turns interactive git/ssh prompts into failures.
const NO_PROMPT_ENV: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GIT_SSH_COMMAND", "ssh -o BatchMode=yes"),
    ("GCM_INTERACTIVE", "never"),
];

/// Stderr fragments git and ssh print when credentials are missing or rejected.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "could not read Username",
    "could not read Password",
    "terminal prompts disabled",
    "Authentication failed",
    "Permission denied (publickey",
    "Host key verification failed",
];

/// Git command executor.
#[derive(Debug, Clone)]
pub struct GitExecutor {
    /// Path to the git binary.
    git_path: String,
    /// Command timeout. `None` waits indefinitely.
    timeout: Option<Duration>,
    /// Extra environment for every invocation.
    env: Vec<(String, String)>,
    /// `-c key=value` settings for every invocation.
    config: Vec<String>,
}

impl Default for GitExecutor {
    fn default() -> Self {
        Self {
            git_path: "git".into(),
            timeout: None,
            env: Vec::new(),
            config: Vec::new(),
        }
    }
}

impl GitExecutor {
    /// Create an executor that aborts commands running longer than `timeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Return a copy that fails instead of prompting for credentials.
    pub fn non_interactive(&self) -> Self {
        let mut exec = self.clone();
        exec.env.extend(
            NO_PROMPT_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        exec
    }

    /// Return a copy that passes `-c key=value` to every command. Git hands
    /// these down to the commands it spawns itself, e.g. submodule clones.
    pub fn with_config(&self, key: &str, value: &str) -> Self {
        let mut exec = self.clone();
        exec.config.push(format!("{}={}", key, value));
        exec
    }

    /// Run git in `cwd` and return the raw process output, successful or not.
    pub async fn output(&self, cwd: &Path, args: &[&str]) -> Result<Output> {
        debug!(cwd = %cwd.display(), args = ?args, "Running git command");

        let mut cmd = Command::new(&self.git_path);
        for setting in &self.config {
            cmd.arg("-c").arg(setting);
        }
        cmd.args(args)
            .current_dir(cwd)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| {
                    GardenError::Runtime(format!(
                        "git {} timed out after {}s",
                        args.join(" "),
                        timeout.as_secs()
                    ))
                })?,
            None => cmd.output().await,
        };

        output.map_err(|e| {
            GardenError::Runtime(format!(
                "Failed to run git in {}: {}",
                cwd.display(),
                e
            ))
        })
    }

    /// Run git in `cwd`, returning stdout on success.
    pub async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = self.output(cwd, args).await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(GardenError::Runtime(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    /// Run git in `cwd` and split NUL-terminated stdout (`-z` output).
    pub async fn run_z(&self, cwd: &Path, args: &[&str]) -> Result<Vec<String>> {
        let stdout = self.run(cwd, args).await?;
        Ok(split_nul(&stdout))
    }
}

/// Split `-z` output into its non-empty records.
pub fn split_nul(stdout: &str) -> Vec<String> {
    stdout
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Whether a git error message looks like a credential/authentication failure.
pub fn is_auth_failure(message: &str) -> bool {
    AUTH_FAILURE_MARKERS.iter().any(|m| message.contains(m))
}

/// Whether a git error message means the directory is not inside a repository.
pub fn is_not_a_repository(message: &str) -> bool {
    message.contains("not a git repository")
}
