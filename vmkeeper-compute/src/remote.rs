//! Remote command execution over the OpenSSH client.
//!
//! [`OpenSshExecutor`] drives the system `ssh`/`scp` binaries, adding
//! `sshpass -e` in front when a password is set. Session failures are
//! classified from the client's exit status (255 for ssh/scp, 5 for a
//! rejected sshpass password) and its stderr.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::SessionError;
use crate::traits::CommandExecutor;

/// Exit status the OpenSSH client uses for its own errors.
const SSH_CLIENT_ERROR: i32 = 255;

/// Exit status of sshpass for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// Options for one remote session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Password authentication
    pub password: Option<String>,
    /// Private key files
    pub keys: Vec<PathBuf>,
    /// Private keys held in memory
    pub key_data: Vec<String>,
    pub port: Option<u16>,
    /// ProxyCommand, `%h`/`%p` expanded by ssh
    pub proxy_command: Option<String>,
    /// Connect/overall timeout for the session
    pub timeout: Option<Duration>,
    /// Skip host key verification
    pub no_verify: bool,
}

/// Outcome of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Proxy command that tunnels through the hypervisor host.
pub fn proxy_command(hypervisor_host: &str, hypervisor_user: Option<&str>) -> String {
    let user = hypervisor_user
        .map(|u| format!("-l {} ", u))
        .unwrap_or_default();
    format!("ssh {}{} nc %h %p", user, hypervisor_host)
}

/// Executor backed by the OpenSSH client binaries.
#[derive(Debug, Clone)]
pub struct OpenSshExecutor {
    ssh_path: String,
    scp_path: String,
    sshpass_path: String,
}

impl Default for OpenSshExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenSshExecutor {
    pub fn new() -> Self {
        Self {
            ssh_path: "ssh".to_string(),
            scp_path: "scp".to_string(),
            sshpass_path: "sshpass".to_string(),
        }
    }

    /// Use a specific ssh binary.
    pub fn with_ssh(mut self, path: impl Into<String>) -> Self {
        self.ssh_path = path.into();
        self
    }

    /// Use a specific scp binary.
    pub fn with_scp(mut self, path: impl Into<String>) -> Self {
        self.scp_path = path.into();
        self
    }

    /// Options shared by ssh and scp. Returned key files must outlive the
    /// spawned process.
    fn common_args(
        options: &SessionOptions,
    ) -> Result<(Vec<String>, Vec<NamedTempFile>), SessionError> {
        let mut args = Vec::new();
        let mut key_files = Vec::new();

        if options.password.is_none() {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        if let Some(timeout) = options.timeout {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        if options.no_verify {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }
        if let Some(proxy) = &options.proxy_command {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={}", proxy));
        }
        for key in &options.keys {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        for data in &options.key_data {
            // NamedTempFile is created 0600, which ssh requires for keys
            let mut file = NamedTempFile::new()
                .map_err(|e| SessionError::Other(format!("failed to stage key: {}", e)))?;
            file.write_all(data.as_bytes())
                .map_err(|e| SessionError::Other(format!("failed to stage key: {}", e)))?;
            args.push("-i".to_string());
            args.push(file.path().to_string_lossy().to_string());
            key_files.push(file);
        }

        Ok((args, key_files))
    }

    fn command(&self, program: &str, options: &SessionOptions) -> Command {
        let mut cmd = match &options.password {
            Some(password) => {
                let mut cmd = Command::new(&self.sshpass_path);
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            None => Command::new(program),
        };
        cmd.kill_on_drop(true);
        cmd
    }

    async fn output(mut cmd: Command, timeout: Option<Duration>) -> Result<Output, SessionError> {
        let fut = cmd.output();
        let output = match timeout {
            // The session timeout covers connect; allow the command itself a bit longer.
            Some(t) => tokio::time::timeout(t * 2, fut)
                .await
                .map_err(|_| SessionError::Timeout)?,
            None => fut.await,
        };
        output.map_err(|e| SessionError::Other(format!("failed to spawn ssh client: {}", e)))
    }
}

/// Map a failed client invocation to a session error, if it is one.
pub(crate) fn classify_session_failure(
    status: Option<i32>,
    stderr: &str,
    with_password: bool,
) -> Option<SessionError> {
    if with_password && status == Some(SSHPASS_BAD_PASSWORD) {
        return Some(SessionError::AuthenticationFailed);
    }
    if status != Some(SSH_CLIENT_ERROR) {
        return None;
    }

    let lower = stderr.to_lowercase();
    let err = if lower.contains("connection refused") {
        SessionError::ConnectionRefused
    } else if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("too many authentication failures")
    {
        SessionError::AuthenticationFailed
    } else if lower.contains("timed out") {
        SessionError::Timeout
    } else {
        SessionError::Other(stderr.trim().to_string())
    };
    Some(err)
}

fn destination(host: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!("{}@{}", user, host),
        None => host.to_string(),
    }
}

#[async_trait]
impl CommandExecutor for OpenSshExecutor {
    #[instrument(skip(self, options, commands), fields(host = %host, count = commands.len()))]
    async fn run(
        &self,
        host: &str,
        user: Option<&str>,
        options: &SessionOptions,
        commands: &[String],
    ) -> Result<Vec<CommandResult>, SessionError> {
        let mut results = Vec::with_capacity(commands.len());

        for command in commands {
            let (args, _key_files) = Self::common_args(options)?;
            let mut cmd = self.command(&self.ssh_path, options);
            cmd.args(&args);
            if let Some(port) = options.port {
                cmd.arg("-p").arg(port.to_string());
            }
            cmd.arg(destination(host, user)).arg(command);

            debug!(command = %command, "Running remote command");
            let output = Self::output(cmd, options.timeout).await?;
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if let Some(err) =
                classify_session_failure(output.status.code(), &stderr, options.password.is_some())
            {
                warn!(error = %err, "ssh session failed");
                return Err(err);
            }

            results.push(CommandResult {
                command: command.clone(),
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr,
            });
        }

        Ok(results)
    }

    #[instrument(skip(self, options), fields(host = %host, local = %local_path.display()))]
    async fn upload(
        &self,
        host: &str,
        user: Option<&str>,
        options: &SessionOptions,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SessionError> {
        let (args, _key_files) = Self::common_args(options)?;
        let mut cmd = self.command(&self.scp_path, options);
        cmd.args(&args);
        if let Some(port) = options.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg(local_path)
            .arg(format!("{}:{}", destination(host, user), remote_path));

        let output = Self::output(cmd, options.timeout).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(
            classify_session_failure(output.status.code(), &stderr, options.password.is_some())
                .unwrap_or_else(|| SessionError::Other(stderr.trim().to_string())),
        )
    }
}
