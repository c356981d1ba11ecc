//! Remote sessions: script execution and file transfer on a server.
//!
//! [`Client`] is the capability set workers drive a machine through;
//! [`SshClient`] implements it over the system `ssh`/`sshpass`/`rsync`
//! binaries so no bespoke protocol stack is needed. [`Dialer`] is the seam
//! that produces clients from servers, letting tests substitute an
//! in-memory implementation.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::provider::Server;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by remote sessions.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot connect: {0}")]
    Connect(String),

    /// A traced script exited non-zero; carries the exit status and the
    /// tail of its output.
    #[error("{0}")]
    Script(String),

    #[error("cannot transfer: {0}")]
    Transfer(String),

    #[error("cannot run remote command: {0}")]
    Exec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A line of remote output, tagged by channel.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Connected session to a server.
#[async_trait]
pub trait Client: Send {
    /// The server this session is bound to.
    fn server(&self) -> Arc<dyn Server>;

    /// Re-seats the session on a recovered server identity. Happens at
    /// most once, when a reused address resolves to a typed server.
    fn set_server(&mut self, server: Arc<dyn Server>);

    /// Runs `script` in `dir` with `env`, streaming output as it arrives.
    /// Returns the collected output, or an error on non-zero exit.
    async fn trace(
        &mut self,
        script: &str,
        dir: &str,
        env: &HashMap<String, String>,
    ) -> ClientResult<Vec<u8>>;

    /// Starts an interactive shell at `path` in `dir`.
    async fn shell(
        &mut self,
        path: &str,
        dir: &str,
        env: &HashMap<String, String>,
    ) -> ClientResult<()>;

    /// Copies the local tree at `from` into remote `to`, honoring
    /// include/exclude filter patterns.
    async fn send(
        &mut self,
        from: &Path,
        to: &str,
        include: &[String],
        exclude: &[String],
    ) -> ClientResult<()>;

    async fn write_file(&mut self, path: &str, data: &[u8]) -> ClientResult<()>;

    async fn read_file(&mut self, path: &str) -> ClientResult<Vec<u8>>;

    async fn remove_all(&mut self, path: &str) -> ClientResult<()>;

    /// True when `path` does not exist or is an empty directory.
    async fn missing_or_empty(&mut self, path: &str) -> ClientResult<bool>;

    async fn close(&mut self);
}

/// Produces a connected [`Client`] for a server.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        server: Arc<dyn Server>,
        password: &str,
    ) -> ClientResult<Box<dyn Client>>;
}

/// The production dialer: verifies SSH reachability and hands out an
/// [`SshClient`].
pub struct SshDialer;

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        server: Arc<dyn Server>,
        password: &str,
    ) -> ClientResult<Box<dyn Client>> {
        let mut client = SshClient::new(server, password.to_string());
        client.probe().await?;
        Ok(Box::new(client))
    }
}

/// A session built on the system `ssh` binary; every operation runs a
/// fresh process, so there is no connection state to corrupt.
pub struct SshClient {
    server: Arc<dyn Server>,
    password: String,
}

impl SshClient {
    pub fn new(server: Arc<dyn Server>, password: String) -> Self {
        SshClient { server, password }
    }

    /// Verifies the remote answers and accepts our credentials.
    async fn probe(&mut self) -> ClientResult<()> {
        match self.run_remote("true").await {
            Ok(_) => Ok(()),
            Err(ClientError::Exec(msg)) => Err(ClientError::Connect(msg)),
            Err(e) => Err(e),
        }
    }

    fn host(&self) -> String {
        let address = self.server.address();
        match address.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => address.to_string(),
        }
    }

    fn port(&self) -> Option<String> {
        self.server
            .address()
            .rsplit_once(':')
            .map(|(_, port)| port.to_string())
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(port) = self.port() {
            opts.push("-p".to_string());
            opts.push(port);
        }
        opts
    }

    /// Builds an ssh invocation, wrapped in `sshpass -e` when a password
    /// is set (the password travels via the SSHPASS environment variable,
    /// never argv).
    fn ssh_command(&self) -> tokio::process::Command {
        let mut cmd = if self.password.is_empty() {
            let mut cmd = tokio::process::Command::new("ssh");
            cmd.arg("-o").arg("BatchMode=yes");
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("sshpass");
            cmd.arg("-e").arg("ssh");
            cmd.env("SSHPASS", &self.password);
            cmd
        };
        for opt in self.ssh_options() {
            cmd.arg(opt);
        }
        cmd.arg(format!("root@{}", self.host()));
        cmd
    }

    /// Runs a remote command, capturing output. Errors carry stderr.
    async fn run_remote(&self, command: &str) -> ClientResult<Vec<u8>> {
        let mut cmd = self.ssh_command();
        cmd.arg(command);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ClientError::Exec(format!(
                "{}: {}",
                command_summary(command),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Client for SshClient {
    fn server(&self) -> Arc<dyn Server> {
        self.server.clone()
    }

    fn set_server(&mut self, server: Arc<dyn Server>) {
        self.server = server;
    }

    async fn trace(
        &mut self,
        script: &str,
        dir: &str,
        env: &HashMap<String, String>,
    ) -> ClientResult<Vec<u8>> {
        let mut cmd = self.ssh_command();
        cmd.arg(remote_command(dir, env, "/bin/bash -es"));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Exec("cannot open stdin".to_string()))?;
        stdin.write_all(script.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Exec("cannot capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::Exec("cannot capture stderr".to_string()))?;

        let stdout_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
        let mut merged = stream::select(stdout_lines, stderr_lines);

        let mut output = Vec::new();
        while let Some(line) = merged.next().await {
            let text = match &line {
                OutputLine::Stdout(text) | OutputLine::Stderr(text) => text,
            };
            debug!("[{}] {}", self.server.address(), text);
            output.extend_from_slice(text.as_bytes());
            output.push(b'\n');
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ClientError::Script(script_failure(status.code(), &output)));
        }
        Ok(output)
    }

    async fn shell(
        &mut self,
        path: &str,
        dir: &str,
        env: &HashMap<String, String>,
    ) -> ClientResult<()> {
        let mut cmd = self.ssh_command();
        cmd.arg("-t");
        cmd.arg(remote_command(dir, env, path));
        let status = cmd.status().await?;
        if !status.success() {
            return Err(ClientError::Exec(format!(
                "shell exited with {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }

    async fn send(
        &mut self,
        from: &Path,
        to: &str,
        include: &[String],
        exclude: &[String],
    ) -> ClientResult<()> {
        self.run_remote(&format!("mkdir -p '{}'", escape_single(to)))
            .await
            .map_err(|e| ClientError::Transfer(e.to_string()))?;

        let mut rsh = vec!["ssh".to_string()];
        if !self.password.is_empty() {
            rsh.insert(0, "sshpass -e".to_string());
        }
        rsh.extend(self.ssh_options());
        let mut cmd = tokio::process::Command::new("rsync");
        if !self.password.is_empty() {
            cmd.env("SSHPASS", &self.password);
        }
        cmd.arg("-rlpt");
        for pattern in include {
            cmd.arg(format!("--include={pattern}"));
        }
        for pattern in exclude {
            cmd.arg(format!("--exclude={pattern}"));
        }
        cmd.arg("-e").arg(rsh.join(" "));
        cmd.arg(format!("{}/", from.display()));
        cmd.arg(format!("root@{}:{}/", self.host(), to));

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ClientError::Transfer(format!(
                "rsync failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn write_file(&mut self, path: &str, data: &[u8]) -> ClientResult<()> {
        let mut cmd = self.ssh_command();
        cmd.arg(format!("cat > '{}'", escape_single(path)));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Exec("cannot open stdin".to_string()))?;
        stdin.write_all(data).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ClientError::Transfer(format!(
                "cannot write {}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> ClientResult<Vec<u8>> {
        self.run_remote(&format!("cat '{}'", escape_single(path)))
            .await
            .map_err(|e| ClientError::Transfer(e.to_string()))
    }

    async fn remove_all(&mut self, path: &str) -> ClientResult<()> {
        self.run_remote(&format!("rm -rf '{}'", escape_single(path)))
            .await?;
        Ok(())
    }

    async fn missing_or_empty(&mut self, path: &str) -> ClientResult<bool> {
        let quoted = format!("'{}'", escape_single(path));
        let probe = format!(
            "if [ ! -e {quoted} ]; then echo missing; \
             elif [ -z \"$(ls -A {quoted})\" ]; then echo empty; \
             else echo present; fi"
        );
        let output = self.run_remote(&probe).await?;
        match String::from_utf8_lossy(&output).trim() {
            "missing" | "empty" => Ok(true),
            "present" => Ok(false),
            other => Err(ClientError::Exec(format!("unexpected probe reply {other:?}"))),
        }
    }

    async fn close(&mut self) {
        // Per-operation processes hold no session state.
    }
}

/// Prefixes a remote command with environment exports and a `cd` into the
/// working directory. Env keys are sorted so the command is deterministic.
fn remote_command(dir: &str, env: &HashMap<String, String>, tail: &str) -> String {
    let mut command = String::new();
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        command.push_str(&format!("export {}='{}'; ", key, escape_single(&env[key])));
    }
    if !dir.is_empty() {
        command.push_str(&format!("cd '{}' && ", escape_single(dir)));
    }
    command.push_str(tail);
    command
}

fn escape_single(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// First line of a command, for error messages.
fn command_summary(command: &str) -> &str {
    command.lines().next().unwrap_or(command)
}

/// Renders a script failure with its exit status and the output tail.
fn script_failure(code: Option<i32>, output: &[u8]) -> String {
    let mut message = match code {
        Some(code) => format!("script returned exit code {code}"),
        None => "script was killed".to_string(),
    };
    let text = String::from_utf8_lossy(output);
    let lines: Vec<&str> = text.lines().collect();
    if !lines.is_empty() {
        let tail = &lines[lines.len().saturating_sub(10)..];
        message.push_str("; last output:\n    ");
        message.push_str(&tail.join("\n    "));
    }
    message
}
