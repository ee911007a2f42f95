use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Binaries the agent is allowed to shell out to, besides configured
/// scanner binaries. Arguments are always built from validated fields,
/// never raw repo content.
const ALLOWED_COMMANDS: &[&str] = &["git", "go", "npm", "docker"];

/// Check a command against the allow-list. `extra` carries the configured
/// scanner binary names.
pub fn ensure_allowed(command: &str, extra: &[String]) -> Result<()> {
    let stem = PathBuf::from(command)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if ALLOWED_COMMANDS.contains(&stem.as_str()) || extra.iter().any(|e| *e == stem) {
        return Ok(());
    }
    Err(Error::Process(format!("command not allow-listed: {command}")))
}

/// Configuration for spawning a child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
    /// When false, captured output lines are not echoed to the log. Scanner
    /// JSON can run to megabytes.
    pub log_output: bool,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir,
            timeout: None,
            log_prefix: String::new(),
            env: Vec::new(),
            log_output: false,
        }
    }
}

/// Output from a completed child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    fn from_status(status: std::process::ExitStatus, stdout: String, stderr: String) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal: Option<i32> = None;

        // A signal death carries no exit code; report it the way a shell
        // would, as 128 plus the signal number.
        let exit_code = match (status.code(), signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        };

        Self {
            exit_code,
            signal,
            stdout,
            stderr,
        }
    }
}

/// Spawn a child process, capture its output, and wait under a timeout and a
/// cancellation token.
///
/// The child is placed in its own process group on Unix; on timeout or
/// cancellation the whole group receives SIGTERM, then SIGKILL.
pub async fn spawn_and_collect(
    config: ProcessConfig,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix.clone();
    let log_output = config.log_output;

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if log_output {
                debug!("[{prefix_out}] {line}");
            }
            lines.push(line);
        }
        lines.join("\n")
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if log_output {
                warn!("[{prefix_err}] {line}");
            }
            lines.push(line);
        }
        lines.join("\n")
    });

    let kill_group = |sig: i32| {
        #[cfg(unix)]
        unsafe {
            libc::killpg(pid as i32, sig);
        }
        #[cfg(not(unix))]
        let _ = sig;
    };

    let wait = async {
        if let Some(dur) = config.timeout {
            match tokio::time::timeout(dur, child.wait()).await {
                Ok(r) => r.map_err(|e| Error::Process(format!("wait error: {e}"))),
                Err(_) => Err(Error::Process(format!(
                    "'{}' timed out after {dur:?}",
                    config.command
                ))),
            }
        } else {
            child
                .wait()
                .await
                .map_err(|e| Error::Process(format!("wait error: {e}")))
        }
    };

    let status = tokio::select! {
        status = wait => status,
        _ = cancel.cancelled() => {
            kill_group(libc::SIGTERM);
            tokio::time::sleep(Duration::from_millis(500)).await;
            kill_group(libc::SIGKILL);
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Cancelled);
        }
    };

    let status = match status {
        Ok(s) => s,
        Err(e) => {
            kill_group(libc::SIGTERM);
            tokio::time::sleep(Duration::from_millis(500)).await;
            kill_group(libc::SIGKILL);
            stdout_task.abort();
            stderr_task.abort();
            return Err(e);
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    Ok(ProcessOutput::from_status(status, stdout, stderr))
}

/// Run a git command in a directory, failing on non-zero exit.
pub async fn run_git(dir: &std::path::Path, args: &[&str], cancel: &CancellationToken) -> Result<String> {
    let config = ProcessConfig {
        command: "git".to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        working_dir: dir.to_path_buf(),
        timeout: Some(Duration::from_secs(300)),
        log_prefix: "git".to_string(),
        env: Vec::new(),
        log_output: false,
    };
    let output = spawn_and_collect(config, cancel).await?;
    if !output.success() {
        return Err(Error::Process(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(command: &str, args: &[&str]) -> ProcessConfig {
        ProcessConfig::new(
            command,
            args.iter().map(|s| s.to_string()).collect(),
            std::env::temp_dir(),
        )
    }

    #[test]
    fn test_ensure_allowed_base_commands() {
        assert!(ensure_allowed("git", &[]).is_ok());
        assert!(ensure_allowed("/usr/bin/git", &[]).is_ok());
        assert!(ensure_allowed("npm", &[]).is_ok());
        assert!(ensure_allowed("docker", &[]).is_ok());
        assert!(ensure_allowed("rm", &[]).is_err());
        assert!(ensure_allowed("curl", &[]).is_err());
    }

    #[test]
    fn test_ensure_allowed_scanner_binaries() {
        let scanners = vec!["trivy".to_string(), "gitleaks".to_string()];
        assert!(ensure_allowed("trivy", &scanners).is_ok());
        assert!(ensure_allowed("/opt/bin/gitleaks", &scanners).is_ok());
        assert!(ensure_allowed("semgrep", &scanners).is_err());
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout() {
        let cancel = CancellationToken::new();
        let out = spawn_and_collect(cfg("echo", &["hello"]), &cancel).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_spawn_nonzero_exit() {
        let cancel = CancellationToken::new();
        let out = spawn_and_collect(cfg("false", &[]), &cancel).await.unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_errors() {
        let cancel = CancellationToken::new();
        let err = spawn_and_collect(cfg("ctrlscan-no-such-binary", &[]), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_spawn_timeout_kills_child() {
        let cancel = CancellationToken::new();
        let mut config = cfg("sleep", &["30"]);
        config.timeout = Some(Duration::from_millis(200));
        let err = spawn_and_collect(config, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_spawn_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = spawn_and_collect(cfg("sleep", &["30"]), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
