//! Async driver for the system `git` binary.
//!
//! Every invocation goes through [`GitCli::run`], which hardens the child
//! environment against interactive credential prompts, captures stdout and
//! stderr into one combined buffer, and watches that buffer for prompt text
//! that slipped through anyway (e.g. an ssh build that ignores
//! `SSH_ASKPASS`). On the first prompt match the whole child process group
//! is killed and the call reports [`CliError::PromptDetected`].
//!
//! The child is started in its own process group so cancellation and
//! timeouts can take down helpers (ssh, credential helpers, remote-https)
//! together with the main process.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Mutex, OnceCell},
};
use tokio_util::sync::CancellationToken;
use utils::shell::resolve_executable_path;

#[derive(Debug, Clone, Error)]
pub enum CliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("failed to spawn git: {0}")]
    Spawn(String),
    #[error("i/o error while running git: {0}")]
    Io(String),
    #[error("operation canceled")]
    Canceled,
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    #[error("credential prompt detected")]
    PromptDetected { output: String },
    #[error("git exited with code {exit_code:?}")]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
}

impl CliError {
    /// Cancellation and deadline failures are expected during shutdown and
    /// are logged at trace level rather than as listener errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CliError::Canceled | CliError::DeadlineExceeded(_))
    }
}

/// Prompt text that means git (or a transport helper underneath it) is
/// waiting for interactive input. Matched against the tail of the combined
/// output because prompts are not newline-terminated.
static PROMPT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?m)^Password:\s*$",
        r"'s password:\s*$",
        r"Password for '[^']*':\s*$",
        r"Username for '[^']*':\s*$",
        r"Enter passphrase for key '[^']*':\s*$",
        r"Enter PIN for '[^']*':\s*$",
        r"Enter PIN for .+ key .*:\s*$",
        r"2FA Token",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("prompt pattern must compile"))
    .collect()
});

/// Environment overrides applied to every child. Prompts are disabled on
/// all transports, ssh runs in batch mode with a single attempt and a short
/// connect timeout, stalled HTTP transfers abort, and the locale is pinned
/// so error classification sees stable text.
const HARDENED_ENV: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GIT_ASKPASS", ""),
    ("SSH_ASKPASS", ""),
    (
        "GIT_SSH_COMMAND",
        "ssh -oBatchMode=yes -oConnectTimeout=10 -oNumberOfPasswordPrompts=1",
    ),
    ("GIT_HTTP_LOW_SPEED_LIMIT", "1000"),
    ("GIT_HTTP_LOW_SPEED_TIME", "60"),
    ("LC_ALL", "C"),
];

/// The driver seam the pipeline depends on. Production code uses
/// [`GitCli`]; tests substitute a scripted implementation.
#[async_trait]
pub trait GitDriver: Send + Sync {
    /// Run a git subcommand in `dir`, returning the combined output with
    /// its single trailing newline removed. A non-zero exit reports
    /// [`CliError::Failed`] with the combined output attached.
    async fn run(
        &self,
        dir: &Path,
        args: &[String],
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<String, CliError>;

    /// Run a git subcommand where only the exit code is meaningful
    /// (existence checks, predicate-style commands).
    async fn run_exit_code(
        &self,
        dir: &Path,
        args: &[String],
        token: &CancellationToken,
    ) -> Result<i32, CliError>;
}

#[derive(Clone, Default)]
pub struct GitCli;

static GIT_PATH: OnceCell<PathBuf> = OnceCell::const_new();

async fn git_path() -> Result<&'static PathBuf, CliError> {
    GIT_PATH
        .get_or_try_init(|| async {
            resolve_executable_path("git")
                .await
                .ok_or(CliError::NotAvailable)
        })
        .await
}

struct RunCapture {
    exit_code: Option<i32>,
    output: String,
    prompt_detected: bool,
    canceled: bool,
    deadline: Option<Duration>,
}

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    async fn run_capture(
        &self,
        dir: &Path,
        args: &[String],
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<RunCapture, CliError> {
        let git = git_path().await?;

        let mut cmd = tokio::process::Command::new(git);
        cmd.arg("-C").arg(dir);
        cmd.args(["-c", "color.ui=false"]);
        cmd.args(args);
        for (key, value) in HARDENED_ENV {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::trace!(?dir, ?args, "running git command");

        let mut child = cmd
            .group_spawn()
            .map_err(|e| CliError::Spawn(e.to_string()))?;

        let output = Arc::new(Mutex::new(String::new()));
        // Cancelled by a scanner the moment prompt text shows up.
        let prompt_hit = CancellationToken::new();

        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let mut scanners = Vec::new();
        if let Some(stream) = stdout {
            scanners.push(tokio::spawn(scan_stream(
                stream,
                output.clone(),
                prompt_hit.clone(),
            )));
        }
        if let Some(stream) = stderr {
            scanners.push(tokio::spawn(scan_stream(
                stream,
                output.clone(),
                prompt_hit.clone(),
            )));
        }

        let timeout_fut = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let mut capture = RunCapture {
            exit_code: None,
            output: String::new(),
            prompt_detected: false,
            canceled: false,
            deadline: None,
        };

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| CliError::Io(e.to_string()))?;
                capture.exit_code = status.code();
            }
            _ = token.cancelled() => {
                let _ = child.kill().await;
                capture.canceled = true;
            }
            _ = prompt_hit.cancelled() => {
                let _ = child.kill().await;
                capture.prompt_detected = true;
            }
            _ = timeout_fut => {
                let _ = child.kill().await;
                capture.deadline = timeout;
            }
        }

        for scanner in scanners {
            let _ = scanner.await;
        }

        // A prompt can land right as the process exits on its own.
        if prompt_hit.is_cancelled() {
            capture.prompt_detected = true;
        }

        let mut combined = output.lock().await.clone();
        trim_trailing_newline(&mut combined);
        capture.output = combined;
        Ok(capture)
    }
}

async fn scan_stream(
    stream: impl AsyncRead + Unpin + Send + 'static,
    output: Arc<Mutex<String>>,
    prompt_hit: CancellationToken,
) {
    let mut stream = stream;
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let text = String::from_utf8_lossy(&chunk[..n]);
        let mut buffer = output.lock().await;
        buffer.push_str(&text);
        // Prompts arrive without a newline, so match against the buffer
        // tail rather than complete lines.
        let tail_start = buffer.len().saturating_sub(512);
        let tail = &buffer[floor_char_boundary(&buffer, tail_start)..];
        if PROMPT_PATTERNS.iter().any(|re| re.is_match(tail)) {
            prompt_hit.cancel();
        }
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn trim_trailing_newline(s: &mut String) {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
}

#[async_trait]
impl GitDriver for GitCli {
    async fn run(
        &self,
        dir: &Path,
        args: &[String],
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<String, CliError> {
        let capture = self.run_capture(dir, args, timeout, token).await?;
        if capture.prompt_detected {
            return Err(CliError::PromptDetected {
                output: capture.output,
            });
        }
        if capture.canceled {
            return Err(CliError::Canceled);
        }
        if let Some(after) = capture.deadline {
            return Err(CliError::DeadlineExceeded(after));
        }
        match capture.exit_code {
            Some(0) => Ok(capture.output),
            code => Err(CliError::Failed {
                exit_code: code,
                output: capture.output,
            }),
        }
    }

    async fn run_exit_code(
        &self,
        dir: &Path,
        args: &[String],
        token: &CancellationToken,
    ) -> Result<i32, CliError> {
        let capture = self.run_capture(dir, args, None, token).await?;
        if capture.prompt_detected {
            return Err(CliError::PromptDetected {
                output: capture.output,
            });
        }
        if capture.canceled {
            return Err(CliError::Canceled);
        }
        capture.exit_code.ok_or_else(|| CliError::Failed {
            exit_code: None,
            output: capture.output,
        })
    }
}
