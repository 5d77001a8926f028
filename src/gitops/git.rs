//! Git working copy driven through the `git` CLI.

use crate::error::{EngineError, Result};
use crate::secret_string::SecretString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::debug;

static ASKPASS_USERNAME: &str = "x-access-token";

/// Escapes a token for safe use in single-quoted shell strings.
fn shell_escape(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// Temporary `GIT_ASKPASS` script answering git's credential prompts for HTTPS remotes.
/// The script is deleted when this value is dropped, so it must outlive the git command.
struct AskPass {
    path: TempPath,
}

impl AskPass {
    fn new(token: &SecretString) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(".git-askpass-")
            .suffix(".sh")
            .tempfile()
            .map_err(|e| EngineError::io(std::env::temp_dir(), e))?;
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  Username*) echo '{}' ;;\n  *) echo '{}' ;;\nesac\n",
            ASKPASS_USERNAME,
            shell_escape(token.expose_secret())
        );
        file.write_all(script.as_bytes())
            .map_err(|e| EngineError::io(file.path(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o700))
                .map_err(|e| EngineError::io(file.path(), e))?;
        }

        // Close the handle; exec'ing a file that is still open for writing fails with ETXTBSY.
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    fn env(&self) -> [(&'static str, &Path); 1] {
        [("GIT_ASKPASS", &*self.path)]
    }
}

/// Formats a git error with both stdout and stderr for better debugging.
fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// The git subcommand in `args`, skipping global options and `-c` values.
fn subcommand(args: &[&str]) -> String {
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match *arg {
            "-c" | "-C" => {
                args.next();
            }
            arg if arg.starts_with('-') => {}
            arg => return arg.to_string(),
        }
    }
    "git".to_string()
}

async fn run_git(
    dir: &Path,
    args: &[&str],
    token: Option<&SecretString>,
    timeout: Duration,
) -> Result<Output> {
    let command_name = subcommand(args);
    let askpass = match token {
        Some(token) if !token.is_empty() => Some(AskPass::new(token)?),
        _ => None,
    };

    let mut cmd = Command::new("git");
    cmd.current_dir(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(askpass) = &askpass {
        cmd.envs(askpass.env());
    }

    debug!("Running git {} in {}", command_name, dir.display());
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output.map_err(|e| EngineError::Git {
            command: command_name.clone(),
            message: e.to_string(),
        })?,
        Err(_) => {
            return Err(EngineError::Timeout {
                operation: format!("git {}", command_name),
                seconds: timeout.as_secs(),
            });
        }
    };
    drop(askpass);

    if output.status.success() {
        Ok(output)
    } else {
        Err(EngineError::Git {
            command: command_name,
            message: format_git_error(&output),
        })
    }
}

/// A fresh, single-branch clone of a GitOps repository.
#[derive(Debug)]
pub struct WorkingCopy {
    path: PathBuf,
    branch: String,
    timeout: Duration,
}

impl WorkingCopy {
    /// Clones `branch` of `url` into `path`, which must not exist yet.
    pub async fn clone(
        url: &str,
        branch: &str,
        path: &Path,
        token: &SecretString,
        timeout: Duration,
    ) -> Result<Self> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::io(parent, e))?;
        let target = path.to_string_lossy();

        run_git(
            parent,
            &[
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                branch,
                url,
                &target,
            ],
            Some(token),
            timeout,
        )
        .await?;

        Ok(Self {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn add(&self, relative: &Path) -> Result<()> {
        let relative = relative.to_string_lossy();
        run_git(&self.path, &["add", "--", &relative], None, self.timeout).await?;
        Ok(())
    }

    /// True when the index or the working tree differ from HEAD.
    pub async fn is_dirty(&self) -> Result<bool> {
        let output = run_git(&self.path, &["status", "--porcelain"], None, self.timeout).await?;
        Ok(!output.stdout.iter().all(u8::is_ascii_whitespace))
    }

    pub async fn commit(&self, message: &str, author_name: &str, author_email: &str) -> Result<()> {
        let name = format!("user.name={}", author_name);
        let email = format!("user.email={}", author_email);
        run_git(
            &self.path,
            &["-c", &name, "-c", &email, "commit", "--no-gpg-sign", "-m", message],
            None,
            self.timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn head(&self) -> Result<String> {
        let output = run_git(&self.path, &["rev-parse", "HEAD"], None, self.timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn push(&self, token: &SecretString) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        run_git(
            &self.path,
            &["push", "origin", &refspec],
            Some(token),
            self.timeout,
        )
        .await?;
        Ok(())
    }
}
