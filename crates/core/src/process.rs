//! External process execution
//!
//! Every tool the pipeline drives (git, meson, ninja, make, configure, clang,
//! llvm-nm, apt-get, ...) goes through [`CommandRunner`]. Production code uses
//! [`SystemRunner`]; tests substitute recording fakes.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// A fully described command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_string_lossy().into_owned(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-like rendering used in logs
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external commands
pub trait CommandRunner {
    /// Run to completion and capture output. A non-zero exit is reported
    /// through [`CommandOutput::success`], not as an `Err`.
    fn run(&self, spec: &CommandSpec) -> impl Future<Output = std::io::Result<CommandOutput>> + Send;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!("Running: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let output = cmd.output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and append its transcript to `log_path`
pub async fn run_logged<R: CommandRunner>(
    runner: &R,
    spec: &CommandSpec,
    log_path: &Path,
) -> std::io::Result<CommandOutput> {
    let output = runner.run(spec).await?;
    append_log(log_path, spec, &output)?;
    Ok(output)
}

fn append_log(log_path: &Path, spec: &CommandSpec, output: &CommandOutput) -> std::io::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    writeln!(file, "$ {}", spec.display())?;
    if let Some(ref cwd) = spec.cwd {
        writeln!(file, "# cwd: {}", cwd.display())?;
    }
    file.write_all(output.stdout.as_bytes())?;
    file.write_all(output.stderr.as_bytes())?;
    match output.code {
        Some(code) => writeln!(file, "# exit status: {}", code)?,
        None => writeln!(file, "# terminated by signal")?,
    }
    Ok(())
}

/// Last `lines` lines of a log file
pub fn log_tail(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::new("./configure")
            .arg("--extra-cflags=-I/a -fPIC")
            .arg("--enable-shared");
        assert_eq!(
            spec.display(),
            "./configure '--extra-cflags=-I/a -fPIC' --enable-shared"
        );
    }

    #[tokio::test]
    async fn test_system_runner_reports_failure() {
        let ok = SystemRunner.run(&CommandSpec::new("true")).await.unwrap();
        assert!(ok.success);

        let failed = SystemRunner.run(&CommandSpec::new("false")).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.code, Some(1));
    }

    #[tokio::test]
    async fn test_run_logged_appends_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("step.log");

        let spec = CommandSpec::new("echo").arg("hello");
        run_logged(&SystemRunner, &spec, &log).await.unwrap();
        run_logged(&SystemRunner, &spec, &log).await.unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content.matches("$ echo hello").count(), 2);
        assert!(content.contains("# exit status: 0"));
    }

    #[test]
    fn test_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("build.log");
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&log, body).unwrap();

        let tail = log_tail(&log, 3).unwrap();
        assert_eq!(tail, vec!["line 8", "line 9", "line 10"]);
        assert_eq!(log_tail(&log, 100).unwrap().len(), 10);
    }
}
