use common::{JobRecord, ScriptRef, ENTRYPOINT, EXIT_POLICY_VIOLATION, EXIT_TIMEOUT};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::policy::{PolicyViolation, ScriptPolicy};

/// Time between SIGTERM and SIGKILL when a job overruns.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Upper bound on draining pipes after the process group is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    Signaled(i32),
    TimedOut,
    PolicyRejected,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
    pub duration: Duration,
    pub pid: Option<u32>,
}

impl ExecutionOutput {
    fn rejected(violation: &PolicyViolation) -> Self {
        Self {
            exit_code: EXIT_POLICY_VIOLATION,
            stdout: String::new(),
            stderr: format!("Script rejected by execution policy: {}", violation),
            termination: Termination::PolicyRejected,
            duration: Duration::ZERO,
            pid: None,
        }
    }

    /// Text stored in the job record's `logs` field.
    pub fn logs(&self) -> String {
        format!("Stdout:\n{}\nStderr:\n{}", self.stdout, self.stderr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("job script not found at {0:?}")]
    ScriptMissing(PathBuf),
    #[error("failed to read job script {path:?}: {source}")]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stage job files: {0}")]
    Staging(#[source] std::io::Error),
    #[error("failed to spawn interpreter '{interpreter}': {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting for job process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Runs one job to completion. `Err` means the runner itself failed, not the job.
pub trait Executor: Send + Sync {
    fn run(&self, job: &JobRecord) -> impl Future<Output = Result<ExecutionOutput, ExecError>> + Send;

    /// Whether the host can take on more work right now.
    fn ready(&self) -> bool {
        true
    }
}

pub struct SafeExecutor {
    config: SandboxConfig,
    policy: ScriptPolicy,
}

impl SafeExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let policy = ScriptPolicy::from_config(&config);
        Self { config, policy }
    }

    /// Output directory kept for a job after it finishes, if configured.
    pub fn output_dir_for(output_root: Option<&Path>, job: &JobRecord) -> Option<PathBuf> {
        output_root.map(|root| root.join(&job.id.0))
    }

    fn build_command(&self, job: &JobRecord, workdir: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(ENTRYPOINT)
            .current_dir(workdir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // New group so the whole tree can be signalled at once.
            .process_group(0);

        for key in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("SANDRUN_JOB_ID", &job.id.0)
            .env("SANDRUN_JOB_NAME", &job.name)
            .env("SANDRUN_REQUESTER", &job.requester_identity)
            .env("SANDRUN_OUTPUT_DIR", output_dir);

        let memory = self.config.memory_limit_bytes();
        let cpu = self.config.max_cpu_seconds;
        if memory.is_some() || cpu.is_some() {
            use nix::sys::resource::{setrlimit, Resource};
            unsafe {
                cmd.pre_exec(move || {
                    if let Some(bytes) = memory {
                        setrlimit(Resource::RLIMIT_AS, bytes as nix::libc::rlim_t, bytes as nix::libc::rlim_t)
                            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    }
                    if let Some(secs) = cpu {
                        setrlimit(Resource::RLIMIT_CPU, secs as nix::libc::rlim_t, secs as nix::libc::rlim_t)
                            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    }
                    Ok(())
                });
            }
        }
        cmd
    }
}

impl Executor for SafeExecutor {
    async fn run(&self, job: &JobRecord) -> Result<ExecutionOutput, ExecError> {
        let (script, source_dir) = read_script(&job.script).await?;

        if let Err(violation) = self.policy.check(&script) {
            log::warn!("Job {} rejected by policy: {}", job.id, violation);
            return Ok(ExecutionOutput::rejected(&violation));
        }

        // Dropping the guard removes the directory on every exit path.
        let workdir = stage(self.config.work_root.clone(), source_dir, script).await?;

        let output_dir = match Self::output_dir_for(self.config.output_root.as_deref(), job) {
            Some(dir) => dir,
            None => workdir.path().join("output"),
        };
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(ExecError::Staging)?;

        let started = Instant::now();
        let mut child = self.build_command(job, workdir.path(), &output_dir).spawn().map_err(|source| ExecError::Spawn {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;
        let pid = child.id();
        log::info!("Job {} started as pid {:?} in {:?}", job.id, pid, workdir.path());

        let cap = self.config.max_output_bytes;
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_capped(out, cap)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_capped(err, cap)));

        let waited = tokio::time::timeout(self.config.timeout, child.wait()).await;
        let (status, timed_out) = match waited {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(e)) => {
                kill_group(pid, nix::sys::signal::Signal::SIGKILL);
                return Err(ExecError::Wait(e));
            }
            Err(_) => {
                log::warn!(
                    "Job {} exceeded timeout of {}s, terminating",
                    job.id,
                    self.config.timeout.as_secs()
                );
                kill_group(pid, nix::sys::signal::Signal::SIGTERM);
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(Ok(status)) => (Some(status), true),
                    _ => {
                        kill_group(pid, nix::sys::signal::Signal::SIGKILL);
                        (child.wait().await.ok(), true)
                    }
                }
            }
        };
        // Background children of a finished script are not allowed to linger.
        kill_group(pid, nix::sys::signal::Signal::SIGKILL);
        let duration = started.elapsed();

        let stdout = collect(stdout_task, cap).await;
        let mut stderr = collect(stderr_task, cap).await;

        let (exit_code, termination) = if timed_out {
            stderr.push_str(&format!(
                "\n[JOB TERMINATED - TIMEOUT AFTER {}s]",
                self.config.timeout.as_secs()
            ));
            (EXIT_TIMEOUT, Termination::TimedOut)
        } else {
            classify(status)
        };

        if let Err(e) = workdir.close() {
            log::warn!("Failed to remove work dir for job {}: {}", job.id, e);
        }

        log::info!(
            "Job {} exited with code {} in {:.2}s",
            job.id,
            exit_code,
            duration.as_secs_f64()
        );
        Ok(ExecutionOutput {
            exit_code,
            stdout,
            stderr,
            termination,
            duration,
            pid,
        })
    }

    fn ready(&self) -> bool {
        let Some(required_mb) = self.config.min_free_memory_mb else {
            return true;
        };
        let mut system = System::new();
        system.refresh_memory();
        let available_mb = system.available_memory() / 1024 / 1024;
        if available_mb < required_mb {
            log::warn!("Insufficient memory: required {}MB, available {}MB", required_mb, available_mb);
            return false;
        }
        true
    }
}

/// Returns the entrypoint bytes and, for folder jobs, the folder to copy.
async fn read_script(script: &ScriptRef) -> Result<(Vec<u8>, Option<PathBuf>), ExecError> {
    match script {
        ScriptRef::Inline(body) => Ok((body.clone().into_bytes(), None)),
        ScriptRef::Path(path) => {
            let (entry, folder) = if path.is_dir() {
                (path.join(ENTRYPOINT), Some(path.clone()))
            } else {
                (path.clone(), None)
            };
            match tokio::fs::read(&entry).await {
                Ok(bytes) => Ok((bytes, folder)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ExecError::ScriptMissing(entry)),
                Err(source) => Err(ExecError::ScriptRead { path: entry, source }),
            }
        }
    }
}

async fn stage(
    work_root: Option<PathBuf>,
    source_dir: Option<PathBuf>,
    script: Vec<u8>,
) -> Result<tempfile::TempDir, ExecError> {
    let staged = tokio::task::spawn_blocking(move || -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sandrun-");
        let dir = match work_root {
            Some(root) => {
                std::fs::create_dir_all(&root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        if let Some(src) = source_dir {
            copy_tree(&src, dir.path())?;
        }
        // Always run exactly the bytes that passed validation.
        std::fs::write(dir.path().join(ENTRYPOINT), &script)?;
        Ok(dir)
    })
    .await
    .map_err(|e| ExecError::Staging(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    staged.map_err(ExecError::Staging)
}

/// Copy regular files and directories; symlinks are skipped so a job cannot
/// pull files from outside its folder.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if kind.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        // Keep draining past the cap so the child never blocks on a full pipe.
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok((kept, truncated))
}

async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>>,
    cap: usize,
) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    let joined = match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            task.abort();
            return "[OUTPUT UNAVAILABLE - pipe held open by escaped process]".to_string();
        }
    };
    match joined {
        Ok(Ok((bytes, truncated))) => {
            let mut text = String::from_utf8_lossy(&bytes).into_owned();
            if truncated {
                text.push_str(&format!("\n[OUTPUT TRUNCATED - exceeded {} bytes]", cap));
            }
            text
        }
        Ok(Err(e)) => format!("[OUTPUT UNAVAILABLE - {}]", e),
        Err(e) => format!("[OUTPUT UNAVAILABLE - {}]", e),
    }
}

fn classify(status: Option<ExitStatus>) -> (i32, Termination) {
    use std::os::unix::process::ExitStatusExt;
    match status {
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => (code, Termination::Exited),
            (None, Some(sig)) => (128 + sig, Termination::Signaled(sig)),
            (None, None) => (common::EXIT_EXECUTION_FAULT, Termination::Exited),
        },
        None => (common::EXIT_EXECUTION_FAULT, Termination::Exited),
    }
}

fn kill_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    let Some(pid) = pid else {
        return;
    };
    match nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to signal process group {}: {}", pid, e),
    }
}
