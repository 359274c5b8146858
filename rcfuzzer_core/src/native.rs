use crate::cancel::CancelToken;
use crate::env::Environment;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum NativeBuildError {
    #[error("Build command is empty")]
    EmptyCommand,
    #[error("Failed to spawn build command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("Build {0}")]
    Failed(String),
    #[error("Build timed out after {0:?}")]
    Timeout(Duration),
    #[error("Build cancelled")]
    Cancelled,
    #[error("Error waiting for build process: {0}")]
    Wait(#[source] io::Error),
}

/// The benchmark's own build system, seen as a pass/fail step that runs with
/// a given environment.
pub trait NativeBuild {
    fn build(&mut self, env: &Environment) -> Result<(), NativeBuildError>;
}

impl<F> NativeBuild for F
where
    F: FnMut(&Environment) -> Result<(), NativeBuildError>,
{
    fn build(&mut self, env: &Environment) -> Result<(), NativeBuildError> {
        self(env)
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuildConfig {
    /// argv of the build; `{VAR}` placeholders are expanded from the build
    /// environment.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Runs the native build as a child process whose environment is exactly
/// the composed one.
pub struct CommandBuild {
    config: CommandBuildConfig,
    cancel: CancelToken,
}

impl CommandBuild {
    pub fn new(config: CommandBuildConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, NativeBuildError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    let timed_out = self
                        .config
                        .timeout
                        .is_some_and(|timeout| start_time.elapsed() > timeout);
                    if timed_out || self.cancel.is_cancelled() {
                        log::warn!("Stopping build process group {}", child.id());
                        kill_process_group(child);
                        let _ = child.wait();
                        return Err(match self.config.timeout {
                            Some(timeout) if timed_out => NativeBuildError::Timeout(timeout),
                            _ => NativeBuildError::Cancelled,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(NativeBuildError::Wait(e)),
            }
        }
    }
}

/// The build runs as the leader of its own process group, so this reaches
/// every tool it started, including ones left running in the background.
fn kill_process_group(child: &Child) {
    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::error!("Failed to kill build process group {pgid}: {e}"),
    }
}

/// Human readable description of a non-successful exit.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited abnormally".to_string()
}

impl NativeBuild for CommandBuild {
    fn build(&mut self, env: &Environment) -> Result<(), NativeBuildError> {
        if self.cancel.is_cancelled() {
            return Err(NativeBuildError::Cancelled);
        }
        let argv: Vec<String> = self.config.command.iter().map(|a| env.expand(a)).collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(NativeBuildError::EmptyCommand);
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .process_group(0);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(env.expand(&cwd.to_string_lossy()));
        }

        log::debug!("Running build command {argv:?}");
        let mut child = cmd.spawn().map_err(|source| NativeBuildError::Spawn {
            command: argv.clone(),
            source,
        })?;
        let status = self.wait(&mut child);
        // Background jobs must not outlive the build: the protected
        // directories are restored right after this returns.
        kill_process_group(&child);
        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(NativeBuildError::Failed(describe_exit(&status)))
        }
    }
}
