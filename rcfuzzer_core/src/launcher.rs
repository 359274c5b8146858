use crate::env::{EnvError, Environment, compose};
use crate::layout::{profile_for_target, subdir_name};
use crate::profile::EngineProfile;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use thiserror::Error;

pub const CORPUS_DIR_NAME: &str = "corpus";
pub const CRASHES_DIR_NAME: &str = "crashes";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Target binary {0:?} does not exist")]
    MissingTarget(PathBuf),
    #[error("Cannot tell which engine {0:?} was built for")]
    UnknownEngine(PathBuf),
    #[error("{0:?} already exists; refusing to mix results with a previous run")]
    OutputExists(PathBuf),
    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid runner placeholder: {0}")]
    Placeholder(#[from] EnvError),
    #[error("Runner command is empty")]
    EmptyCommand,
    #[error("Failed to start {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// How the engine runner is invoked. Arguments may use `{input}`,
/// `{output}`, `{crashes}`, `{target}`, `{engine}` and `{benchmark}`, plus
/// any `{VAR}` from the run environment.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_program() -> String {
    "rcfuzz".to_string()
}

fn default_args() -> Vec<String> {
    [
        "-i",
        "{input}",
        "-o",
        "{output}",
        "-f",
        "{engine}",
        "-t",
        "{benchmark}",
        "--",
        "{target}",
    ]
    .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
        }
    }
}

/// Fresh directories a run writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirs {
    pub corpus: PathBuf,
    pub crashes: PathBuf,
}

impl RunDirs {
    pub fn under(output_corpus: &Path) -> Self {
        Self {
            corpus: output_corpus.join(CORPUS_DIR_NAME),
            crashes: output_corpus.join(CRASHES_DIR_NAME),
        }
    }
}

/// Creates `corpus/` and `crashes/` under `output_corpus`. Fails, without
/// creating either, if one of them is already there.
pub fn prepare_run_dirs(output_corpus: &Path) -> Result<RunDirs, LaunchError> {
    let dirs = RunDirs::under(output_corpus);
    for dir in [&dirs.corpus, &dirs.crashes] {
        if fs::symlink_metadata(dir).is_ok() {
            return Err(LaunchError::OutputExists(dir.clone()));
        }
    }
    fs::create_dir_all(output_corpus).map_err(|source| LaunchError::Io {
        path: output_corpus.to_path_buf(),
        source,
    })?;
    for dir in [&dirs.crashes, &dirs.corpus] {
        fs::create_dir(dir).map_err(|source| LaunchError::Io {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(dirs)
}

/// Starts the fuzzing engine a target was built for.
pub struct Launcher<'a> {
    profiles: &'a [EngineProfile],
    settings: &'a RunnerSettings,
    env: Environment,
}

impl<'a> Launcher<'a> {
    pub fn new(profiles: &'a [EngineProfile], settings: &'a RunnerSettings, env: Environment) -> Self {
        Self {
            profiles,
            settings,
            env,
        }
    }

    /// The profile owning `target`, from the output directory it sits in.
    pub fn resolve_profile(&self, target: &Path) -> Result<&'a EngineProfile, LaunchError> {
        profile_for_target(target, self.profiles)
            .ok_or_else(|| LaunchError::UnknownEngine(target.to_path_buf()))
    }

    /// Builds the engine command line without running it.
    pub fn command(
        &self,
        profile: &EngineProfile,
        input_corpus: &Path,
        dirs: &RunDirs,
        target: &Path,
    ) -> Result<Command, LaunchError> {
        let engine = subdir_name(&profile.name).unwrap_or_else(|_| profile.name.clone());
        let benchmark = match self.env.get("BENCHMARK") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let placeholders = Environment::from_pairs([
            ("input", input_corpus.to_string_lossy().into_owned()),
            ("output", dirs.corpus.to_string_lossy().into_owned()),
            ("crashes", dirs.crashes.to_string_lossy().into_owned()),
            ("target", target.to_string_lossy().into_owned()),
            ("engine", engine),
            ("benchmark", benchmark),
        ])?;
        let vars = compose(&self.env, &placeholders);

        let program = vars.expand(&self.settings.program);
        if program.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        let mut cmd = Command::new(program);
        cmd.args(self.settings.args.iter().map(|a| vars.expand(a)))
            .args(profile.run_args.iter().map(|a| vars.expand(a)))
            .env_clear()
            .envs(self.env.iter());
        Ok(cmd)
    }

    /// Prepares the run directories and blocks until the engine exits.
    ///
    /// Nothing is started, and no directory is created, if the target is
    /// unknown, the runner template is unusable or the output directories
    /// already exist. The engine's exit status is returned as is.
    pub fn run(
        &self,
        input_corpus: &Path,
        output_corpus: &Path,
        target: &Path,
    ) -> Result<ExitStatus, LaunchError> {
        if !target.is_file() {
            return Err(LaunchError::MissingTarget(target.to_path_buf()));
        }
        // The engine is named by the directory holding the target, which a
        // relative path like `./fuzz_target` does not show.
        let target = target.canonicalize().map_err(|source| LaunchError::Io {
            path: target.to_path_buf(),
            source,
        })?;
        let profile = self.resolve_profile(&target)?;
        let dirs = RunDirs::under(output_corpus);
        let mut cmd = self.command(profile, input_corpus, &dirs, &target)?;
        prepare_run_dirs(output_corpus)?;

        log::info!("Running command: {cmd:?}");
        let program = self.settings.program.clone();
        let status = cmd
            .status()
            .map_err(|source| LaunchError::Spawn { program, source })?;
        if !status.success() {
            log::warn!(
                "{} engine {}",
                profile.name,
                crate::native::describe_exit(&status)
            );
        }
        Ok(status)
    }
}
