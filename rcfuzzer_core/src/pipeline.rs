//! One engine profile, end to end: compose the environment, protect the
//! shared directories, run the native build, collect artifacts, restore.

use crate::env::{EnvError, Environment};
use crate::layout::{LayoutError, profile_dir};
use crate::native::{NativeBuild, NativeBuildError};
use crate::profile::EngineProfile;
use crate::snapshot::{RestoreError, SnapshotError, protect};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Where a build attempt currently is.
///
/// `Init → Snapshot → Building → ArtifactCopy → Done`; any stage from
/// `Snapshot` on may fail, and once `Snapshot` succeeded the protected
/// directories are restored on every path out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Init,
    Snapshot,
    Building,
    ArtifactCopy,
    Restore,
    Done,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Init => "init",
            BuildStage::Snapshot => "snapshot",
            BuildStage::Building => "building",
            BuildStage::ArtifactCopy => "artifact-copy",
            BuildStage::Restore => "restore",
            BuildStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Cannot prepare output directory: {0}")]
    Layout(#[from] LayoutError),
    #[error("Cannot compose build environment: {0}")]
    Compose(#[from] EnvError),
    #[error("Cannot capture protected directory: {0}")]
    Capture(#[from] SnapshotError),
    #[error("Native build failed: {0}")]
    Build(#[from] NativeBuildError),
    #[error("Artifacts {first:?} and {second:?} would both be copied to {name:?}")]
    ArtifactConflict {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Artifact {0:?} is missing after a successful build")]
    ArtifactMissing(PathBuf),
    #[error("Failed to copy artifact {path:?}: {source}")]
    ArtifactCopy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to list output directory {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Protected directories could not be restored: {0}")]
    Restore(#[from] RestoreError),
}

impl BuildError {
    pub fn stage(&self) -> BuildStage {
        match self {
            BuildError::Layout(_)
            | BuildError::Compose(_)
            | BuildError::ArtifactConflict { .. } => BuildStage::Init,
            BuildError::Capture(_) => BuildStage::Snapshot,
            BuildError::Build(_) => BuildStage::Building,
            BuildError::ArtifactMissing(_)
            | BuildError::ArtifactCopy { .. }
            | BuildError::Output { .. } => BuildStage::ArtifactCopy,
            BuildError::Restore(_) => BuildStage::Restore,
        }
    }

    /// Whether the protected directories can no longer be trusted. Nothing
    /// else may be built once this is true.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BuildError::Restore(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Build(NativeBuildError::Cancelled))
    }
}

/// A file present in a profile's output directory after its build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub md5: String,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub profile: String,
    pub out_dir: PathBuf,
    pub duration: Duration,
    pub outputs: Vec<OutputFile>,
}

/// Tracks the stage of one attempt for logging.
struct BuildAttempt<'a> {
    profile: &'a str,
    stage: BuildStage,
}

impl BuildAttempt<'_> {
    fn advance(&mut self, stage: BuildStage) {
        log::debug!("[{}] {} -> {}", self.profile, self.stage, stage);
        self.stage = stage;
    }
}

/// Builds `profile` into its subdirectory of `out_root`.
///
/// `protected` directories are snapshotted before the native build and
/// restored afterwards whatever the outcome. If the build (or artifact
/// collection) fails and the restore fails too, the restore error is
/// returned since it is the one that ends the run.
pub fn build(
    profile: &EngineProfile,
    base_env: &Environment,
    protected: &[PathBuf],
    out_root: &Path,
    native: &mut dyn NativeBuild,
) -> Result<BuildReport, BuildError> {
    let started = Instant::now();
    let mut attempt = BuildAttempt {
        profile: &profile.name,
        stage: BuildStage::Init,
    };

    let out_dir = profile_dir(out_root, profile)?;
    fs::create_dir_all(&out_dir).map_err(|source| LayoutError::Io {
        path: out_dir.clone(),
        source,
    })?;
    let env = profile.build_environment(base_env, &out_dir)?;
    check_artifact_names(profile)?;

    attempt.advance(BuildStage::Snapshot);
    let guard = protect(protected)?;

    attempt.advance(BuildStage::Building);
    let outcome = native
        .build(&env)
        .map_err(BuildError::from)
        .and_then(|()| {
            attempt.advance(BuildStage::ArtifactCopy);
            copy_artifacts(profile, &out_dir)
        });

    attempt.advance(BuildStage::Restore);
    if let Err(restore_err) = guard.release() {
        if let Err(e) = &outcome {
            log::error!("[{}] {} (superseded by restore failure)", profile.name, e);
        }
        return Err(restore_err.into());
    }
    outcome?;

    let outputs = list_outputs(&out_dir)?;
    attempt.advance(BuildStage::Done);
    Ok(BuildReport {
        profile: profile.name.clone(),
        out_dir,
        duration: started.elapsed(),
        outputs,
    })
}

/// Artifacts land flat in the output directory, so their file names must
/// differ.
fn check_artifact_names(profile: &EngineProfile) -> Result<(), BuildError> {
    let mut seen: BTreeMap<&OsStr, &PathBuf> = BTreeMap::new();
    for artifact in &profile.artifacts {
        let Some(name) = artifact.file_name() else {
            return Err(BuildError::ArtifactMissing(artifact.clone()));
        };
        if let Some(first) = seen.insert(name, artifact) {
            return Err(BuildError::ArtifactConflict {
                name: name.to_string_lossy().into_owned(),
                first: first.clone(),
                second: artifact.clone(),
            });
        }
    }
    Ok(())
}

fn copy_artifacts(profile: &EngineProfile, out_dir: &Path) -> Result<(), BuildError> {
    for artifact in &profile.artifacts {
        if !artifact.is_file() {
            return Err(BuildError::ArtifactMissing(artifact.clone()));
        }
        let Some(file_name) = artifact.file_name() else {
            return Err(BuildError::ArtifactMissing(artifact.clone()));
        };
        fs::copy(artifact, out_dir.join(file_name)).map_err(|source| BuildError::ArtifactCopy {
            path: artifact.clone(),
            source,
        })?;
        log::debug!("[{}] Copied {:?}", profile.name, artifact);
    }
    Ok(())
}

fn list_outputs(out_dir: &Path) -> Result<Vec<OutputFile>, BuildError> {
    let err = |source| BuildError::Output {
        path: out_dir.to_path_buf(),
        source,
    };
    let mut outputs = Vec::new();
    for entry in fs::read_dir(out_dir).map_err(err)? {
        let path = entry.map_err(err)?.path();
        if path.is_file() {
            let bytes = fs::read(&path).map_err(err)?;
            outputs.push(OutputFile {
                path,
                md5: format!("{:x}", md5::compute(bytes)),
            });
        }
    }
    outputs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _tmp: tempfile::TempDir,
        src: PathBuf,
        out: PathBuf,
        tools: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let out = tmp.path().join("out");
        let tools = tmp.path().join("tools");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&tools).unwrap();
        fs::write(src.join("fuzz.c"), "int main() { return 0; }\n").unwrap();
        fs::write(tools.join("engine-fuzz"), "#!/bin/sh\n").unwrap();
        Fixture {
            _tmp: tmp,
            src,
            out,
            tools,
        }
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn successful_build_copies_artifacts_and_restores_source() {
        let fx = fixture();
        let profile = EngineProfile::new("enginex", "clang", "clang++", "/libX.a")
            .with_env("DEFINE", "X")
            .with_artifact(fx.tools.join("engine-fuzz"));
        let src = fx.src.clone();

        let mut native = |env: &Environment| -> Result<(), NativeBuildError> {
            assert_eq!(env.get("DEFINE"), Some("X"));
            assert_eq!(env.get("CC"), Some("clang"));
            fs::write(src.join("fuzz.o"), "object").unwrap();
            let out = PathBuf::from(env.get("OUT").unwrap());
            fs::write(out.join("target"), "binary-X").unwrap();
            Ok(())
        };
        let report = build(
            &profile,
            &Environment::new(),
            &[fx.src.clone()],
            &fx.out,
            &mut native,
        )
        .unwrap();

        assert_eq!(report.out_dir, fx.out.join("enginex"));
        assert_eq!(names(&report.out_dir), vec!["engine-fuzz", "target"]);
        assert_eq!(report.outputs.len(), 2);
        assert_eq!(names(&fx.src), vec!["fuzz.c"]);
    }

    #[test]
    fn failed_build_still_restores() {
        let fx = fixture();
        let profile = EngineProfile::new("enginex", "clang", "clang++", "");
        let src = fx.src.clone();

        let mut native = |_: &Environment| -> Result<(), NativeBuildError> {
            fs::write(src.join("config.status"), "half-configured").unwrap();
            fs::remove_file(src.join("fuzz.c")).unwrap();
            Err(NativeBuildError::Failed("exited with code 2".to_string()))
        };
        let err = build(
            &profile,
            &Environment::new(),
            &[fx.src.clone()],
            &fx.out,
            &mut native,
        )
        .unwrap_err();

        assert_eq!(err.stage(), BuildStage::Building);
        assert!(!err.is_fatal());
        assert_eq!(names(&fx.src), vec!["fuzz.c"]);
    }

    #[test]
    fn missing_artifact_fails_after_restore() {
        let fx = fixture();
        let profile = EngineProfile::new("enginex", "clang", "clang++", "")
            .with_artifact(fx.tools.join("not-installed"));
        let src = fx.src.clone();

        let mut native = |_: &Environment| -> Result<(), NativeBuildError> {
            fs::write(src.join("fuzz.o"), "object").unwrap();
            Ok(())
        };
        let err = build(
            &profile,
            &Environment::new(),
            &[fx.src.clone()],
            &fx.out,
            &mut native,
        )
        .unwrap_err();

        assert!(matches!(err, BuildError::ArtifactMissing(_)));
        assert_eq!(err.stage(), BuildStage::ArtifactCopy);
        assert_eq!(names(&fx.src), vec!["fuzz.c"]);
    }

    #[test]
    fn capture_failure_skips_native_build() {
        let fx = fixture();
        let profile = EngineProfile::new("enginex", "clang", "clang++", "");
        let mut called = false;
        let mut native = |_: &Environment| -> Result<(), NativeBuildError> {
            called = true;
            Ok(())
        };
        let err = build(
            &profile,
            &Environment::new(),
            &[fx.src.join("missing")],
            &fx.out,
            &mut native,
        )
        .unwrap_err();

        assert_eq!(err.stage(), BuildStage::Snapshot);
        assert!(!called);
    }

    #[test]
    fn clashing_artifact_names_fail_before_build() {
        let fx = fixture();
        fs::create_dir_all(fx.tools.join("other")).unwrap();
        fs::write(fx.tools.join("other/engine-fuzz"), "#!/bin/sh\n").unwrap();
        let profile = EngineProfile::new("enginex", "clang", "clang++", "")
            .with_artifact(fx.tools.join("engine-fuzz"))
            .with_artifact(fx.tools.join("other/engine-fuzz"));
        let mut called = false;
        let mut native = |_: &Environment| -> Result<(), NativeBuildError> {
            called = true;
            Ok(())
        };
        let err = build(
            &profile,
            &Environment::new(),
            &[fx.src.clone()],
            &fx.out,
            &mut native,
        )
        .unwrap_err();

        assert!(matches!(
            &err,
            BuildError::ArtifactConflict { name, .. } if name == "engine-fuzz"
        ));
        assert_eq!(err.stage(), BuildStage::Init);
        assert!(!called);
    }

    #[test]
    fn malformed_profile_fails_before_snapshot() {
        let fx = fixture();
        let profile = EngineProfile::new("enginex", "clang", "clang++", "").with_env("CC", "gcc");
        let mut native = |_: &Environment| -> Result<(), NativeBuildError> { Ok(()) };
        let err = build(
            &profile,
            &Environment::new(),
            &[fx.src.clone()],
            &fx.out,
            &mut native,
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::Compose(_)));
        assert_eq!(err.stage(), BuildStage::Init);
    }
}
