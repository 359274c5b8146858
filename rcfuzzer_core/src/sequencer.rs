use crate::cancel::CancelToken;
use crate::env::Environment;
use crate::layout::{LayoutError, TargetLayout, ensure_layout};
use crate::native::NativeBuild;
use crate::pipeline::{self, BuildError, BuildReport};
use crate::profile::EngineProfile;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Problems found before any profile is built.
#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("No profiles to build")]
    NoProfiles,
    #[error("Output root {out_root:?} lies inside protected path {protected:?}")]
    OutputInsideProtected { out_root: PathBuf, protected: PathBuf },
    #[error("Cannot resolve {path:?}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug)]
pub struct SequenceFailure {
    pub profile: String,
    pub error: BuildError,
}

/// Outcome of a sequence run. Profiles after a failure are listed in
/// `skipped` and were never attempted.
#[derive(Debug)]
pub struct SequenceReport {
    pub layout: TargetLayout,
    pub completed: Vec<BuildReport>,
    pub failure: Option<SequenceFailure>,
    pub skipped: Vec<String>,
}

impl SequenceReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.skipped.is_empty()
    }

    /// True when a protected directory could not be restored.
    pub fn is_fatal(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| f.error.is_fatal())
    }
}

/// Builds `profiles` one after the other, stopping at the first failure.
///
/// All profiles share the `protected` directories, so builds never overlap:
/// each pipeline owns them for the whole of its attempt and hands them back
/// restored.
pub struct BuildSequencer<'a> {
    native: &'a mut dyn NativeBuild,
    cancel: CancelToken,
}

impl<'a> BuildSequencer<'a> {
    pub fn new(native: &'a mut dyn NativeBuild, cancel: CancelToken) -> Self {
        Self { native, cancel }
    }

    pub fn run(
        &mut self,
        profiles: &[EngineProfile],
        base_env: &Environment,
        protected: &[PathBuf],
        out_root: &Path,
    ) -> Result<SequenceReport, SequenceError> {
        if profiles.is_empty() {
            return Err(SequenceError::NoProfiles);
        }
        check_output_outside(out_root, protected)?;
        let layout = ensure_layout(out_root, profiles)?;

        let mut report = SequenceReport {
            layout,
            completed: Vec::new(),
            failure: None,
            skipped: Vec::new(),
        };

        for (index, profile) in profiles.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("Cancelled before building {}", profile.name);
                report.skipped = profiles[index..].iter().map(|p| p.name.clone()).collect();
                break;
            }

            log::info!("Building with {}", profile.name);
            match pipeline::build(profile, base_env, protected, out_root, self.native) {
                Ok(build) => {
                    log::info!(
                        "Built {} in {:.2?} ({} files)",
                        profile.name,
                        build.duration,
                        build.outputs.len()
                    );
                    report.completed.push(build);
                }
                Err(error) => {
                    log::error!(
                        "Build for {} failed at stage {}: {}",
                        profile.name,
                        error.stage(),
                        error
                    );
                    report.skipped = profiles[index + 1..]
                        .iter()
                        .map(|p| p.name.clone())
                        .collect();
                    report.failure = Some(SequenceFailure {
                        profile: profile.name.clone(),
                        error,
                    });
                    break;
                }
            }
        }

        Ok(report)
    }
}

/// Canonical form of `path`, which need not exist yet: the deepest existing
/// ancestor is canonicalized and the missing components are appended.
fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break,
        }
    }
    let base = if existing.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        existing.canonicalize()?
    };
    Ok(missing.iter().rev().fold(base, |acc, name| acc.join(name)))
}

/// Fails if `out_root` lies inside one of `protected`, since restoring a
/// protected directory would wipe anything built or installed into it.
/// `out_root` need not exist yet.
pub fn check_output_outside(out_root: &Path, protected: &[PathBuf]) -> Result<(), SequenceError> {
    let resolve = |path: &Path| {
        resolve_path(path).map_err(|source| SequenceError::Resolve {
            path: path.to_path_buf(),
            source,
        })
    };
    let out_root = resolve(out_root)?;
    for path in protected {
        // A missing protected path is reported by the snapshot step.
        if !path.exists() {
            continue;
        }
        let protected_root = resolve(path)?;
        if out_root.starts_with(&protected_root) {
            return Err(SequenceError::OutputInsideProtected {
                out_root,
                protected: path.clone(),
            });
        }
    }
    Ok(())
}
