use crate::fsutil::{SpecialFiles, copy_tree};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Install source {0:?} does not exist")]
    MissingSource(PathBuf),
    #[error("Failed to install {source_path:?} to {dest:?}: {source}")]
    Io {
        source_path: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An engine installation copied into the output root before building,
/// so the fuzzers travel with the targets built for them.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineInstall {
    pub source: PathBuf,
    /// Destination, relative to the output root unless absolute.
    pub dest: PathBuf,
    /// Recreate symlinks instead of copying what they point to.
    #[serde(default)]
    pub symlinks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Copied,
    AlreadyPresent,
}

impl EngineInstall {
    pub fn destination(&self, out_root: &Path) -> PathBuf {
        out_root.join(&self.dest)
    }

    /// Copies the installation. An existing destination is left untouched.
    pub fn install(&self, out_root: &Path) -> Result<InstallOutcome, InstallError> {
        let dest = self.destination(out_root);
        if fs::symlink_metadata(&dest).is_ok() {
            log::warn!("{dest:?} already exists, not reinstalling {:?}", self.source);
            return Ok(InstallOutcome::AlreadyPresent);
        }
        let meta = fs::metadata(&self.source)
            .map_err(|_| InstallError::MissingSource(self.source.clone()))?;
        let err = |source| InstallError::Io {
            source_path: self.source.clone(),
            dest: dest.clone(),
            source,
        };

        if meta.is_dir() {
            copy_tree(&self.source, &dest, !self.symlinks, SpecialFiles::Skip).map_err(err)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(err)?;
            }
            fs::copy(&self.source, &dest).map_err(err)?;
        }
        log::info!("Installed {:?} to {dest:?}", self.source);
        Ok(InstallOutcome::Copied)
    }
}

/// Installs every entry in order, stopping at the first error.
pub fn install_all(installs: &[EngineInstall], out_root: &Path) -> Result<(), InstallError> {
    for install in installs {
        install.install(out_root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn copies_tree_keeping_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = tmp.path().join("aflpp");
        fs::create_dir_all(&engine).unwrap();
        fs::write(engine.join("afl-fuzz"), "bin").unwrap();
        symlink("afl-fuzz", engine.join("afl-fuzz-link")).unwrap();
        let out = tmp.path().join("out");

        let install = EngineInstall {
            source: engine,
            dest: PathBuf::from("fuzzers/aflpp"),
            symlinks: true,
        };
        assert_eq!(install.install(&out).unwrap(), InstallOutcome::Copied);

        let dest = out.join("fuzzers/aflpp");
        assert_eq!(fs::read_to_string(dest.join("afl-fuzz")).unwrap(), "bin");
        assert!(
            fs::symlink_metadata(dest.join("afl-fuzz-link"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }

    #[test]
    fn follows_symlinks_when_asked() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = tmp.path().join("afl");
        fs::create_dir_all(&engine).unwrap();
        fs::write(engine.join("afl-fuzz"), "bin").unwrap();
        symlink("afl-fuzz", engine.join("alias")).unwrap();
        let out = tmp.path().join("out");

        let install = EngineInstall {
            source: engine,
            dest: PathBuf::from("fuzzers/afl"),
            symlinks: false,
        };
        install.install(&out).unwrap();
        let alias = out.join("fuzzers/afl/alias");
        assert!(fs::symlink_metadata(&alias).unwrap().is_file());
    }

    #[test]
    fn existing_destination_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("learning_engine.py");
        fs::write(&file, "new").unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(out.join("bin")).unwrap();
        fs::write(out.join("bin/learning_engine.py"), "old").unwrap();

        let install = EngineInstall {
            source: file,
            dest: PathBuf::from("bin/learning_engine.py"),
            symlinks: false,
        };
        assert_eq!(install.install(&out).unwrap(), InstallOutcome::AlreadyPresent);
        assert_eq!(
            fs::read_to_string(out.join("bin/learning_engine.py")).unwrap(),
            "old"
        );
    }

    #[test]
    fn missing_source_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let install = EngineInstall {
            source: tmp.path().join("angora"),
            dest: PathBuf::from("fuzzers/angora"),
            symlinks: false,
        };
        assert!(matches!(
            install_all(&[install], tmp.path()),
            Err(InstallError::MissingSource(_))
        ));
    }
}
