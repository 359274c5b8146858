use crate::profile::EngineProfile;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory under the output root that holds copied engine installations.
pub const INSTALL_DIR_NAME: &str = "fuzzers";

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Profile name {0:?} cannot be used as a directory name")]
    InvalidName(String),
    #[error("Profiles {first:?} and {second:?} map to the same output directory")]
    Collision { first: String, second: String },
    #[error("Failed to create output directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The output tree of a build run: one subdirectory per engine profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    root: PathBuf,
    dirs: BTreeMap<String, PathBuf>,
}

impl TargetLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, profile: &str) -> Option<&Path> {
        self.dirs.get(profile).map(PathBuf::as_path)
    }

    pub fn dirs(&self) -> &BTreeMap<String, PathBuf> {
        &self.dirs
    }
}

/// Maps a profile name to its output directory name. Names are lowercased
/// and must be plain `[a-z0-9_-]` words, so distinct names never alias.
pub fn subdir_name(profile: &str) -> Result<String, LayoutError> {
    let name = profile.to_ascii_lowercase();
    let valid = !name.is_empty()
        && name != INSTALL_DIR_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(LayoutError::InvalidName(profile.to_string()));
    }
    Ok(name)
}

/// Output directory of `profile` below `root`. Does not touch the disk.
pub fn profile_dir(root: &Path, profile: &EngineProfile) -> Result<PathBuf, LayoutError> {
    Ok(root.join(subdir_name(&profile.name)?))
}

/// Creates `root` and every profile's subdirectory that is not there yet.
///
/// Existing directories and their contents are left alone, so this can be
/// called repeatedly and with overlapping profile lists.
pub fn ensure_layout(root: &Path, profiles: &[EngineProfile]) -> Result<TargetLayout, LayoutError> {
    let mut dirs = BTreeMap::new();
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    for profile in profiles {
        let subdir = subdir_name(&profile.name)?;
        if let Some(first) = owners.insert(subdir.clone(), &profile.name) {
            return Err(LayoutError::Collision {
                first: first.to_string(),
                second: profile.name.clone(),
            });
        }
        dirs.insert(profile.name.clone(), root.join(subdir));
    }

    for path in std::iter::once(root).chain(dirs.values().map(PathBuf::as_path)) {
        fs::create_dir_all(path).map_err(|source| LayoutError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    log::debug!("Output layout ready under {root:?} ({} profiles)", dirs.len());

    Ok(TargetLayout {
        root: root.to_path_buf(),
        dirs,
    })
}

/// Finds the profile a built target belongs to, from the name of the
/// directory that contains it.
pub fn profile_for_target<'a>(
    target: &Path,
    profiles: &'a [EngineProfile],
) -> Option<&'a EngineProfile> {
    let dir_name = target.parent()?.file_name()?.to_str()?;
    profiles
        .iter()
        .find(|p| subdir_name(&p.name).is_ok_and(|name| name == dir_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::builtin_profiles;
    use pretty_assertions::assert_eq;

    fn profile(name: &str) -> EngineProfile {
        EngineProfile::new(name, "cc", "c++", "")
    }

    #[test]
    fn creates_one_directory_per_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("out");
        let layout = ensure_layout(&root, &builtin_profiles()).unwrap();
        for name in ["afl", "aflpp", "lafintel", "angora", "libfuzzer", "aflasan"] {
            let dir = layout.dir(name).unwrap();
            assert_eq!(dir, root.join(name));
            assert!(dir.is_dir());
        }
    }

    #[test]
    fn ensure_layout_is_idempotent_and_additive() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("out");
        let profiles = vec![profile("enginex"), profile("enginey")];

        let first = ensure_layout(&root, &profiles).unwrap();
        fs::write(root.join("enginex/target"), "built").unwrap();
        let second = ensure_layout(&root, &profiles).unwrap();
        ensure_layout(&root, &profiles[..1]).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(root.join("enginex/target")).unwrap(), "built");
        let mut entries: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["enginex", "enginey"]);
    }

    #[test]
    fn names_are_lowercased_and_checked() {
        assert_eq!(subdir_name("EngineX").unwrap(), "enginex");
        assert!(subdir_name("").is_err());
        assert!(subdir_name("../escape").is_err());
        assert!(subdir_name("a b").is_err());
        assert!(subdir_name(INSTALL_DIR_NAME).is_err());
    }

    #[test]
    fn case_insensitive_duplicates_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ensure_layout(tmp.path(), &[profile("afl"), profile("AFL")]).unwrap_err();
        assert!(matches!(err, LayoutError::Collision { .. }));
    }

    #[test]
    fn target_maps_back_to_profile() {
        let profiles = builtin_profiles();
        let found = profile_for_target(Path::new("/out/aflpp/fuzz-target"), &profiles).unwrap();
        assert_eq!(found.name, "aflpp");
        assert!(profile_for_target(Path::new("/out/unknown/fuzz-target"), &profiles).is_none());
        assert!(profile_for_target(Path::new("fuzz-target"), &profiles).is_none());
    }
}
