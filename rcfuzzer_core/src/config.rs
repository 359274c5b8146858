use crate::env::{EnvError, Environment, compose};
use crate::install::EngineInstall;
use crate::launcher::RunnerSettings;
use crate::native::CommandBuildConfig;
use crate::profile::{EngineProfile, builtin_profiles, default_build_order};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Unknown engine profile {0:?}")]
    UnknownProfile(String),
    #[error("Environment variable {0} must be set")]
    MissingVar(&'static str),
    #[error("Invalid common environment: {0}")]
    Env(#[from] EnvError),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildSettings {
    #[serde(default = "default_build_command")]
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_build_order")]
    pub order: Vec<String>,
    /// Names of environment variables whose directories are protected
    /// around every build.
    #[serde(default = "default_protect")]
    pub protect: Vec<String>,
}

fn default_build_command() -> Vec<String> {
    ["/bin/bash", "-ex", "{SRC}/build.sh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_protect() -> Vec<String> {
    vec!["SRC".to_string(), "WORK".to_string()]
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            command: default_build_command(),
            working_dir: None,
            timeout_ms: None,
            order: default_build_order(),
            protect: default_protect(),
        }
    }
}

/// Switches every AFL-family engine needs inside the benchmark container.
pub fn default_common_env() -> BTreeMap<String, String> {
    [
        // No curses UI, so the logs stay readable.
        "AFL_NO_UI",
        // The CPU frequency check fails under Docker.
        "AFL_SKIP_CPUFREQ",
        // Docker already pins the container to one core.
        "AFL_NO_AFFINITY",
        "AFL_I_DONT_CARE_ABOUT_MISSING_CRASHES",
        // Seed corpora may contain crashing inputs.
        "AFL_SKIP_CRASHES",
        "AFL_SHUFFLE_QUEUE",
    ]
    .iter()
    .map(|name| (name.to_string(), "1".to_string()))
    .collect()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RcfuzzerConfig {
    #[serde(default)]
    pub build: BuildSettings,
    /// Applied on top of the process environment for builds and runs.
    #[serde(default = "default_common_env")]
    pub env: BTreeMap<String, String>,
    /// Extra profiles, or replacements for built-in ones of the same name.
    #[serde(default, rename = "profile")]
    pub profiles: Vec<EngineProfile>,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default, rename = "install")]
    pub installs: Vec<EngineInstall>,
}

impl Default for RcfuzzerConfig {
    fn default() -> Self {
        Self {
            build: BuildSettings::default(),
            env: default_common_env(),
            profiles: Vec::new(),
            runner: RunnerSettings::default(),
            installs: Vec::new(),
        }
    }
}

impl RcfuzzerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Built-in profiles with the configured ones merged in.
    pub fn profile_table(&self) -> Vec<EngineProfile> {
        let mut table = builtin_profiles();
        for profile in &self.profiles {
            match table.iter_mut().find(|p| p.name == profile.name) {
                Some(existing) => *existing = profile.clone(),
                None => table.push(profile.clone()),
            }
        }
        table
    }

    /// The profiles to build, in order. `only` replaces the configured order.
    pub fn selected_profiles(&self, only: Option<&[String]>) -> Result<Vec<EngineProfile>, ConfigError> {
        let table = self.profile_table();
        only.unwrap_or(&self.build.order)
            .iter()
            .map(|name| {
                table
                    .iter()
                    .find(|p| &p.name == name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownProfile(name.clone()))
            })
            .collect()
    }

    pub fn base_environment(&self, process: &Environment) -> Result<Environment, ConfigError> {
        let common = Environment::from_pairs(self.env.iter())?;
        Ok(compose(process, &common))
    }

    /// Directories to protect, resolved from `env`. Unset or empty variables
    /// are skipped.
    pub fn protected_paths(&self, env: &Environment) -> Vec<PathBuf> {
        self.build
            .protect
            .iter()
            .filter_map(|name| match env.get(name) {
                Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
                _ => {
                    log::warn!("{name} is not set, nothing to protect for it");
                    None
                }
            })
            .collect()
    }

    pub fn out_root(&self, env: &Environment) -> Result<PathBuf, ConfigError> {
        match env.get("OUT") {
            Some(out) if !out.is_empty() => Ok(PathBuf::from(out)),
            _ => Err(ConfigError::MissingVar("OUT")),
        }
    }

    pub fn command_build_config(&self) -> CommandBuildConfig {
        CommandBuildConfig {
            command: self.build.command.clone(),
            working_dir: self.build.working_dir.clone(),
            timeout: self.build.timeout_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RcfuzzerConfig::from_toml("").unwrap();
        assert_eq!(config.build, BuildSettings::default());
        assert_eq!(config.env, default_common_env());
        assert_eq!(config.runner, RunnerSettings::default());
        let names: Vec<_> = config
            .selected_profiles(None)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["afl", "aflpp", "lafintel", "libfuzzer"]);
    }

    #[test]
    fn full_config_parses() {
        let config = RcfuzzerConfig::from_toml(
            r#"
            [build]
            command = ["make", "-C", "{SRC}"]
            timeout-ms = 600000
            order = ["aflpp", "honggfuzz"]
            protect = ["SRC"]

            [env]
            AFL_NO_UI = "1"

            [[profile]]
            name = "honggfuzz"
            cc = "hfuzz-clang"
            cxx = "hfuzz-clang++"

            [runner]
            program = "/usr/local/bin/rcfuzz"

            [[install]]
            source = "/aflpp"
            dest = "fuzzers/aflpp"
            symlinks = true
            "#,
        )
        .unwrap();

        let profiles = config.selected_profiles(None).unwrap();
        assert_eq!(profiles[1].cc, "hfuzz-clang");
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.runner.args, RunnerSettings::default().args);
        assert_eq!(config.installs.len(), 1);
        assert_eq!(
            config.command_build_config().timeout,
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn shipped_config_parses() {
        let config =
            RcfuzzerConfig::from_toml(include_str!("../../rcfuzzer_cli/rcfuzzer.toml")).unwrap();
        assert_eq!(config.build, BuildSettings::default());
        assert_eq!(config.runner, RunnerSettings::default());
        assert_eq!(config.installs.len(), 9);
        let (engines, tools): (Vec<_>, Vec<_>) = config
            .installs
            .iter()
            .partition(|i| i.dest.starts_with("fuzzers"));
        assert_eq!(engines.len(), 8);
        assert_eq!(
            tools[0].dest,
            PathBuf::from("/usr/local/bin/learning_engine.py")
        );
        assert_eq!(
            config.installs.iter().filter(|i| i.symlinks).count(),
            1
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(RcfuzzerConfig::from_toml("[build]\ncomand = []\n").is_err());
    }

    #[test]
    fn configured_profile_replaces_builtin() {
        let config = RcfuzzerConfig::from_toml(
            r#"
            [[profile]]
            name = "afl"
            cc = "/afl/afl-clang"
            cxx = "/afl/afl-clang++"
            "#,
        )
        .unwrap();
        let table = config.profile_table();
        assert_eq!(table.iter().filter(|p| p.name == "afl").count(), 1);
        assert_eq!(table[0].cc, "/afl/afl-clang");
    }

    #[test]
    fn unknown_profile_in_selection_fails() {
        let config = RcfuzzerConfig::default();
        let only = vec!["afl".to_string(), "nope".to_string()];
        assert!(matches!(
            config.selected_profiles(Some(&only)),
            Err(ConfigError::UnknownProfile(name)) if name == "nope"
        ));
    }

    #[test]
    fn environment_derived_values() {
        let config = RcfuzzerConfig::default();
        let process =
            Environment::from_pairs([("OUT", "/out"), ("SRC", "/src"), ("AFL_NO_UI", "0")]).unwrap();
        let base = config.base_environment(&process).unwrap();
        assert_eq!(base.get("AFL_NO_UI"), Some("1"));
        assert_eq!(base.get("AFL_SKIP_CRASHES"), Some("1"));
        assert_eq!(config.out_root(&base).unwrap(), PathBuf::from("/out"));
        assert_eq!(config.protected_paths(&base), vec![PathBuf::from("/src")]);
        assert!(matches!(
            config.out_root(&Environment::new()),
            Err(ConfigError::MissingVar("OUT"))
        ));
    }
}
