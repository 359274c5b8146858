use crate::env::{EnvError, Environment, compose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Static description of how to build a benchmark for one fuzzing engine.
///
/// Adding an engine means adding one of these, either to
/// [`builtin_profiles`] or as a `[[profile]]` table in the config file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineProfile {
    pub name: String,
    pub cc: String,
    pub cxx: String,
    /// Fuzzing runtime linked into the target, exported as `FUZZER_LIB`.
    #[serde(default)]
    pub fuzzer_lib: String,
    /// Extra variables set for the build (instrumentation, quiet mode, ...).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Flags appended to a variable's existing value instead of replacing it.
    #[serde(default)]
    pub append_flags: BTreeMap<String, Vec<String>>,
    /// Files copied from their install location into the profile's output
    /// directory after a successful build.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Extra arguments passed to the engine runner for targets of this
    /// profile.
    #[serde(default)]
    pub run_args: Vec<String>,
}

impl EngineProfile {
    pub fn new(name: &str, cc: &str, cxx: &str, fuzzer_lib: &str) -> Self {
        Self {
            name: name.to_string(),
            cc: cc.to_string(),
            cxx: cxx.to_string(),
            fuzzer_lib: fuzzer_lib.to_string(),
            env: BTreeMap::new(),
            append_flags: BTreeMap::new(),
            artifacts: Vec::new(),
            run_args: Vec::new(),
        }
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_appended_flags(mut self, name: &str, flags: &[&str]) -> Self {
        self.append_flags
            .entry(name.to_string())
            .or_default()
            .extend(flags.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    /// The variables this profile replaces: its extra `env` entries plus
    /// `CC`, `CXX` and `FUZZER_LIB`. An `env` entry naming one of those three
    /// with a different value is rejected.
    pub fn overrides(&self) -> Result<Environment, EnvError> {
        let toolchain = [
            ("CC", self.cc.as_str()),
            ("CXX", self.cxx.as_str()),
            ("FUZZER_LIB", self.fuzzer_lib.as_str()),
        ];
        Environment::from_pairs(
            self.env
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .chain(toolchain),
        )
    }

    /// Composes the environment for building this profile into `out_dir`.
    pub fn build_environment(
        &self,
        base: &Environment,
        out_dir: &Path,
    ) -> Result<Environment, EnvError> {
        let out = out_dir.to_string_lossy();
        let overrides = self.overrides()?.with_var("OUT", &out)?;
        let mut env = compose(base, &overrides);
        for (name, flags) in &self.append_flags {
            env = env.with_appended_flags(name, flags)?;
        }
        Ok(env)
    }
}

/// Profiles known out of the box, matching the engines shipped in the
/// benchmark image.
pub fn builtin_profiles() -> Vec<EngineProfile> {
    vec![
        EngineProfile::new("afl", "clang", "clang++", "/libAFL.a").with_artifact("/afl/afl-fuzz"),
        EngineProfile::new(
            "aflpp",
            "/aflpp/afl-clang-fast",
            "/aflpp/afl-clang-fast++",
            "/libAFLDriver.a",
        )
        // afl-clang-fast chatter on stderr breaks some configure scripts.
        .with_env("AFL_QUIET", "1")
        .with_env("AFL_MAP_SIZE", "2621440")
        .with_artifact("/aflpp/afl-fuzz"),
        EngineProfile::new(
            "lafintel",
            "/aflpp/afl-clang-fast",
            "/aflpp/afl-clang-fast++",
            "/libAFLDriver.a",
        )
        .with_env("AFL_QUIET", "1")
        .with_env("AFL_MAP_SIZE", "2621440")
        .with_env("AFL_LLVM_LAF_ALL", "1")
        .with_artifact("/aflpp/afl-fuzz"),
        EngineProfile::new(
            "angora",
            "/angora/bin/angora-clang",
            "/angora/bin/angora-clang++",
            "",
        )
        .with_artifact("/angora/angora_fuzzer"),
        EngineProfile::new("libfuzzer", "clang", "clang++", "/usr/lib/libFuzzer.a")
            .with_appended_flags("CFLAGS", &["-fsanitize=fuzzer-no-link"])
            .with_appended_flags("CXXFLAGS", &["-fsanitize=fuzzer-no-link"]),
        EngineProfile::new("aflasan", "clang", "clang++", "/libAFL.a")
            .with_env("CFLAGS", "-fsanitize=address")
            .with_env("CXXFLAGS", "-fsanitize=address"),
    ]
}

/// Build order used when the config does not name one. `angora` and
/// `aflasan` are defined but not built by default.
pub fn default_build_order() -> Vec<String> {
    ["afl", "aflpp", "lafintel", "libfuzzer"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
