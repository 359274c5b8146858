pub mod cancel;
pub mod config;
pub mod env;
mod fsutil;
pub mod install;
pub mod launcher;
pub mod layout;
pub mod native;
pub mod pipeline;
pub mod profile;
pub mod sequencer;
pub mod snapshot;

pub use cancel::CancelToken;
pub use config::{ConfigError, RcfuzzerConfig};
pub use env::{EnvError, Environment, compose};
pub use install::{EngineInstall, InstallError, install_all};
pub use launcher::{LaunchError, Launcher, RunnerSettings, prepare_run_dirs};
pub use layout::{LayoutError, TargetLayout, ensure_layout};
pub use native::{CommandBuild, CommandBuildConfig, NativeBuild, NativeBuildError};
pub use pipeline::{BuildError, BuildReport, BuildStage};
pub use profile::{EngineProfile, builtin_profiles};
pub use sequencer::{BuildSequencer, SequenceError, SequenceReport, check_output_outside};
pub use snapshot::{DirectorySnapshot, ProtectGuard, RestoreError, SnapshotError, protect};
