use rcfuzzer_core::config::RcfuzzerConfig;
use rcfuzzer_core::env::Environment;
use rcfuzzer_core::install::install_all;
use rcfuzzer_core::launcher::Launcher;
use rcfuzzer_core::native::CommandBuild;
use rcfuzzer_core::sequencer::{BuildSequencer, SequenceReport, check_output_outside};
use rcfuzzer_core::CancelToken;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};

const DEFAULT_CONFIG_FILE: &str = "rcfuzzer.toml";

/// Exit code used when a protected directory could not be restored.
const RESTORE_FAILURE_EXIT: u8 = 3;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the benchmark once per engine profile into $OUT/<profile>.
    Build {
        /// Profiles to build, in order, instead of the configured order.
        #[clap(long, value_delimiter = ',')]
        only: Option<Vec<String>>,
        /// Output root; defaults to $OUT.
        #[clap(long)]
        out: Option<PathBuf>,
    },
    /// Fuzz a built target with the engine it was built for.
    Run {
        input_corpus: PathBuf,
        output_corpus: PathBuf,
        target_binary: PathBuf,
    },
    /// List the known engine profiles and the default build order.
    Profiles,
}

fn load_config(path: Option<PathBuf>) -> Result<RcfuzzerConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            log::info!("Loading configuration from specified path: {config_path:?}");
            RcfuzzerConfig::load_from_file(&config_path)
                .with_context(|| format!("Cannot load {config_path:?}"))
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                log::info!("Loading default configuration: {default_config_path:?}");
                RcfuzzerConfig::load_from_file(&default_config_path)
                    .with_context(|| format!("Cannot load {default_config_path:?}"))
            } else {
                log::info!("No {DEFAULT_CONFIG_FILE} found, using built-in defaults");
                Ok(RcfuzzerConfig::default())
            }
        }
    }
}

fn print_summary(report: &SequenceReport) {
    println!("Output root: {:?}", report.layout.root());
    for build in &report.completed {
        println!("  {} ok ({:.2?})", build.profile, build.duration);
        for output in &build.outputs {
            println!("    {} {}", output.md5, output.path.display());
        }
    }
    if let Some(failure) = &report.failure {
        println!(
            "  {} FAILED at {}: {}",
            failure.profile,
            failure.error.stage(),
            failure.error
        );
    }
    for name in &report.skipped {
        println!("  {name} not attempted");
    }
}

fn handle_build(
    config: &RcfuzzerConfig,
    only: Option<Vec<String>>,
    out: Option<PathBuf>,
) -> Result<ExitCode, anyhow::Error> {
    let mut base_env = config.base_environment(&Environment::from_process())?;
    if let Some(out) = out {
        base_env = base_env.with_var("OUT", &out.to_string_lossy())?;
    }
    let out_root = config.out_root(&base_env)?;
    let profiles = config.selected_profiles(only.as_deref())?;
    let protected = config.protected_paths(&base_env);

    check_output_outside(&out_root, &protected)?;
    install_all(&config.installs, &out_root).context("Cannot install engines")?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupted, stopping after the current build is restored");
        handler_token.cancel();
    })
    .context("Cannot install interrupt handler")?;

    let mut native = CommandBuild::new(config.command_build_config(), cancel.clone());
    let report = BuildSequencer::new(&mut native, cancel)
        .run(&profiles, &base_env, &protected, &out_root)?;
    print_summary(&report);

    if report.is_fatal() {
        log::error!("Source tree may be corrupted, do not reuse it without a fresh checkout");
        return Ok(ExitCode::from(RESTORE_FAILURE_EXIT));
    }
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn exit_code_of(status: ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        return ExitCode::from(code as u8);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitCode::from((128 + signal) as u8);
        }
    }
    ExitCode::FAILURE
}

fn handle_run(
    config: &RcfuzzerConfig,
    input_corpus: PathBuf,
    output_corpus: PathBuf,
    target_binary: PathBuf,
) -> Result<ExitCode, anyhow::Error> {
    let env = config.base_environment(&Environment::from_process())?;
    let profiles = config.profile_table();
    let launcher = Launcher::new(&profiles, &config.runner, env);
    let status = launcher.run(&input_corpus, &output_corpus, &target_binary)?;
    Ok(exit_code_of(status))
}

fn handle_profiles(config: &RcfuzzerConfig) {
    for profile in config.profile_table() {
        let marker = if config.build.order.contains(&profile.name) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<10} CC={} CXX={} FUZZER_LIB={}",
            profile.name, profile.cc, profile.cxx, profile.fuzzer_lib
        );
    }
    println!("Build order: {}", config.build.order.join(", "));
}

fn main() -> Result<ExitCode, anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(cli.config_file)?;

    match cli.command {
        Command::Build { only, out } => handle_build(&config, only, out),
        Command::Run {
            input_corpus,
            output_corpus,
            target_binary,
        } => handle_run(&config, input_corpus, output_corpus, target_binary),
        Command::Profiles => {
            handle_profiles(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}
