//! snapmirror - main entry point
//!
//! Mirrors the snapshots under SOURCE to TARGET, one snapshot per step.

use clap::Parser;
use nix::unistd::Uid;
use snapmirror::executor::Roots;
use snapmirror::exit::{codes, exit_code};
use snapmirror::shutdown::ShutdownCoordinator;
use snapmirror::{utils, Config, Mirror, MirrorError, RunMode, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the source snapshots
    source: PathBuf,

    /// Directory holding the mirrored snapshots
    target: PathBuf,

    /// Report the plan without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Mirror one snapshot, then stop
    #[arg(long)]
    single: bool,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Files fingerprinted and cloned concurrently (overrides config)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Minimum match confidence to clone, 1.0 = whole files only (overrides config)
    #[arg(long, value_name = "CONFIDENCE")]
    clone_threshold: Option<f64>,
}

impl Args {
    fn mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::DryRun {
                single: self.single,
            }
        } else if self.single {
            RunMode::Single
        } else {
            RunMode::Full
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(codes::INVALID_ARGS)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("snapmirror: {}", e);
            return ExitCode::from(exit_code(&e));
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level, &config.log.format) {
        eprintln!("snapmirror: failed to initialize logging: {:#}", e);
        return ExitCode::from(codes::CONFIGURATION);
    }

    tracing::info!(
        "Starting snapmirror v{} ({} -> {})",
        env!("CARGO_PKG_VERSION"),
        args.source.display(),
        args.target.display()
    );

    match run(&args, &config).await {
        Ok(summary) => {
            print_summary(&summary, args.json);
            ExitCode::from(codes::SUCCESS)
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn load_config(args: &Args) -> Result<Config, MirrorError> {
    let mut config = Config::load(args.config.as_deref())?;

    if let Some(jobs) = args.jobs {
        config.performance.jobs = jobs;
    }
    if let Some(threshold) = args.clone_threshold {
        config.engine.clone_threshold = threshold;
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: &Args, config: &Config) -> Result<RunSummary, MirrorError> {
    for root in [&args.source, &args.target] {
        if !root.is_dir() {
            return Err(MirrorError::Configuration(format!(
                "{} is not a directory",
                root.display()
            )));
        }
    }

    if !args.dry_run && !Uid::effective().is_root() {
        tracing::warn!("Not running as root, snapshot creation and finalization will likely fail");
    }

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.listen();

    let roots = Roots {
        source: args.source.clone(),
        target: args.target.clone(),
    };
    let mirror = Mirror::from_config(config, roots, shutdown.token());
    let result = mirror.run(args.mode()).await;

    listener.abort();
    result
}

fn print_summary(summary: &RunSummary, json: bool) {
    if json {
        match serde_json::to_string_pretty(summary) {
            Ok(out) => println!("{}", out),
            Err(e) => tracing::error!("Failed to serialize report: {}", e),
        }
    } else {
        print!("{}", summary.render_text());
    }
}
