use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cadre::config::Config;
use cadre::log::LogLevel;
use cadre::orchestration::{Approver, AutoApprover, Coordinator, RunOutcome, SessionConfig, ShellWorker, TerminalApprover};
use cadre::state::CheckpointStore;
use cadre::workflow::{PipelineSpec, Profile};
use cadre::{clog, clog_error, Result};

/// Cadre - phased task-graph orchestrator with approval gates and checkpoints
#[derive(Parser, Debug)]
#[command(name = "cadre")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADRE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadre/cadre.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Minimum log level: error, warn, info, debug or trace (overrides --debug)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Config file (defaults to ~/.cadre/cadre.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a pipeline to completion
    Run {
        /// Pipeline file (TOML)
        pipeline: PathBuf,

        /// Profile: shallow, deep, full or auto (defaults to the config value)
        #[arg(long, short = 'p')]
        profile: Option<Profile>,

        /// Restore every earlier phase from checkpoints and start here
        #[arg(long)]
        resume_from: Option<u32>,

        /// Maximum concurrent workers
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Session name (defaults to the pipeline name)
        #[arg(long)]
        session: Option<String>,

        /// Proceed at every gate without prompting
        #[arg(long, short = 'y')]
        yes: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a pipeline file and print its phases and task order
    Validate {
        pipeline: PathBuf,

        #[arg(long, short = 'p')]
        profile: Option<Profile>,
    },

    /// List stored checkpoints for a pipeline
    Checkpoints { pipeline: PathBuf },

    /// Delete stored checkpoints for a pipeline
    ClearCheckpoints { pipeline: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cadre::log::init_with_debug(cli.debug);
    if let Some(level) = cli.log_level {
        cadre::log::set_level(level);
    }
    if cadre::log::is_debug() {
        if let Some(path) = cadre::log::path() {
            eprintln!("Logging to {}", path.display());
        }
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            pipeline,
            profile,
            resume_from,
            workers,
            session,
            yes,
            json,
        } => {
            let outcome = run_pipeline(config, RunArgs {
                pipeline,
                profile,
                resume_from,
                workers,
                session,
                yes,
                json,
            })?;
            match outcome {
                RunOutcome::Success => Ok(()),
                RunOutcome::PartialFailure => std::process::exit(2),
                RunOutcome::FatalFailure => std::process::exit(1),
            }
        }
        Command::Validate { pipeline, profile } => run_validate(&config, &pipeline, profile),
        Command::Checkpoints { pipeline } => run_checkpoints(&config, &pipeline),
        Command::ClearCheckpoints { pipeline } => run_clear_checkpoints(&config, &pipeline),
    }
}

struct RunArgs {
    pipeline: PathBuf,
    profile: Option<Profile>,
    resume_from: Option<u32>,
    workers: Option<usize>,
    session: Option<String>,
    yes: bool,
    json: bool,
}

fn run_pipeline(mut config: Config, args: RunArgs) -> Result<RunOutcome> {
    clog!(
        "Run command: pipeline={}, profile={:?}, resume_from={:?}, workers={:?}, yes={}",
        args.pipeline.display(),
        args.profile,
        args.resume_from,
        args.workers,
        args.yes
    );
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    let profile = args.profile.unwrap_or(config.profile);
    let spec = PipelineSpec::load(&args.pipeline)?;
    let built = spec.build(profile)?;

    let executor = Arc::new(ShellWorker::new(config.effective_shell())?);
    let approver: Arc<dyn Approver> = if args.yes {
        Arc::new(AutoApprover::default())
    } else {
        Arc::new(TerminalApprover)
    };

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                clog!("Interrupted, cancelling session");
                interrupt.cancel();
            }
        });
        let mut coordinator = Coordinator::new(config, built, executor, approver)?.with_cancel(cancel);

        let mut session = SessionConfig::new(args.session.as_deref().unwrap_or(&spec.name))
            .meta("pipeline_file", &args.pipeline.display().to_string())
            .meta("profile", profile.as_str());
        session.resume_from = args.resume_from;
        coordinator.start_session(session).await?;
        coordinator.run().await
    });

    let report = match report {
        Ok(report) => report,
        Err(e) => {
            clog_error!("Run failed: {}", e);
            return Err(e);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        print!("{}", report.render());
    }
    Ok(report.outcome)
}

fn run_validate(config: &Config, pipeline: &Path, profile: Option<Profile>) -> Result<()> {
    let profile = profile.unwrap_or(config.profile);
    let spec = PipelineSpec::load(pipeline)?;
    let built = spec.build(profile)?;

    println!("{} ({}): {} task(s)", built.name, profile, built.graph.len());
    for phase in &built.phases {
        let keys: Vec<&str> = built
            .graph
            .tasks_in_phase(phase.number)
            .into_iter()
            .map(|t| t.key.as_str())
            .collect();
        println!("  phase {} {}: {}", phase.number, phase.name, keys.join(", "));
    }
    for gate in &built.gates {
        println!(
            "  gate {} before phase {} ({})",
            gate.id,
            gate.before_phase,
            gate.mode_for(profile)
        );
    }
    if !built.elided.is_empty() {
        println!("  elided: {}", built.elided.join(", "));
    }
    if let Some(ext) = &built.extension {
        println!(
            "  extension: {}.{} -> {} ({} task(s))",
            ext.source,
            ext.metric,
            ext.consumer,
            ext.tasks.len()
        );
    }

    let order: Vec<String> = built
        .graph
        .topological_order()?
        .into_iter()
        .filter_map(|id| built.graph.get(id).map(|t| t.key.clone()))
        .collect();
    println!("  order: {}", order.join(" -> "));
    Ok(())
}

fn run_checkpoints(config: &Config, pipeline: &Path) -> Result<()> {
    let spec = PipelineSpec::load(pipeline)?;
    let store = CheckpointStore::new(config.effective_checkpoint_dir()?);
    let phases = store.list(&spec.name)?;
    if phases.is_empty() {
        println!("No checkpoints for {}", spec.name);
        return Ok(());
    }
    println!("Checkpoints for {} ({}):", spec.name, store.pipeline_dir(&spec.name).display());
    for phase in phases {
        match store.load(&spec.name, phase)? {
            Some(checkpoint) => println!(
                "  phase {} {}: {} task(s), profile {}, written {}",
                phase,
                spec.phase_name(phase).unwrap_or("?"),
                checkpoint.tasks.len(),
                checkpoint.profile,
                checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("  phase {}: unreadable", phase),
        }
    }
    Ok(())
}

fn run_clear_checkpoints(config: &Config, pipeline: &Path) -> Result<()> {
    let spec = PipelineSpec::load(pipeline)?;
    let store = CheckpointStore::new(config.effective_checkpoint_dir()?);
    let removed = store.clear(&spec.name)?;
    clog!("Cleared {} checkpoint(s) for {}", removed, spec.name);
    println!("Removed {} checkpoint(s) for {}", removed, spec.name);
    Ok(())
}
