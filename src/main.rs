use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};

use cadence::cleanup::{CleanupConfig, CleanupManager, OrphanCandidate};
use cadence::config::Config;
use cadence::orchestration::{CommandScorer, CommandWorker, WorkerExecutor};
use cadence::session::{Session, SessionId, SessionPaths};
use cadence::state::GroupRegistry;
use cadence::workflow::{self, Coordinator, PhaseOutcome, PipelineReport};
use cadence::{clog, Error, Result};

/// cadence - dependency-aware task orchestration with checkpointed resume
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_HOME=<dir>   State directory (default ~/.cadence)\n    CADENCE_DEBUG=1      Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to <cadence home>/cadence.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a new session from a plan file (TOML or JSON)
    Run {
        /// Path to the plan file
        plan: PathBuf,

        /// Session id (generated if omitted)
        #[arg(long)]
        session: Option<String>,

        /// Override scheduler.pool_size
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Resume a session from its checkpoints
    Resume {
        session: String,
    },

    /// Show a session's phases and task counts
    Status {
        /// Session id (lists all sessions if omitted)
        session: Option<String>,
    },

    /// Find orphaned worker groups older than the orphan threshold
    Cleanup {
        /// Actually delete orphans (default: just report)
        #[arg(long)]
        delete: bool,

        /// Skip confirmation prompt when deleting
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cadence::log::init(cli.debug);

    let result = match cli.command {
        Command::Run {
            plan,
            session,
            pool_size,
        } => run_pipeline(plan, session, pool_size),
        Command::Resume { session } => run_resume(session),
        Command::Status { session } => run_status(session),
        Command::Cleanup { delete, yes } => run_cleanup(delete, yes),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_configuration() => {
            eprintln!("configuration error: {}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(pool_size: Option<usize>) -> Result<(PathBuf, Config)> {
    let home = Config::cadence_dir()?;
    let mut config = Config::load()?;
    if let Some(size) = pool_size {
        config.scheduler.pool_size = size;
    }
    config.validate()?;
    Ok((home, config))
}

fn coordinator(home: PathBuf, config: Config) -> Result<Coordinator> {
    let Some(command) = config.worker_command.clone() else {
        return Err(Error::Validation(
            "worker_command is not set in cadence.toml".to_string(),
        ));
    };
    let cwd = std::env::current_dir()?;
    let worker = Arc::new(CommandWorker::new(command).with_cwd(&cwd));
    let scorer = config
        .scorer_command
        .clone()
        .map(|c| Arc::new(CommandScorer::new(c).with_cwd(&cwd)));

    let executor: Arc<dyn WorkerExecutor> = worker.clone();
    let mut coordinator = Coordinator::new(home, config, executor);
    if let Some(scorer) = scorer {
        coordinator = coordinator.with_convergence(worker, scorer);
    }
    Ok(coordinator)
}

fn print_report(report: &PipelineReport) {
    println!("Session {}: {}", report.session_id, report.status);
    for record in &report.phases {
        let outcome = match record.outcome {
            PhaseOutcome::Skipped => "skipped (checkpoint verified)",
            PhaseOutcome::Completed => "completed",
            PhaseOutcome::Failed => "failed",
            PhaseOutcome::TimedOut => "timed out",
        };
        match &record.detail {
            Some(detail) => println!("  {:<9} {} ({})", record.phase, outcome, detail),
            None => println!("  {:<9} {}", record.phase, outcome),
        }
    }
    if let Some(counts) = report.counts {
        println!(
            "  tasks: {} completed, {} blocked, {} pending",
            counts.completed, counts.blocked, counts.pending
        );
    }
    if let Some(verdict) = report.convergence {
        println!("  convergence: {}", verdict);
    }
    if !report.cleanup.is_empty() {
        println!(
            "  preflight: {} orphaned groups, {} removed",
            report.cleanup.orphaned_count(),
            report.cleanup.removed_count()
        );
    }
    let warnings = cadence::log::warning_count();
    if warnings > 0 {
        println!("  {} warnings; see the session log", warnings);
    }
}

fn redirect_log(home: &std::path::Path, id: &SessionId) {
    let paths = SessionPaths::new(home, id);
    if std::fs::create_dir_all(paths.dir()).is_ok() {
        cadence::log::redirect(&paths.log());
    }
}

fn run_pipeline(plan: PathBuf, session: Option<String>, pool_size: Option<usize>) -> Result<()> {
    let (home, config) = load_config(pool_size)?;
    let id = match session {
        Some(raw) => SessionId::parse(&raw)?,
        None => SessionId::generate(),
    };
    redirect_log(&home, &id);
    clog!("Run command: plan={} session={}", plan.display(), id);

    let coordinator = coordinator(home, config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(coordinator.start(&plan, Some(id)))?;
    print_report(&report);
    Ok(())
}

fn run_resume(session: String) -> Result<()> {
    let (home, config) = load_config(None)?;
    let id = SessionId::parse(&session)?;
    redirect_log(&home, &id);
    clog!("Resume command: session={}", id);

    let coordinator = coordinator(home, config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(coordinator.resume(&id))?;
    print_report(&report);
    Ok(())
}

fn run_status(session: Option<String>) -> Result<()> {
    let home = Config::cadence_dir()?;
    let Some(raw) = session else {
        let sessions = Session::list(&home)?;
        if sessions.is_empty() {
            println!("No sessions");
        }
        for s in sessions {
            println!(
                "{:<24} {:<10} {}",
                s.id,
                s.status,
                s.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        return Ok(());
    };

    let id = SessionId::parse(&raw)?;
    let overview = workflow::inspect(&home, &id)?;
    println!("Session {}: {}", overview.session.id, overview.session.status);
    println!("  plan: {}", overview.session.plan_path.display());
    for cp in &overview.checkpoints {
        println!(
            "  {:<9} {:<11} #{} {}",
            cp.phase,
            cp.status,
            cp.sequence,
            cp.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(counts) = overview.counts {
        println!(
            "  tasks: {} completed, {} blocked, {} total",
            counts.completed,
            counts.blocked,
            counts.total()
        );
    }
    if let Some(verdict) = overview.convergence {
        println!("  convergence: {}", verdict);
    }
    Ok(())
}

fn describe(candidate: &OrphanCandidate) -> String {
    let age = candidate
        .age
        .map(|a| format!("{}m old", a.num_minutes()))
        .unwrap_or_else(|| "age unknown".to_string());
    let owner = candidate
        .owner
        .map(|o| format!("owner {}", o.short()))
        .unwrap_or_else(|| "unreadable record".to_string());
    format!("{} ({}, {})", candidate.id, age, owner)
}

/// Report stale worker groups, and reclaim them with `--delete`.
fn run_cleanup(delete: bool, skip_confirm: bool) -> Result<()> {
    clog!("Cleanup command: delete={}, yes={}", delete, skip_confirm);
    let home = Config::cadence_dir()?;
    let config = Config::load()?;
    let manager = CleanupManager::new(
        GroupRegistry::from_home(&home),
        CleanupConfig::from_settings(&config.pool),
    );

    let now = Utc::now();
    let stale = manager.find_stale(now)?;
    println!("Orphaned worker groups: {}", stale.len());
    for candidate in &stale {
        println!("  - {}", describe(candidate));
    }
    if stale.is_empty() {
        println!("No orphaned worker groups found.");
        return Ok(());
    }
    if !delete {
        println!("Run with --delete to remove them.");
        return Ok(());
    }

    let report = manager.reclaim_stale(now, |candidates| {
        if skip_confirm {
            return true;
        }
        print!("Permanently delete {} worker group(s)? [y/N] ", candidates.len());
        let _ = std::io::Write::flush(&mut std::io::stdout());
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
    })?;

    if !report.skipped.is_empty() {
        println!("Cleanup cancelled.");
        return Ok(());
    }
    println!("Removed {} worker group(s).", report.removed_count());
    for (id, reason) in &report.failed {
        println!("  failed: {}: {}", id, reason);
    }
    Ok(())
}
