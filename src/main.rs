//! apex CLI - thin surface over apex-core's execution pipeline

use std::sync::Arc;

use apex_core::error::{ApexError, FixSuggestion};
use apex_core::planner::MockPlanner;
use apex_core::risk::{Approver, RiskAction, RiskLevel};
use apex_core::scheduler::MockRunner;
use apex_core::{
    ApexConfig, AuditLogger, FailClosedGate, KillSwitch, LockManager, Orchestrator, Outbox,
};
use clap::{Parser, Subcommand};
use colored::Colorize;

/// Prompts on stdin for Confirm/RequireApproval tasks; the gating decision itself
/// lives in `Orchestrator::run` (SPEC_FULL.md §4.5), this is just the y/N surface.
struct StdinApprover;

impl Approver for StdinApprover {
    fn approve(&self, task: &str, level: RiskLevel, action: RiskAction) -> bool {
        use std::io::Write;

        let prompt = match action {
            RiskAction::RequireApproval => format!(
                "{} {:?} risk task requires approval:\n  {}\napprove? [y/N] ",
                "!".red().bold(),
                level,
                task
            ),
            _ => format!(
                "{} {:?} risk task: {}\nconfirm? [y/N] ",
                "?".yellow().bold(),
                level,
                task
            ),
        };
        print!("{prompt}");
        if std::io::stdout().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[derive(Parser)]
#[command(name = "apex")]
#[command(about = "Execution core for a local autonomous-agent runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a task through the full pipeline
    Run {
        /// Natural-language task description
        task: String,

        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },

    /// Verify the audit log's hash chain
    VerifyAudit,

    /// Write (or refresh) today's audit chain anchor
    Anchor {
        /// Optional git tag prefix; when set, also creates `{prefix}-{date}`
        #[arg(long)]
        tag_prefix: Option<String>,
    },

    /// List orphaned actions (WAL has a Started record with no terminal entry)
    Reconcile,

    /// Kill-switch management
    Kill {
        #[command(subcommand)]
        action: KillAction,
    },

    /// Lock manager status
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },
}

#[derive(Subcommand)]
enum KillAction {
    /// Activate the kill switch
    Set {
        /// Reason recorded in the sentinel file
        #[arg(default_value = "manual activation")]
        reason: String,
    },
    /// Clear the kill switch
    Clear,
    /// Print whether the kill switch is active
    Status,
}

#[derive(Subcommand)]
enum LocksAction {
    /// Print how many locks this process currently holds
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ApexConfig::load().unwrap_or_default().with_env();

    let result = match cli.command {
        Commands::Run { task, workers } => run_task(&config, &task, workers).await,
        Commands::VerifyAudit => verify_audit(&config),
        Commands::Anchor { tag_prefix } => anchor_command(&config, tag_prefix.as_deref()),
        Commands::Reconcile => reconcile(&config),
        Commands::Kill { action } => kill_command(&config, action),
        Commands::Locks { action } => locks_command(&config, action),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

async fn run_task(config: &ApexConfig, task: &str, workers: usize) -> Result<(), ApexError> {
    let audit = Arc::new(AuditLogger::new(config.audit_dir())?);
    let kill_switch = Arc::new(KillSwitch::new(config.kill_switch_path.clone()));

    let pool = apex_core::outbox::open_pool(&config.db_path()).await?;
    apex_core::outbox::run_migrations(&pool, &config.db_path()).await?;
    let queue = apex_core::outbox::WriterQueue::spawn_with_config(
        pool.clone(),
        config.writer_queue.queue_size,
        Arc::clone(&kill_switch),
        apex_core::outbox::WriterConfig {
            flush: std::time::Duration::from_millis(config.writer_queue.flush_ms),
            max_batch: config.writer_queue.max_batch,
            max_crash_restarts: config.writer_queue.max_crash_restarts,
        },
    );
    let wal = apex_core::outbox::Wal::open(config.wal_path())?;
    let outbox = Arc::new(Outbox::new(wal, queue));

    let mut conditions: Vec<Box<dyn apex_core::risk::GateCondition>> = vec![
        Box::new(apex_core::risk::KillSwitchCondition::new(
            config.kill_switch_path.clone(),
        )),
        Box::new(apex_core::risk::ConfigPresentCondition::new(
            ApexConfig::config_path(),
        )),
        Box::new(apex_core::risk::AuditChainCondition::new(Arc::clone(&audit))),
    ];
    if let Some(min_bytes) = config.risk.min_disk_space_bytes {
        conditions.push(Box::new(apex_core::risk::DiskSpaceCondition::new(
            config.base_dir.clone(),
            min_bytes,
        )));
    }
    let gate = Arc::new(FailClosedGate::new(conditions));

    let orchestrator = Orchestrator {
        config: config.clone(),
        audit,
        gate,
        risk_policy: apex_core::risk::Policy::default(),
        approver: Arc::new(StdinApprover),
        outbox,
        db: pool,
        kill_switch,
        locks: Arc::new(LockManager::new()),
        planner: Arc::new(MockPlanner),
        runner: Arc::new(MockRunner),
        workers,
    };

    println!("{} classifying and planning: {}", "→".cyan(), task);
    let result = orchestrator.run(task).await?;

    println!(
        "{} run {} finished with outcome {:?}",
        "✓".green(),
        result.run_id,
        result.outcome
    );
    println!("  manifest: {}", result.manifest_path.display());

    Ok(())
}

fn verify_audit(config: &ApexConfig) -> Result<(), ApexError> {
    let audit = AuditLogger::new(config.audit_dir())?;
    let report = audit.verify()?;

    if report.valid {
        println!(
            "{} audit chain valid ({} records checked)",
            "✓".green(),
            report.records_checked
        );
    } else {
        println!(
            "{} audit chain broken at record {}",
            "✗".red().bold(),
            report.broken_at.unwrap_or(0)
        );
        std::process::exit(1);
    }

    Ok(())
}

fn anchor_command(config: &ApexConfig, tag_prefix: Option<&str>) -> Result<(), ApexError> {
    let audit = AuditLogger::new(config.audit_dir())?;
    let created = apex_core::audit::maybe_create_anchor(
        &audit,
        chrono::Utc::now().date_naive(),
        tag_prefix,
    )?;

    if created {
        println!("{} anchor written for today", "✓".green());
    } else {
        println!("{} today's anchor is already up to date", "✓".green());
    }

    Ok(())
}

fn reconcile(config: &ApexConfig) -> Result<(), ApexError> {
    let wal = apex_core::outbox::Wal::open(config.wal_path())?;
    let orphans = apex_core::outbox::reconcile(&wal)?;

    if orphans.is_empty() {
        println!("{} no orphaned actions", "✓".green());
    } else {
        println!("{} {} orphaned action(s):", "!".yellow().bold(), orphans.len());
        for orphan in orphans {
            println!(
                "  {} (trace {}) started {} task: {}",
                orphan.action_id, orphan.trace_id, orphan.started_at, orphan.task
            );
        }
    }

    Ok(())
}

fn kill_command(config: &ApexConfig, action: KillAction) -> Result<(), ApexError> {
    let kill_switch = KillSwitch::new(config.kill_switch_path.clone());

    match action {
        KillAction::Set { reason } => {
            kill_switch.activate(&reason)?;
            println!("{} kill switch activated: {}", "!".red().bold(), reason);
        }
        KillAction::Clear => {
            kill_switch.clear()?;
            println!("{} kill switch cleared", "✓".green());
        }
        KillAction::Status => {
            if kill_switch.is_active() {
                println!("{} kill switch is ACTIVE", "!".red().bold());
            } else {
                println!("{} kill switch is clear", "✓".green());
            }
        }
    }

    Ok(())
}

fn locks_command(config: &ApexConfig, action: LocksAction) -> Result<(), ApexError> {
    match action {
        LocksAction::Status => {
            let locks = LockManager::new();
            println!(
                "locks held by this process: {} (global lock path: {})",
                locks.held_count(),
                config.global_lock_path().display()
            );
        }
    }

    Ok(())
}
