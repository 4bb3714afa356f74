use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::io::Write;

use fspurge::cli::args::{CacheAction, Cli, Commands, ConfigAction, OutputFormat};
use fspurge::cli::output::{self, ProgressObserver};
use fspurge::common::config::Config;
use fspurge::common::{format, logging};
use fspurge::uninstall::{CancelToken, Engine, JobState, PlanOptions, UninstallMode};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let _log_guard = logging::init(cli.verbose, &Config::data_dir().join("logs"));

    match cli.command {
        Commands::Scan {
            ref app,
            mode,
            detailed,
            no_cache,
        } => cmd_scan(&cli, app, mode, detailed, no_cache),

        Commands::Analyze { ref app, no_cache } => cmd_analyze(&cli, app, no_cache),

        Commands::Remove {
            ref app,
            mode,
            yes,
            no_backup,
            escalate,
        } => cmd_remove(&cli, app, mode, yes, no_backup, escalate),

        Commands::Snapshots { json } => cmd_snapshots(&cli, json),

        Commands::Restore { ref id } => cmd_restore(&cli, id),

        Commands::Purge {
            expired,
            all,
            ref snapshot,
            yes,
        } => cmd_purge(&cli, expired, all, snapshot.clone(), yes),

        Commands::Config { ref action } => cmd_config(action),

        Commands::Cache { ref action } => cmd_cache(&cli, action),

        Commands::Completions { ref shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(
                clap_complete::Shell::from(shell.clone()),
                &mut cmd,
                "fspurge",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn open_engine(config: Config) -> Result<Engine> {
    Engine::open(config, Config::data_dir()).context("Failed to open the fspurge data directory")
}

/// Ask a yes/no question on stdin; anything but "y" is a no
fn prompt(question: &str) -> Result<bool> {
    print!("  {} {} [y/N] ", "❓", question);
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

// ─── Scan ─────────────────────────────────────────────────────────────────────

fn cmd_scan(cli: &Cli, app: &str, mode: Option<UninstallMode>, detailed: bool, no_cache: bool) -> Result<()> {
    let mut config = Config::load()?;
    if no_cache {
        config.scan.use_cache = false;
    }
    let mode = mode.unwrap_or(config.default_mode);
    let engine = open_engine(config)?;

    let identity = engine.resolve_identity(app)?;
    let spinner = cli.show_progress().then(|| output::scan_spinner(&identity.display_name));
    let job = engine.plan(identity, mode)?;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    match cli.output_format() {
        OutputFormat::Human => output::print_plan(&job, detailed),
        OutputFormat::Json => output::print_plan_json(&job)?,
        OutputFormat::Quiet => output::print_plan_quiet(&job),
    }

    engine.close().context("Failed to save the scan cache")?;
    Ok(())
}

// ─── Analyze ──────────────────────────────────────────────────────────────────

fn cmd_analyze(cli: &Cli, app: &str, no_cache: bool) -> Result<()> {
    let mut config = Config::load()?;
    if no_cache {
        config.scan.use_cache = false;
    }
    let engine = open_engine(config)?;

    let identity = engine.resolve_identity(app)?;
    let spinner = cli.show_progress().then(|| output::scan_spinner(&identity.display_name));
    let report = engine.analyze(identity)?;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    match cli.output_format() {
        OutputFormat::Human => output::print_analysis(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Quiet => println!(
            "{}  {}  {}  {}",
            report.identity.bundle_id,
            report.impact.processes.len(),
            report.impact.launch_items.len(),
            report.impact.disk_bytes()
        ),
    }

    engine.close().context("Failed to save the scan cache")?;
    Ok(())
}

// ─── Remove ───────────────────────────────────────────────────────────────────

fn cmd_remove(
    cli: &Cli,
    app: &str,
    mode: Option<UninstallMode>,
    yes: bool,
    no_backup: bool,
    escalate: bool,
) -> Result<()> {
    let config = Config::load()?;
    let mode = mode.unwrap_or(config.default_mode);
    let engine = open_engine(config)?;

    let identity = engine.resolve_identity(app)?;
    let options = PlanOptions {
        unattended: false,
        skip_backup: no_backup,
        allow_escalation: escalate,
    };
    let spinner = cli.show_progress().then(|| output::scan_spinner(&identity.display_name));
    let mut job = engine.plan_with(identity, mode, options)?;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    if cli.output_format() == OutputFormat::Human {
        output::print_plan(&job, false);
    }

    if job.classification.removable.is_empty() {
        engine.decline(&mut job)?;
        if cli.output_format() == OutputFormat::Human {
            println!("  {} Nothing to remove.", "✓".green());
        }
        engine.close()?;
        return Ok(());
    }

    let approved = yes
        || prompt(&format!(
            "Remove {} entries ({}) for '{}'?",
            job.classification.removable.len(),
            format::format_size(job.classification.removable_bytes()),
            job.identity.display_name
        ))?;
    if !approved {
        engine.decline(&mut job)?;
        println!("  {} Cancelled", "✗".red());
        engine.close()?;
        return Ok(());
    }
    engine.confirm(&mut job)?;

    let mut observer = ProgressObserver::new(job.classification.removable.len(), cli.show_progress());
    let report = engine.execute(&mut job, &CancelToken::new(), &mut observer)?;
    observer.finish();

    match cli.output_format() {
        OutputFormat::Human => output::print_execution_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Quiet => println!(
            "{}  {}  {}",
            report.state,
            report.removed.len(),
            report.snapshot_id.as_deref().unwrap_or("-")
        ),
    }

    engine.close().context("Failed to save the scan cache")?;
    if report.state != JobState::Completed {
        anyhow::bail!("Uninstall of '{}' ended as {}", job.identity.display_name, report.state);
    }
    Ok(())
}

// ─── Snapshots ────────────────────────────────────────────────────────────────

fn cmd_snapshots(cli: &Cli, json: bool) -> Result<()> {
    let engine = open_engine(Config::load()?)?;
    let snapshots = engine.list_snapshots()?;

    let format = if json { OutputFormat::Json } else { cli.output_format() };
    match format {
        OutputFormat::Human => output::print_snapshots(&snapshots),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshots)?),
        OutputFormat::Quiet => {
            for s in &snapshots {
                println!(
                    "{}  {}  {}  {}",
                    s.id,
                    s.created_at.format("%Y-%m-%d"),
                    s.bundle_id,
                    format::format_size(s.total_bytes)
                );
            }
        }
    }
    Ok(())
}

fn cmd_restore(cli: &Cli, id: &str) -> Result<()> {
    let engine = open_engine(Config::load()?)?;
    let report = engine
        .restore(id)
        .with_context(|| format!("Failed to restore snapshot '{}'", id))?;

    match cli.output_format() {
        OutputFormat::Human => output::print_restore_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Quiet => println!("{}  {}  {}", report.snapshot_id, report.restored, report.errors.len()),
    }

    engine.close()?;
    if !report.is_complete() {
        anyhow::bail!("{} entries could not be restored", report.errors.len());
    }
    Ok(())
}

// ─── Purge ────────────────────────────────────────────────────────────────────

fn cmd_purge(cli: &Cli, expired: bool, all: bool, snapshot: Option<String>, yes: bool) -> Result<()> {
    let engine = open_engine(Config::load()?)?;

    if let Some(id) = snapshot {
        if !yes && !prompt(&format!("Permanently delete snapshot '{}'?", id))? {
            println!("  {} Cancelled", "✗".red());
            return Ok(());
        }
        let freed = engine.purge_snapshot(&id)?;
        if cli.output_format() != OutputFormat::Quiet {
            println!("  {} Purged '{}', freed {}", "🔥", id, format::format_size(freed));
        }
        return Ok(());
    }

    let report = if all {
        let snapshots = engine.list_snapshots()?;
        let total: u64 = snapshots.iter().map(|s| s.archive_bytes).sum();
        if !yes
            && !prompt(&format!(
                "Permanently delete ALL {} snapshots ({})?",
                snapshots.len(),
                format::format_size(total)
            ))?
        {
            println!("  {} Cancelled", "✗".red());
            return Ok(());
        }
        engine.purge_all_snapshots()?
    } else if expired {
        engine.purge_expired_snapshots()?
    } else {
        println!();
        println!("  {} Purge snapshots", "🔥");
        println!();
        println!("  Usage:");
        println!("    {} Past retention only", "fspurge purge --expired".cyan());
        println!("    {} Every snapshot", "fspurge purge --all".cyan());
        println!("    {} One snapshot", "fspurge purge --snapshot <ID>".cyan());
        println!();
        println!(
            "  Retention: {} days",
            engine.config().snapshot_retention_days
        );
        println!();
        return Ok(());
    };

    match cli.output_format() {
        OutputFormat::Human => output::print_purge_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Quiet => println!("{}  {}", report.purged.len(), report.total_bytes_freed),
    }
    Ok(())
}

// ─── Config ───────────────────────────────────────────────────────────────────

fn cmd_config(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let data_dir = Config::data_dir();
            for dir in ["snapshots", "logs"] {
                std::fs::create_dir_all(data_dir.join(dir))
                    .with_context(|| format!("Failed to create {}", data_dir.join(dir).display()))?;
            }
            let path = Config::config_path();
            if !path.exists() {
                Config::default().save()?;
            }
            println!("  {} fspurge initialized at {}", "✓".green(), data_dir.display());
            println!("  Created: config.toml, snapshots/, logs/");
            Ok(())
        }
        ConfigAction::Show => {
            let config = Config::load()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Reset => {
            Config::default().save()?;
            println!("  {} Configuration reset to defaults", "✓".green());
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
            Ok(())
        }
    }
}

// ─── Cache ────────────────────────────────────────────────────────────────────

fn cmd_cache(cli: &Cli, action: &CacheAction) -> Result<()> {
    let engine = open_engine(Config::load()?)?;
    match action {
        CacheAction::Clear => {
            engine.clear_cache()?;
            if cli.output_format() != OutputFormat::Quiet {
                println!("  {} Scan cache cleared. Next scan will be fresh.", "✓".green());
            }
        }
        CacheAction::Stats => {
            let stats = engine.cache_stats();
            match cli.output_format() {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                _ => output::print_cache_stats(stats.as_ref()),
            }
        }
    }
    engine.close()?;
    Ok(())
}
