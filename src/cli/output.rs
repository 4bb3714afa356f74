use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

use crate::analysis::AnalysisReport;
use crate::backup::{PurgeReport, RestoreReport, SnapshotSummary};
use crate::common::format::{
    self, format_confidence, format_duration, format_path, format_size, format_size_colored, format_strategies, print_kv,
};
use crate::scanner::cache::CacheStats;
use crate::scanner::FileMatch;
use crate::uninstall::{ExecutionReport, JobObserver, JobState, UninstallJob};

/// Spinner shown while a plan is being scanned
pub fn scan_spinner(app: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(format!("Scanning for {}...", app));
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Reports job progress on the terminal
pub struct ProgressObserver {
    bar: Option<ProgressBar>,
    total: u64,
}

impl ProgressObserver {
    pub fn new(total: usize, show: bool) -> Self {
        Self {
            bar: None,
            total: if show { total as u64 } else { 0 },
        }
    }

    pub fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }
}

impl JobObserver for ProgressObserver {
    fn on_state(&mut self, job: &UninstallJob) {
        if self.total == 0 {
            return;
        }
        match job.state {
            JobState::Removing => {
                let pb = ProgressBar::new(self.total);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.red} [{bar:40.red/blue}] {pos}/{len} Removing... {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("━━░"),
                );
                self.bar = Some(pb);
            }
            state if state.is_terminal() || state == JobState::Verifying => self.finish(),
            state => {
                let label = stage_label(state);
                if !label.is_empty() {
                    println!("  {} {}", "→".dimmed(), label);
                }
            }
        }
    }

    fn on_removed(&mut self, path: &Path, done: usize, _total: usize) {
        if let Some(pb) = &self.bar {
            pb.set_message(format::truncate(&format_path(path), 40));
            pb.set_position(done as u64);
        }
    }
}

fn stage_label(state: JobState) -> &'static str {
    match state {
        JobState::BackingUp => "Sealing snapshot...",
        JobState::TerminatingProcesses => "Stopping running processes...",
        _ => "",
    }
}

/// Print a planned job in human-readable format
pub fn print_plan(job: &UninstallJob, detailed: bool) {
    let c = &job.classification;
    println!();
    println!(
        "  {}  {} {}",
        "🔍",
        job.identity.display_name.bold(),
        format!("({})", job.identity.bundle_id).dimmed()
    );
    println!("{}", "─".repeat(72).dimmed());
    print_kv("Installed at", &format_path(&job.identity.install_path));
    if let Some(version) = &job.identity.version {
        print_kv("Version", version);
    }
    print_kv(
        "Mode",
        &format!("{} (confidence ≥ {:.0}%)", job.mode, job.threshold * 100.0),
    );
    println!("{}", "─".repeat(72).dimmed());
    println!();

    if c.total() == 0 {
        println!("  {} Nothing found for this application.", "✨");
        println!();
        return;
    }

    print_group("Will be removed", "●".green(), &c.removable, true);
    print_group("Needs review (below threshold)", "●".yellow(), &c.ambiguous, detailed);
    print_group("Protected (never removed)", "●".red(), &c.protected, detailed);

    if !job.scan_warnings.is_empty() {
        println!(
            "  {} {}",
            "⚠".yellow(),
            format!("{} warnings:", job.scan_warnings.len()).yellow()
        );
        for w in &job.scan_warnings {
            println!(
                "    {} {} {}",
                "→".dimmed(),
                format_path(&w.path).dimmed(),
                format!("({})", w.kind).dimmed()
            );
        }
        println!();
    }

    println!("{}", "─".repeat(72).dimmed());
    println!(
        "  {} Removable: {} in {} entries",
        "💾",
        format_size_colored(c.removable_bytes()),
        c.removable.len()
    );
    println!();
}

fn print_group(title: &str, bullet: ColoredString, matches: &[FileMatch], list: bool) {
    if matches.is_empty() {
        return;
    }
    let total: u64 = matches.iter().map(|m| m.size_bytes).sum();
    println!("  {} {} ({}, {})", bullet, title.bold(), matches.len(), format_size(total));
    if list {
        for m in matches {
            println!(
                "    {} {:<56} {:>10}  {}",
                format_confidence(m.confidence),
                format::truncate(&format_path(&m.path), 56),
                format_size(m.size_bytes),
                format_strategies(&m.matched_by).dimmed(),
            );
        }
    }
    println!();
}

pub fn print_plan_json(job: &UninstallJob) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    Ok(())
}

pub fn print_plan_quiet(job: &UninstallJob) {
    for m in &job.classification.removable {
        println!("{}\t{:.2}\t{}", m.path.display(), m.confidence, m.size_bytes);
    }
}

/// Print what an application runs, occupies and ships
pub fn print_analysis(report: &AnalysisReport) {
    let impact = &report.impact;
    let deps = &report.dependencies;
    println!();
    println!(
        "  {}  {} {}",
        "📊",
        report.identity.display_name.bold(),
        format!("({})", report.identity.bundle_id).dimmed()
    );
    println!("{}", "─".repeat(72).dimmed());
    print_kv("Installed at", &format_path(&report.identity.install_path));
    print_kv("Bundle size", &format_size(impact.install_bytes));
    print_kv("Leftovers", &format_size(impact.leftover_bytes));
    print_kv("Memory", &format_size(impact.memory_bytes));
    print_kv("CPU", &format!("{:.1}%", impact.cpu_percent));
    println!("{}", "─".repeat(72).dimmed());
    println!();

    println!("  {} {} ({})", "●".green(), "Running processes".bold(), impact.processes.len());
    for p in &impact.processes {
        let usage = p
            .usage
            .map(|u| format!("{:>10}  {:>5.1}%", format_size(u.memory_bytes), u.cpu_percent))
            .unwrap_or_default();
        println!(
            "    {:>7}  {:<44} {}",
            p.process.pid,
            format::truncate(&format_path(&p.process.executable), 44),
            usage
        );
    }
    for p in &impact.process_hints {
        println!(
            "    {:>7}  {} {}",
            p.pid,
            format::truncate(&format_path(&p.executable), 44).dimmed(),
            "(same name, not from this bundle)".dimmed()
        );
    }
    println!();

    if !impact.launch_items.is_empty() {
        println!("  {} {} ({})", "●".yellow(), "Launch items".bold(), impact.launch_items.len());
        for item in &impact.launch_items {
            println!("    {} {}", "→".dimmed(), format_path(item));
        }
        println!();
    }

    println!("  {} {} ({})", "●".cyan(), "Bundle dependencies".bold(), deps.total());
    let groups = [
        ("Frameworks", &deps.frameworks),
        ("Plug-ins", &deps.plugins),
        ("Loadable resources", &deps.resources),
        ("Executables", &deps.executables),
        ("Linked libraries", &deps.shared_libraries),
    ];
    for (title, names) in groups.iter().filter(|(_, names)| !names.is_empty()) {
        println!("    {}", title.dimmed());
        for name in names.iter() {
            println!("      {}", name);
        }
    }
    if let Some(err) = &deps.linker_error {
        println!("    {} {}", "⚠".yellow(), format!("linked libraries unavailable: {}", err).dimmed());
    }
    println!();

    if !report.scan_warnings.is_empty() {
        println!(
            "  {} {}",
            "⚠".yellow(),
            format!("{} scan warnings", report.scan_warnings.len()).yellow()
        );
        println!();
    }

    println!("{}", "─".repeat(72).dimmed());
    println!("  {} Disk: {}", "💾", format_size_colored(impact.disk_bytes()));
    println!();
}

/// Print the outcome of an executed job
pub fn print_execution_report(report: &ExecutionReport) {
    println!();
    let headline = match report.state {
        JobState::Completed => format!("{} Removed {} entries", "✓".green(), report.removed.len()),
        JobState::RolledBack => format!("{} Rolled back: {}", "↩️", reason(report).yellow()),
        _ => format!("{} Failed: {}", "✗".red(), reason(report).red()),
    };
    println!("  {}", headline);
    println!(
        "  {} Freed: {} in {}",
        "💾",
        format_size_colored(report.bytes_freed),
        format_duration(report.duration_secs)
    );
    if let Some(id) = &report.snapshot_id {
        println!("  {} Snapshot: {}", "📦", id.cyan());
    }
    if !report.not_attempted.is_empty() {
        println!("  {} Not attempted: {}", "⏸", report.not_attempted.len());
    }
    if !report.failed.is_empty() {
        println!("  {} Failed entries:", "⚠".yellow());
        for path in &report.failed {
            println!("    {} {}", "→".dimmed(), format_path(path));
        }
    }
    if let Some(restore) = &report.restore {
        println!(
            "  {} Restored {} entries ({} already in place)",
            "↩️",
            restore.restored,
            restore.already_present
        );
    }
    if !report.errors.is_empty() {
        println!();
        for err in &report.errors {
            println!("    {} {}", "⚠".yellow(), err.message.dimmed());
        }
    }
    if report.state == JobState::Completed {
        if let Some(id) = &report.snapshot_id {
            println!();
            println!("  {} Undo with {}", "💡", format!("fspurge restore {}", id).cyan());
        }
    }
    println!();
}

fn reason(report: &ExecutionReport) -> String {
    report
        .failure_reason
        .clone()
        .unwrap_or_else(|| report.state.to_string())
}

pub fn print_snapshots(snapshots: &[SnapshotSummary]) {
    println!();
    println!("  {} Snapshots", "📦");
    println!("{}", "─".repeat(80).dimmed());
    println!();

    if snapshots.is_empty() {
        println!("  No snapshots found.");
        println!();
        return;
    }

    println!(
        "  {:<18} {:<20} {:<24} {:<9} {:>10} {:>7}",
        "ID".dimmed(),
        "Created".dimmed(),
        "Application".dimmed(),
        "Mode".dimmed(),
        "Size".dimmed(),
        "Files".dimmed(),
    );
    println!("  {}", "─".repeat(78).dimmed());

    for s in snapshots {
        println!(
            "  {:<18} {:<20} {:<24} {:<9} {:>10} {:>7}",
            s.id,
            s.created_at.format("%Y-%m-%d %H:%M"),
            format::truncate(&s.app_name, 24),
            s.mode,
            format_size(s.total_bytes),
            s.file_count,
        );
    }

    println!();
    println!("  {} Restore: {}", "💡", "fspurge restore <ID>".cyan());
    println!("  {} Purge expired: {}", "💡", "fspurge purge --expired".cyan());
    println!();
}

pub fn print_restore_report(report: &RestoreReport) {
    println!();
    if report.is_complete() {
        println!(
            "  {} Restored {} entries ({}) from {}",
            "✓".green(),
            report.restored,
            format_size(report.restored_bytes),
            report.snapshot_id.cyan()
        );
    } else {
        println!(
            "  {} Restored {} entries, {} failed",
            "⚠".yellow(),
            report.restored,
            report.errors.len()
        );
        for err in &report.errors {
            println!(
                "    {} {} {}",
                "✗".red(),
                format_path(&err.path),
                err.message.dimmed()
            );
        }
    }
    if report.already_present > 0 {
        println!("  {} {} entries were already in place", "ℹ️", report.already_present);
    }
    println!();
}

pub fn print_purge_report(report: &PurgeReport) {
    println!();
    if report.purged.is_empty() {
        println!("  {} No snapshots to purge.", "✓".green());
    } else {
        println!(
            "  {} Purged {} snapshots, freed {}",
            "🔥",
            report.purged.len().to_string().cyan(),
            format_size_colored(report.total_bytes_freed),
        );
        for snapshot in &report.purged {
            println!(
                "    {} {} ({})",
                "✗".red(),
                snapshot.id,
                format_size(snapshot.bytes_freed),
            );
        }
    }

    if !report.errors.is_empty() {
        println!();
        for err in &report.errors {
            println!("    {} {}", "⚠".yellow(), err.dimmed());
        }
    }
    println!();
}

pub fn print_cache_stats(stats: Option<&CacheStats>) {
    println!();
    match stats {
        Some(s) => {
            println!("  {} Scan cache: {} entries", "⚡", s.entries);
            println!(
                "  {} This session: {} hits, {} misses, {} invalidated ({:.0}% hit rate)",
                "⚡",
                s.hits,
                s.misses,
                s.invalidated,
                s.hit_rate()
            );
        }
        None => println!("  {} Scan cache is disabled in the config.", "⚡"),
    }
    println!();
}
