use clap::{Parser, Subcommand, ValueEnum};

use crate::uninstall::UninstallMode;

/// fspurge: remove an application and everything it left behind
#[derive(Parser, Debug)]
#[command(
    name = "fspurge",
    version,
    about = "Remove applications and their leftover files",
    long_about = "fspurge finds every file an application spread across the system,\n\
                  classifies it by confidence, snapshots it, and removes it with\n\
                  rollback if anything goes wrong.",
    after_help = "EXAMPLES:\n  \
        fspurge scan Slack                         Show what would be removed\n  \
        fspurge scan com.tinyspeck.slackmacgap     Look up by bundle identifier\n  \
        fspurge analyze Slack                      Processes, disk use, dependencies\n  \
        fspurge remove Slack                       Standard removal with snapshot\n  \
        fspurge remove Slack --mode force --yes    Kill processes, break locks\n  \
        fspurge snapshots                          List snapshots\n  \
        fspurge restore 3f9a0c1d2b4e5f60           Put a removed app back\n  \
        fspurge purge --expired                    Drop snapshots past retention"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Verbose output (logs to stderr)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Quiet mode, minimal output
    #[arg(long, short, global = true)]
    pub quiet: bool,
}

impl Cli {
    /// Effective output format; `--quiet` wins over `--format`
    pub fn output_format(&self) -> OutputFormat {
        if self.quiet {
            OutputFormat::Quiet
        } else {
            self.format.clone()
        }
    }

    pub fn show_progress(&self) -> bool {
        matches!(self.output_format(), OutputFormat::Human)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan a removal and show how every match was classified
    Scan {
        /// Application name, bundle identifier or .app path
        app: String,

        /// Mode whose threshold is used for classification
        #[arg(long, value_enum)]
        mode: Option<UninstallMode>,

        /// List every match, not only the summary
        #[arg(long)]
        detailed: bool,

        /// Skip the scan cache and walk every root again
        #[arg(long)]
        no_cache: bool,
    },

    /// Report running processes, launch items, disk use and bundle dependencies
    Analyze {
        /// Application name, bundle identifier or .app path
        app: String,

        /// Skip the scan cache and walk every root again
        #[arg(long)]
        no_cache: bool,
    },

    /// Remove an application and its leftovers
    Remove {
        /// Application name, bundle identifier or .app path
        app: String,

        /// Removal mode (defaults to the configured mode)
        #[arg(long, value_enum)]
        mode: Option<UninstallMode>,

        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,

        /// Do not seal a snapshot first (no rollback, no restore)
        #[arg(long)]
        no_backup: bool,

        /// Allow SIGKILL when a process ignores SIGTERM in standard mode
        #[arg(long)]
        escalate: bool,
    },

    /// List snapshots
    Snapshots {
        /// Print JSON regardless of --format
        #[arg(long)]
        json: bool,
    },

    /// Restore a snapshot to its original locations
    Restore {
        /// Snapshot id
        id: String,
    },

    /// Delete snapshots
    Purge {
        /// Only snapshots older than the retention period
        #[arg(long)]
        expired: bool,

        /// Every snapshot
        #[arg(long)]
        all: bool,

        /// One snapshot by id
        #[arg(long, value_name = "ID")]
        snapshot: Option<String>,

        /// Skip confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage the scan cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Create the data directory and a default config
    Init,

    /// Show current configuration
    Show,

    /// Reset to default configuration
    Reset,

    /// Print the config file location
    Path,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Forget every cached scan result
    Clear,

    /// Show cache size and hit rate
    Stats,
}

#[derive(Debug, Clone, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Quiet,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

impl From<CompletionShell> for clap_complete::Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => clap_complete::Shell::Bash,
            CompletionShell::Zsh => clap_complete::Shell::Zsh,
            CompletionShell::Fish => clap_complete::Shell::Fish,
        }
    }
}
