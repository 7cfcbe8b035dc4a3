use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "chat-export-rs",
    version,
    about = "Archive media and messages from a chat history, resuming where the last run stopped"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the YAML config file
    #[arg(short = 'c', long, global = true, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// Also write logs to daily-rolling files in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,

    /// Filter and log what would be downloaded without writing anything
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Export new media and messages (default)
    Run,
    /// Show the resume point, pending retries and archive totals
    Status {
        /// List items that failed permanently, with the reason
        #[arg(long)]
        failed: bool,
    },
    /// Check that every archived file is still on disk
    Verify {
        /// Also recompute SHA-256 digests and compare with the ledger
        #[arg(long)]
        checksums: bool,
    },
    /// Delete the state file so the next run starts from the beginning
    ResetState {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    pub fn effective_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_run() {
        let cli = Cli::try_parse_from(["chat-export-rs"]).unwrap();
        assert_eq!(cli.effective_command(), Command::Run);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        assert_eq!(cli.log_level, LogLevel::Info);
        assert!(!cli.dry_run);
        assert_eq!(cli.log_dir, None);
    }

    #[test]
    fn test_log_dir_flag() {
        let cli =
            Cli::try_parse_from(["chat-export-rs", "status", "--log-dir", "/var/log/export"]).unwrap();
        assert_eq!(cli.log_dir, Some(PathBuf::from("/var/log/export")));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "chat-export-rs",
            "run",
            "--dry-run",
            "--config",
            "/etc/export.yaml",
            "--no-progress-bar",
        ])
        .unwrap();
        assert_eq!(cli.effective_command(), Command::Run);
        assert!(cli.dry_run);
        assert!(cli.no_progress_bar);
        assert_eq!(cli.config, PathBuf::from("/etc/export.yaml"));
    }

    #[test]
    fn test_status_failed() {
        let cli = Cli::try_parse_from(["chat-export-rs", "status", "--failed"]).unwrap();
        assert_eq!(cli.effective_command(), Command::Status { failed: true });
    }

    #[test]
    fn test_verify_checksums() {
        let cli = Cli::try_parse_from(["chat-export-rs", "verify", "--checksums"]).unwrap();
        assert_eq!(cli.effective_command(), Command::Verify { checksums: true });
    }

    #[test]
    fn test_reset_state_yes() {
        let cli = Cli::try_parse_from(["chat-export-rs", "reset-state", "--yes"]).unwrap();
        assert_eq!(cli.effective_command(), Command::ResetState { yes: true });
    }

    #[test]
    fn test_log_level_values() {
        let cli = Cli::try_parse_from(["chat-export-rs", "--log-level", "warn"]).unwrap();
        assert_eq!(cli.log_level, LogLevel::Warn);
        assert!(Cli::try_parse_from(["chat-export-rs", "--log-level", "loud"]).is_err());
    }
}
