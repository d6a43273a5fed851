//! Command-line interface definitions for dupindex.
//!
//! This module defines all CLI arguments, subcommands, and options using the clap derive API.
//! The CLI follows standard conventions with global options (verbosity, database location,
//! worker count) and subcommands for different operations.
//!
//! # Example
//!
//! ```bash
//! # Index two trees with 8 workers
//! dupindex scan ~/photos ~/backup --threads 8
//!
//! # Check one file against the index
//! dupindex check ~/Downloads/img_0042.jpg
//!
//! # List every duplicate group as JSON
//! dupindex report --json
//!
//! # Repair drift between the index and the filesystem
//! dupindex audit
//!
//! # Drop index entries under a path that was deleted wholesale
//! dupindex remove '/mnt/old-disk/'
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Persistent file fingerprint index with concurrent duplicate detection.
///
/// dupindex maintains a database mapping file paths to content fingerprints
/// (MD5, size, mtime), skips unchanged files on rescan, and reports files
/// with identical content across everything ever indexed.
#[derive(Debug, Parser)]
#[command(name = "dupindex")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit fatal errors as JSON on stderr (for scripting)
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Path to the index database (defaults to the platform data directory)
    #[arg(long, value_name = "FILE", global = true, env = "DUPINDEX_DB")]
    pub db_path: Option<PathBuf>,

    /// Number of worker threads for scan and audit
    #[arg(short, long, value_name = "N", global = true)]
    pub threads: Option<usize>,

    /// Maximum attempts when the index database is busy
    #[arg(long, value_name = "N", global = true)]
    pub retry_attempts: Option<u32>,

    /// Delay between busy retries, in milliseconds
    #[arg(long, value_name = "MS", global = true)]
    pub retry_delay_ms: Option<u64>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands for dupindex.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan directories (or single files) into the index
    Scan(ScanArgs),
    /// Fingerprint one file and list indexed files with identical content
    Check {
        /// File to check against the index
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Report every duplicate group in the index
    Report(ReportArgs),
    /// Walk the index and repair drift against the live filesystem
    Audit,
    /// Report total space reclaimable by deduplicating
    Waste,
    /// Count indexed paths starting with a prefix
    Count {
        /// Path prefix to match
        #[arg(value_name = "PREFIX")]
        prefix: String,
    },
    /// Remove index entries whose paths match a regex
    Remove {
        /// Regex matched from the start of each stored path
        #[arg(value_name = "PATTERN")]
        pattern: String,
    },
}

/// Arguments for the scan subcommand.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Directories or files to scan
    #[arg(value_name = "PATH", required = true, num_args = 1..)]
    pub paths: Vec<PathBuf>,

    /// Follow symbolic links during the walk
    ///
    /// Symlink cycles are detected and broken rather than looping forever.
    #[arg(long)]
    pub follow_symlinks: bool,
}

/// Arguments for the report subcommand.
#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Only report fingerprints shared by more than this many entries
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub min_count: usize,

    /// Emit the report as pretty-printed JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_scan() {
        let cli = Cli::try_parse_from(["dupindex", "scan", "/data", "/backup"]).unwrap();
        match cli.command {
            Commands::Scan(args) => {
                assert_eq!(args.paths.len(), 2);
                assert!(!args.follow_symlinks);
            }
            other => panic!("expected scan, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_scan_requires_path() {
        assert!(Cli::try_parse_from(["dupindex", "scan"]).is_err());
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from([
            "dupindex",
            "-vv",
            "--db-path",
            "/tmp/i.db",
            "--threads",
            "8",
            "audit",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/i.db")));
        assert_eq!(cli.threads, Some(8));
        assert!(matches!(cli.command, Commands::Audit));
    }

    #[test]
    fn test_cli_report_defaults() {
        let cli = Cli::try_parse_from(["dupindex", "report"]).unwrap();
        match cli.command {
            Commands::Report(args) => {
                assert_eq!(args.min_count, 1);
                assert!(!args.json);
            }
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_retry_tuning() {
        let cli = Cli::try_parse_from([
            "dupindex",
            "--retry-attempts",
            "3",
            "--retry-delay-ms",
            "0",
            "remove",
            r"\.tmp$",
        ])
        .unwrap();
        assert_eq!(cli.retry_attempts, Some(3));
        assert_eq!(cli.retry_delay_ms, Some(0));
    }
}
