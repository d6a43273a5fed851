//! dupindex - Persistent File Fingerprint Index
//!
//! A cross-platform tool that maintains a database mapping file paths to
//! content fingerprints (MD5, size, mtime), scans directory trees with a
//! bounded worker pool, skips unchanged files on rescan, audits the index
//! against the live filesystem, and reports duplicate content.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod logging;
pub mod report;
pub mod scan;

use std::path::PathBuf;

use anyhow::Context;

use crate::audit::audit;
use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::error::ExitCode;
use crate::index::IndexStore;
use crate::report::DuplicateReport;
use crate::scan::{check_file, scan_path, ScanOptions, ScanSummary};

/// Dispatch a parsed CLI invocation.
///
/// Resolves configuration (CLI flags over config file over defaults),
/// opens the index store, and runs the requested operation.
pub fn run_app(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load();

    let db_path = resolve_db_path(&cli, &config)?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }

    let retry = config.retry_policy(cli.retry_attempts, cli.retry_delay_ms);
    let store = IndexStore::open(&db_path, retry)
        .with_context(|| format!("cannot open index database {}", db_path.display()))?;
    let threads = cli.threads.or(config.threads).unwrap_or(4);

    log::debug!(
        "index: {} ({} threads, {} retry attempts)",
        db_path.display(),
        threads,
        retry.max_attempts
    );

    match cli.command {
        Commands::Scan(args) => {
            let options = ScanOptions {
                workers: threads,
                follow_symlinks: args.follow_symlinks,
            };
            let mut total = ScanSummary::default();
            for root in &args.paths {
                let summary = scan_path(root, &store, &options)
                    .with_context(|| format!("scan of {} failed", root.display()))?;
                total.indexed += summary.indexed;
                total.skipped += summary.skipped;
                total.errors += summary.errors;
            }
            println!(
                "Indexed {} files, skipped {} unchanged, {} errors.",
                total.indexed, total.skipped, total.errors
            );
            Ok(if total.errors > 0 {
                ExitCode::PartialSuccess
            } else {
                ExitCode::Success
            })
        }

        Commands::Check { path } => {
            let twins = check_file(&path, &store)
                .with_context(|| format!("check of {} failed", path.display()))?;
            if twins.is_empty() {
                println!("No indexed files share content with {}.", path.display());
                return Ok(ExitCode::NoDuplicates);
            }
            println!("Indexed files with identical content:");
            for twin in twins {
                println!("  {twin}");
            }
            Ok(ExitCode::Success)
        }

        Commands::Report(args) => {
            let report = DuplicateReport::build(&store, args.min_count)
                .context("duplicate report failed")?;
            if args.json {
                println!("{}", report.render_json()?);
            } else {
                print!("{}", report.render_text());
            }
            Ok(if report.is_empty() {
                ExitCode::NoDuplicates
            } else {
                ExitCode::Success
            })
        }

        Commands::Audit => {
            let summary = audit(&store, threads).context("index audit failed")?;
            println!(
                "Examined {} entries: {} removed, {} reprocessed, {} errors.",
                summary.examined, summary.removed, summary.reprocessed, summary.errors
            );
            Ok(if summary.errors > 0 {
                ExitCode::PartialSuccess
            } else {
                ExitCode::Success
            })
        }

        Commands::Waste => {
            let total = store.duplicate_waste(1).context("waste query failed")?;
            println!("{}", report::render_waste(total));
            Ok(if total == 0 {
                ExitCode::NoDuplicates
            } else {
                ExitCode::Success
            })
        }

        Commands::Count { prefix } => {
            let n = store.prefix_count(&prefix).context("prefix count failed")?;
            println!("{n} indexed paths start with '{prefix}'.");
            Ok(ExitCode::Success)
        }

        Commands::Remove { pattern } => {
            let removed = store
                .delete_matching(&pattern)
                .with_context(|| format!("remove with pattern '{pattern}' failed"))?;
            println!("Removed {removed} entries matching '{pattern}'.");
            Ok(ExitCode::Success)
        }
    }
}

/// Database location: CLI flag, then config file, then platform default.
fn resolve_db_path(cli: &Cli, config: &Config) -> anyhow::Result<PathBuf> {
    if let Some(path) = &cli.db_path {
        return Ok(path.clone());
    }
    if let Some(path) = &config.db_path {
        return Ok(path.clone());
    }
    config::default_db_path()
}
