//! `reconmatch` subcommands: config-driven fuzzy reconciliation.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Subcommand;
use log::debug;
use serde::Serialize;

use reconmatch::audit::{AuditSink, JsonlAuditSink, MemoryAuditLog};
use reconmatch::loader::load_csv_items;
use reconmatch::store::{MemoryItemStore, MemoryMatchLedger};
use reconmatch::{
    build_comparators, BulkReport, BulkRequest, CancelFlag, MatchCandidate, ReconConfig, ReconStats, Reconciler,
};

use crate::exit_codes::{EXIT_ERROR, EXIT_RECON_INPUT, EXIT_RECON_PARTIAL};
use crate::CliError;

#[derive(Subcommand)]
pub enum ReconCommands {
    /// Bulk-reconcile the config's [pair] sources
    #[command(after_help = "\
Examples:
  reconmatch run bank-vs-invoices.recon.toml
  reconmatch run bank-vs-invoices.recon.toml --auto-accept --audit audit.jsonl
  reconmatch run bank-vs-invoices.recon.toml --json
  reconmatch run bank-vs-invoices.recon.toml --output result.json")]
    Run {
        /// Path to the .recon.toml config file
        config: PathBuf,

        /// Create matches for AUTO_LINK pairs (also `matching.auto_accept`)
        #[arg(long)]
        auto_accept: bool,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,

        /// Write JSON output to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Append audit events as JSON lines to this file
        #[arg(long)]
        audit: Option<PathBuf>,

        /// Actor recorded on created matches
        #[arg(long, default_value = "system")]
        actor: String,
    },

    /// Rank candidates for one item against a source
    #[command(after_help = "\
Examples:
  reconmatch candidates bank-vs-invoices.recon.toml --item bk_002 --pool invoices
  reconmatch candidates bank-vs-invoices.recon.toml --item inv_101 --pool bank --json")]
    Candidates {
        /// Path to the .recon.toml config file
        config: PathBuf,

        /// Item id to find candidates for
        #[arg(long)]
        item: String,

        /// Source id to search
        #[arg(long)]
        pool: String,

        /// Output JSON to stdout instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Validate a recon config without running
    #[command(after_help = "\
Examples:
  reconmatch validate bank-vs-invoices.recon.toml")]
    Validate {
        /// Path to the .recon.toml config file
        config: PathBuf,
    },
}

pub fn cmd_recon(cmd: ReconCommands) -> Result<(), CliError> {
    match cmd {
        ReconCommands::Run { config, auto_accept, json, output, audit, actor } => {
            cmd_run(config, auto_accept, json, output, audit, actor)
        }
        ReconCommands::Candidates { config, item, pool, json } => cmd_candidates(config, item, pool, json),
        ReconCommands::Validate { config } => cmd_validate(config),
    }
}

// ============================================================================
// Loading
// ============================================================================

fn read_config(config_path: &Path) -> Result<ReconConfig, CliError> {
    let config_str = std::fs::read_to_string(config_path)
        .map_err(|e| CliError::new(EXIT_RECON_INPUT, format!("cannot read config: {e}")))?;
    ReconConfig::from_toml(&config_str).map_err(CliError::recon)
}

/// Load every `[sources.*]` CSV, resolving paths against the config's directory.
fn load_store(config_path: &Path, config: &ReconConfig) -> Result<MemoryItemStore, CliError> {
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let store = MemoryItemStore::new();

    for (source_id, source) in &config.sources {
        let csv_path = base_dir.join(&source.file);
        let csv_data = std::fs::read_to_string(&csv_path).map_err(|e| {
            CliError::new(EXIT_RECON_INPUT, format!("cannot read {}: {e}", csv_path.display()))
        })?;
        let items = load_csv_items(source_id, &csv_data, source).map_err(CliError::recon)?;
        debug!("source '{source_id}': {} item(s) from {}", items.len(), csv_path.display());
        for item in items {
            store.insert(item).map_err(CliError::recon)?;
        }
    }

    Ok(store)
}

fn build_reconciler(
    config_path: &Path,
    config: ReconConfig,
    audit: Arc<dyn AuditSink>,
) -> Result<Reconciler, CliError> {
    let store = load_store(config_path, &config)?;
    let comparators = build_comparators(&config.comparators, &config.similarity);
    Reconciler::new(config, comparators, Arc::new(store), Arc::new(MemoryMatchLedger::new()), audit)
        .map_err(CliError::recon)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CliError::new(EXIT_ERROR, format!("JSON serialization error: {e}")))
}

// ============================================================================
// run
// ============================================================================

#[derive(Serialize)]
struct RunMeta {
    config_name: String,
    engine_version: &'static str,
    run_at: String,
    auto_accept: bool,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    meta: RunMeta,
    report: &'a BulkReport,
    stats: ReconStats,
}

fn cmd_run(
    config_path: PathBuf,
    auto_accept: bool,
    json_output: bool,
    output_file: Option<PathBuf>,
    audit_file: Option<PathBuf>,
    actor: String,
) -> Result<(), CliError> {
    let config = read_config(&config_path)?;

    let pair = config.pair.clone().ok_or_else(|| {
        CliError::args("config has no [pair] section")
            .with_hint("add [pair] with left = \"<source>\" and right = \"<source>\"")
    })?;
    let auto_accept = auto_accept || config.matching.auto_accept;
    let config_name = config.name.clone();

    let audit: Arc<dyn AuditSink> = match &audit_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
                CliError::new(EXIT_RECON_INPUT, format!("cannot open audit file {}: {e}", path.display()))
            })?;
            Arc::new(JsonlAuditSink::new(file))
        }
        None => Arc::new(MemoryAuditLog::new()),
    };

    let recon = build_reconciler(&config_path, config, audit)?;

    let request = BulkRequest::new(&pair.left, &pair.right)
        .auto_accept(auto_accept)
        .actor(&actor);
    let report = recon
        .bulk_reconcile(&request, &CancelFlag::new())
        .map_err(CliError::recon)?;
    let stats = recon.get_stats().map_err(CliError::recon)?;

    let output = RunOutput {
        meta: RunMeta {
            config_name,
            engine_version: env!("CARGO_PKG_VERSION"),
            run_at: chrono::Utc::now().to_rfc3339(),
            auto_accept,
        },
        report: &report,
        stats,
    };
    let json_str = to_json(&output)?;

    if let Some(ref path) = output_file {
        std::fs::write(path, &json_str)
            .map_err(|e| CliError::new(EXIT_RECON_INPUT, format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    if json_output {
        println!("{json_str}");
    } else {
        for s in &report.suggestions {
            println!("{:<16} -> {:<16} {:.4}  {}", s.item_id, s.candidate_id, s.confidence, s.tier);
        }
    }

    // Human summary to stderr
    let t = &report.tiers;
    eprintln!(
        "{} -> {}: {} item(s) in {} batch(es): {} auto_link, {} auto_suggest, {} manual_review, {} no_match",
        report.source_a,
        report.source_b,
        report.processed,
        report.batches,
        t.auto_link,
        t.auto_suggest,
        t.manual_review,
        t.no_match,
    );
    eprintln!(
        "linked {}, suggested {}, conflicts {}, errors {} ({} ms, {:.0} items/s)",
        report.linked,
        report.suggestions.len(),
        report.conflicts,
        report.errors,
        report.elapsed_ms,
        report.items_per_sec,
    );
    if output.stats.audit_failures > 0 {
        eprintln!("warning: {} audit event(s) could not be written", output.stats.audit_failures);
    }

    if report.errors > 0 {
        return Err(CliError::new(EXIT_RECON_PARTIAL, format!("{} item(s) failed", report.errors))
            .with_hint("rerun with --verbose to see per-item failures"));
    }
    Ok(())
}

// ============================================================================
// candidates
// ============================================================================

fn format_features(candidate: &MatchCandidate) -> String {
    candidate
        .features
        .iter()
        .map(|(name, score)| format!("{name}={score:.3}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn cmd_candidates(config_path: PathBuf, item: String, pool: String, json_output: bool) -> Result<(), CliError> {
    let config = read_config(&config_path)?;
    let recon = build_reconciler(&config_path, config, Arc::new(MemoryAuditLog::new()))?;
    let candidates = recon.find_candidates(&item, &pool).map_err(CliError::recon)?;

    if json_output {
        println!("{}", to_json(&candidates)?);
    } else {
        for c in &candidates {
            println!("{:<16} {:.4}  {:<13} {}", c.item.id, c.confidence, c.tier.to_string(), format_features(c));
        }
    }

    eprintln!("{} candidate(s) for '{item}' in '{pool}'", candidates.len());
    Ok(())
}

// ============================================================================
// validate
// ============================================================================

fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = read_config(&config_path)?;
    let comparators = build_comparators(&config.comparators, &config.similarity);
    config.resolve_weights(&comparators).map_err(CliError::recon)?;

    eprintln!(
        "valid: recon '{}' with {} source(s), {} comparator(s){}",
        config.name,
        config.sources.len(),
        comparators.len(),
        match &config.pair {
            Some(pair) => format!(", pair {} -> {}", pair.left, pair.right),
            None => String::new(),
        },
    );
    Ok(())
}
