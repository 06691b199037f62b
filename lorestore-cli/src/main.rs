// Copyright 2025 Lorestore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Lorestore CLI
//!
//! Command-line interface over a knowledge memory store. Every command prints
//! JSON to stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lorestore_core::{properties_from_json, EntityKind, Properties, RelationType};
use lorestore_index::{Budget, Direction, PathOptions};
use lorestore_memory::{
    BaseRecommendation, ExportFilter, ExportFormat, Granularity, ImportMode, ImportOptions,
    KnowledgeMemory, MemoryConfig, PatternFilter, RecallOptions, RememberMetadata,
    SimilarityQuery, SortBy,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lorestore")]
#[command(about = "Lorestore - persistent knowledge-graph memory", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage root, overriding the configuration
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update an entity
    Remember {
        /// Entity kind (project, user, configuration, technology, ...)
        kind: String,

        /// Properties as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,

        /// Entity id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Tags, comma separated
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Create or re-assert a relationship
    Relate {
        source: String,
        target: String,

        /// Relation type (uses-technology, deployed-with, ...)
        relation: String,

        #[arg(long, default_value = "1.0")]
        weight: f64,

        /// Properties as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Search entities by text
    Recall {
        #[arg(default_value = "")]
        query: String,

        #[arg(long)]
        kind: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// relevance, recent, created or id
        #[arg(long, default_value = "relevance")]
        sort: String,
    },

    /// Projects similar to a project
    Similar {
        id: String,

        #[arg(long)]
        min_similarity: Option<f64>,

        #[arg(long)]
        max_results: Option<usize>,
    },

    /// Relationships touching an entity
    Relationships { id: String },

    /// Path between two entities
    Path {
        from: String,
        to: String,

        /// Prefer strong edges instead of fewest hops
        #[arg(long)]
        weighted: bool,

        /// Follow edge direction
        #[arg(long)]
        directed: bool,

        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// Graph and storage statistics
    Stats,

    /// Centrality of one entity
    Centrality {
        id: String,

        /// Time limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long)]
        max_nodes: Option<usize>,
    },

    /// Community detection
    Clusters,

    /// Entities whose features deviate from their kind
    Anomalies {
        #[arg(long)]
        kind: Option<String>,

        #[arg(long, default_value = "2.0")]
        threshold: f64,
    },

    /// Record an observation
    Learn {
        /// Outcome, e.g. the tool that was used
        outcome: String,

        /// Context pairs, key=value
        #[arg(long = "context", value_name = "KEY=VALUE", required = true)]
        context: Vec<String>,

        /// Record a failure instead of a success
        #[arg(long)]
        failed: bool,
    },

    /// Improve a recommendation with learned patterns
    Recommend {
        recommendation: String,

        #[arg(long, default_value = "0.5")]
        confidence: f64,

        #[arg(long = "feature", value_name = "KEY=VALUE")]
        features: Vec<String>,
    },

    /// List learned patterns
    Patterns {
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        #[arg(long)]
        outcome: Option<String>,

        #[arg(long, default_value = "0")]
        min_support: u64,

        #[arg(long, default_value = "0.0")]
        min_confidence: f64,

        /// Recompute patterns from the log first
        #[arg(long)]
        relearn: bool,
    },

    /// Export the graph
    Export {
        /// json, graphml or csv
        #[arg(long, default_value = "json")]
        format: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, value_delimiter = ',')]
        kinds: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Import a JSON snapshot
    Import {
        input: PathBuf,

        /// merge or replace
        #[arg(long, default_value = "merge")]
        mode: String,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove entities not updated for the given number of days
    Cleanup {
        #[arg(long)]
        older_than_days: i64,
    },

    /// Drop superseded log records
    Compact,

    /// Backup management
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Activity and health reports
    Report {
        /// day, week or month
        #[arg(long, default_value = "day")]
        granularity: String,

        #[arg(long)]
        kind: Option<String>,

        #[arg(long, default_value = "10")]
        top_tags: usize,
    },
}

#[derive(Subcommand, Clone)]
enum BackupCommands {
    /// Create a new backup
    Create,

    /// List all available backups
    List,

    /// Check a backup's checksum
    Verify { backup_id: String },

    /// Restore from a backup (full replace)
    Restore { backup_id: String },

    /// Keep only the newest backups
    Prune {
        #[arg(long, default_value = "10")]
        keep: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose {
        "lorestore=debug"
    } else {
        "lorestore=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        MemoryConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    let memory = KnowledgeMemory::open(config).context("Failed to open knowledge memory")?;
    run(&memory, cli.command)?;
    memory.close().context("Failed to close knowledge memory")?;
    Ok(())
}

fn run(memory: &KnowledgeMemory, command: Commands) -> Result<()> {
    match command {
        Commands::Remember { kind, data, id, tags } => {
            let kind: EntityKind = kind.parse()?;
            let metadata = RememberMetadata { id, tags };
            let id = memory.remember(kind, parse_properties(&data)?, metadata)?;
            print_json(&serde_json::json!({ "id": id }))?;
        }

        Commands::Relate {
            source,
            target,
            relation,
            weight,
            data,
        } => {
            let relation: RelationType = relation.parse()?;
            let key = memory.relate(&source, &target, relation, weight, parse_properties(&data)?)?;
            print_json(&key)?;
        }

        Commands::Recall {
            query,
            kind,
            limit,
            sort,
        } => {
            let options = RecallOptions {
                kind: kind.as_deref().map(str::parse).transpose()?,
                limit,
                sort_by: sort.parse::<SortBy>()?,
            };
            print_json(&memory.recall(&query, &options))?;
        }

        Commands::Similar {
            id,
            min_similarity,
            max_results,
        } => {
            let query = SimilarityQuery {
                min_similarity,
                max_results,
            };
            print_json(&memory.find_similar(&id, &query))?;
        }

        Commands::Relationships { id } => print_json(&memory.find_relationships(&id))?,

        Commands::Path {
            from,
            to,
            weighted,
            directed,
            max_depth,
        } => {
            let path = if weighted {
                memory.find_weighted_path(&from, &to)
            } else {
                let options = PathOptions {
                    direction: if directed {
                        Direction::Outgoing
                    } else {
                        Direction::Both
                    },
                    max_depth,
                    ..PathOptions::default()
                };
                memory.find_path_with(&from, &to, &options)
            };
            print_json(&path)?;
        }

        Commands::Stats => {
            print_json(&serde_json::json!({
                "graph": memory.statistics(),
                "storage": memory.storage_stats(),
                "recovery": memory.recovery(),
            }))?;
        }

        Commands::Centrality {
            id,
            timeout_ms,
            max_nodes,
        } => {
            let mut budget = match timeout_ms {
                Some(ms) => Budget::with_timeout(std::time::Duration::from_millis(ms)),
                None => memory.default_budget(),
            };
            if let Some(max_nodes) = max_nodes {
                budget = budget.max_nodes(max_nodes);
            }
            let report = memory
                .centrality(&id, &budget)
                .with_context(|| format!("Entity not found: {}", id))?;
            print_json(&report)?;
        }

        Commands::Clusters => print_json(&memory.communities())?,

        Commands::Anomalies { kind, threshold } => {
            let mut options = memory.config().analytics.anomaly.clone();
            if let Some(kind) = kind {
                options.kind = Some(kind.parse()?);
            }
            options.std_dev_threshold = threshold;
            print_json(&memory.detect_anomalies(&options))?;
        }

        Commands::Learn {
            outcome,
            context,
            failed,
        } => {
            let context = parse_pairs(&context)?;
            let view = memory.learn(context, &outcome, !failed)?;
            print_json(&view)?;
        }

        Commands::Recommend {
            recommendation,
            confidence,
            features,
        } => {
            let features = parse_pairs(&features)?;
            let base = BaseRecommendation::new(recommendation, confidence);
            print_json(&memory.improve_recommendation(features, &base))?;
        }

        Commands::Patterns {
            context,
            outcome,
            min_support,
            min_confidence,
            relearn,
        } => {
            if relearn {
                let count = memory.relearn();
                info!(patterns = count, "Recomputed patterns");
            }
            let filter = PatternFilter {
                context: parse_pairs(&context)?.into_iter().collect(),
                outcome,
                min_support,
                min_confidence,
            };
            print_json(&memory.patterns(&filter))?;
        }

        Commands::Export {
            format,
            output,
            kinds,
            tags,
        } => {
            let format: ExportFormat = format.parse()?;
            let filter = ExportFilter {
                kinds: kinds
                    .iter()
                    .map(|k| k.parse())
                    .collect::<lorestore_core::Result<_>>()?,
                tags: tags.into_iter().collect(),
                updated_since: None,
            };
            let blob = memory.export_graph(format, &filter)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &blob)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    print_json(&serde_json::json!({
                        "path": path.display().to_string(),
                        "format": format.to_string(),
                        "size_bytes": blob.len(),
                    }))?;
                }
                None => println!("{}", String::from_utf8_lossy(&blob)),
            }
        }

        Commands::Import {
            input,
            mode,
            dry_run,
        } => {
            let blob = std::fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let options = ImportOptions {
                mode: mode.parse::<ImportMode>()?,
                dry_run,
            };
            print_json(&memory.import_graph(&blob, options)?)?;
        }

        Commands::Cleanup { older_than_days } => {
            anyhow::ensure!(older_than_days >= 0, "--older-than-days must not be negative");
            let removed = memory.cleanup(chrono::Duration::days(older_than_days))?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }

        Commands::Compact => {
            let removed = memory.compact()?;
            print_json(&serde_json::json!({ "removed_records": removed }))?;
        }

        Commands::Backup { command } => handle_backup_command(memory, command)?,

        Commands::Report {
            granularity,
            kind,
            top_tags,
        } => {
            let granularity: Granularity = granularity.parse()?;
            let kind: Option<EntityKind> = kind.as_deref().map(str::parse).transpose()?;
            print_json(&serde_json::json!({
                "timeline": memory.activity_timeline(granularity, kind),
                "kinds": memory.kind_distribution(),
                "relations": memory.relation_distribution(),
                "tags": memory.tag_distribution(top_tags),
                "health": memory.health_score(),
            }))?;
        }
    }
    Ok(())
}

fn handle_backup_command(memory: &KnowledgeMemory, command: BackupCommands) -> Result<()> {
    match command {
        BackupCommands::Create => print_json(&memory.backup()?)?,
        BackupCommands::List => print_json(&memory.list_backups()?)?,
        BackupCommands::Verify { backup_id } => {
            let valid = memory.verify_backup(&backup_id)?;
            print_json(&serde_json::json!({ "backup_id": backup_id, "valid": valid }))?;
            anyhow::ensure!(valid, "Backup '{}' failed verification", backup_id);
        }
        BackupCommands::Restore { backup_id } => {
            let manifest = memory
                .restore_backup(&backup_id)
                .with_context(|| format!("Failed to restore backup '{}'", backup_id))?;
            print_json(&manifest)?;
        }
        BackupCommands::Prune { keep } => {
            let removed = memory.prune_backups(keep)?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_properties(data: &str) -> Result<Properties> {
    let value: serde_json::Value =
        serde_json::from_str(data).context("Properties must be a JSON object")?;
    Ok(properties_from_json(value)?)
}

/// Parse `key=value` arguments
fn parse_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
