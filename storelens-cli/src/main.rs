use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use storelens_core::{
    admin, dataset, Database, EngineConfig, FindOptions, ReportName, ReportParams, ReportRunner,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "storelens")]
#[command(about = "StoreLens - run e-commerce aggregation reports over a JSON dataset")]
#[command(version)]
struct Cli {
    /// Engine configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available reports
    Reports,
    /// Run one named report
    Report {
        /// Report name, e.g. revenue-by-category
        name: String,
        /// Dataset file: {"collection": [documents...], ...}
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        /// Price threshold (freight-ratio)
        #[arg(long)]
        threshold: Option<f64>,
        /// Bucket count (order-price-buckets)
        #[arg(long)]
        buckets: Option<usize>,
        /// Minimum distinct categories (multi-category-customers)
        #[arg(long)]
        min_categories: Option<usize>,
        /// Single order (order-value-and-item-count)
        #[arg(long)]
        order_id: Option<String>,
        /// Skip creating the standard indexes before running
        #[arg(long)]
        no_indexes: bool,
    },
    /// Show the query plan for a filter
    Explain {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        collection: String,
        /// Filter as JSON
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Index name to force
        #[arg(long)]
        hint: Option<String>,
    },
    /// Database or collection statistics
    Stats {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        collection: Option<String>,
    },
    /// Index usage of a collection after provisioning
    IndexStats {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        collection: String,
        /// Only list indexes that were never used
        #[arg(long)]
        unused: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("storelens=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Reports => list_reports(),
        Commands::Report {
            name,
            data,
            limit,
            threshold,
            buckets,
            min_categories,
            order_id,
            no_indexes,
        } => {
            let params = ReportParams {
                limit,
                threshold,
                buckets,
                min_categories,
                order_id,
            };
            run_report(config, &name, &data, &params, !no_indexes)
        }
        Commands::Explain {
            data,
            collection,
            filter,
            hint,
        } => explain(config, &data, &collection, &filter, hint.as_deref()),
        Commands::Stats { data, collection } => stats(config, &data, collection.as_deref()),
        Commands::IndexStats {
            data,
            collection,
            unused,
        } => index_stats(config, &data, &collection, unused),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Build an in-memory database from a dataset file
fn open_dataset(config: EngineConfig, data: &Path, with_indexes: bool) -> Result<Database> {
    let db = Database::new(config).context("Invalid engine configuration")?;
    if with_indexes {
        admin::provision_standard_indexes(&db).context("Failed to create standard indexes")?;
    }
    let summary = dataset::load_file(&db, data)
        .with_context(|| format!("Failed to load dataset: {}", data.display()))?;
    for (collection, count) in &summary.collections {
        tracing::debug!(collection = %collection, count, "collection loaded");
    }
    Ok(db)
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

fn list_reports() -> Result<()> {
    for report in ReportName::ALL {
        println!("{:<28} {}", report.as_str(), report.description());
    }
    Ok(())
}

fn run_report(
    config: EngineConfig,
    name: &str,
    data: &Path,
    params: &ReportParams,
    with_indexes: bool,
) -> Result<()> {
    let report = ReportName::from_str(name).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown report '{}' (run `storelens reports` for the list)",
            name
        )
    })?;
    let db = open_dataset(config, data, with_indexes)?;
    let output = ReportRunner::new(&db)
        .run(report, params)
        .with_context(|| format!("Report '{}' failed", report))?;

    print_json(&json!({
        "report": report.as_str(),
        "rows": output.rows,
        "stats": {
            "rows_scanned": output.stats.rows_scanned,
            "rows_returned": output.stats.rows_returned,
            "index_used": output.stats.index_used,
            "duration_ms": output.stats.duration.as_secs_f64() * 1000.0,
            "undefined_ratios": output.stats.undefined_ratios,
            "merge": output.stats.merge,
        }
    }))
}

fn explain(
    config: EngineConfig,
    data: &Path,
    collection: &str,
    filter: &str,
    hint: Option<&str>,
) -> Result<()> {
    let filter: Value =
        serde_json::from_str(filter).with_context(|| format!("Invalid filter JSON: {}", filter))?;
    let db = open_dataset(config, data, true)?;
    let mut options = FindOptions::new();
    if let Some(hint) = hint {
        options = options.with_hint(hint);
    }
    let plan = db
        .explain(collection, &filter, options)
        .with_context(|| format!("Failed to explain query on {}", collection))?;
    print_json(&plan)
}

fn stats(config: EngineConfig, data: &Path, collection: Option<&str>) -> Result<()> {
    let db = open_dataset(config, data, true)?;
    let value = match collection {
        Some(name) => serde_json::to_value(
            db.collection_stats(name)
                .with_context(|| format!("Failed to read stats of {}", name))?,
        )?,
        None => serde_json::to_value(db.database_stats())?,
    };
    print_json(&value)
}

fn index_stats(config: EngineConfig, data: &Path, collection: &str, unused: bool) -> Result<()> {
    let db = open_dataset(config, data, true)?;
    let usage = if unused {
        admin::unused_indexes(&db, collection)
    } else {
        db.index_stats(collection)
    }
    .with_context(|| format!("Failed to read index stats of {}", collection))?;
    print_json(&Value::Array(usage.iter().map(|u| u.to_json()).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_dataset(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"{
                "products": [{"product_id": "p1", "product_category_name": "books"}],
                "order_items": [
                    {"order_id": "o1", "order_item_id": 1, "product_id": "p1", "seller_id": "s1", "price": 10.0, "freight_value": 1.0}
                ]
            }"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_cli_parses_report_arguments() {
        let cli = Cli::try_parse_from([
            "storelens", "report", "top-sellers", "--data", "d.json", "--limit", "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Report { name, limit, no_indexes, .. } => {
                assert_eq!(name, "top-sellers");
                assert_eq!(limit, Some(3));
                assert!(!no_indexes);
            }
            _ => panic!("expected report command"),
        }
    }

    #[test]
    fn test_open_dataset_provisions_indexes() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir);
        let db = open_dataset(EngineConfig::default(), &path, true).unwrap();
        let names: Vec<String> = db
            .list_indexes("order_items")
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"order_id_1_order_item_id_1".to_string()));
    }

    #[test]
    fn test_unknown_report_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir);
        let err = run_report(
            EngineConfig::default(),
            "no-such-report",
            &path,
            &ReportParams::default(),
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown report"));
    }

    #[test]
    fn test_missing_config_file_has_context() {
        let err = load_config(Some(Path::new("/nonexistent/storelens.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }
}
