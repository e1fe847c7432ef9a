use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

mod db;
mod drivers;
mod error;
mod models;
mod movement;
mod panel;
mod priority;
mod quadrant;
mod report;
mod score;
mod signature;
mod transitions;

use drivers::{BinSpec, DriverQuery};
use models::{Granularity, Period};
use movement::{MovementMode, TrackParams};
use panel::PanelFilters;
use quadrant::{classify, PeriodReference, ReferencePolicy};
use score::{RidgeGrowthProvider, ScoreConfig, ScoreProvider};

#[derive(Parser)]
#[command(name = "escalation-watch")]
#[command(about = "Quadrant movement and escalation tracker for operational entities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load deterministic demo data
    Seed,
    /// Import events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Fit the whole window once and print the quadrant table
    Fit {
        #[arg(long, default_value = "quarterly")]
        granularity: String,
        #[arg(long, default_value_t = 4)]
        min_observations: usize,
        #[arg(long, default_value_t = 0.0)]
        min_total_count: f64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Track per-period movement and extract classified transitions
    Track {
        #[arg(long, default_value = "quarterly")]
        granularity: String,
        #[arg(long, default_value_t = 10.0)]
        min_total_count: f64,
        /// Score each period on all events up to its end instead of only its
        /// own window
        #[arg(long)]
        cumulative: bool,
        /// Keep only transitions that climb the risk order
        #[arg(long)]
        focus_risk_increasing: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Attribute one transition to subcategories and numeric bins
    Drivers {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Categorical columns (repeatable); omit to auto-detect
        #[arg(long)]
        subcategory: Vec<String>,
        /// Numeric columns as col=N (quantile bins) or col=e1,e2,... (edges)
        #[arg(long)]
        numeric: Vec<String>,
        #[arg(long, default_value_t = 5)]
        top_n: usize,
        #[arg(long, default_value_t = 1.0)]
        min_delta: f64,
        #[arg(long, default_value_t = 10.0)]
        min_total_count: f64,
        #[arg(long)]
        cumulative: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "quarterly")]
        granularity: String,
        #[arg(long, default_value_t = 10.0)]
        min_total_count: f64,
        #[arg(long)]
        cumulative: bool,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn score_config_from_env() -> anyhow::Result<ScoreConfig> {
    let mut config = ScoreConfig::default();
    if let Ok(raw) = std::env::var("ESCALATION_WATCH_SEED") {
        let seed = raw
            .parse::<u64>()
            .context("ESCALATION_WATCH_SEED must be an unsigned integer")?;
        config.seed = Some(seed);
    }
    Ok(config)
}

fn track_params(
    granularity: Granularity,
    min_total_count: f64,
    cumulative: bool,
) -> anyhow::Result<TrackParams> {
    let mut params = TrackParams::new(granularity);
    params.min_total_count = min_total_count;
    params.mode = if cumulative {
        MovementMode::Cumulative
    } else {
        MovementMode::Windowed
    };
    params.score = score_config_from_env()?;
    Ok(params)
}

/// Parse a `--numeric col=spec` argument: an integer is a quantile bin
/// count, a comma list is explicit edges.
fn parse_numeric_spec(raw: &str) -> anyhow::Result<(String, BinSpec)> {
    let (column, spec) = raw
        .split_once('=')
        .with_context(|| format!("expected col=spec, got '{raw}'"))?;
    if let Ok(bins) = spec.parse::<usize>() {
        return Ok((column.to_string(), BinSpec::Quantiles(bins)));
    }
    let edges = spec
        .split(',')
        .map(|e| e.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .with_context(|| format!("unparseable bin edges in '{raw}'"))?;
    Ok((column.to_string(), BinSpec::Edges(edges)))
}

fn parse_period(label: &str, granularity: Granularity) -> anyhow::Result<Period> {
    let period = Period::parse(label)?;
    if period.granularity != granularity {
        anyhow::bail!(
            "period '{label}' does not match the {granularity:?} tracking granularity"
        );
    }
    Ok(period)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} events from {}.", csv.display());
        }
        Commands::Fit {
            granularity,
            min_observations,
            min_total_count,
            out,
        } => {
            let granularity = granularity.parse::<Granularity>()?;
            let events = db::fetch_events(&pool, None, None).await?;
            let filters = PanelFilters {
                min_observations,
                min_total_count,
                ..Default::default()
            };
            let panel = panel::build_panel(&events, granularity, &filters)?;
            if panel.is_empty() {
                println!("No panel rows after filtering.");
                return Ok(());
            }

            let config = score_config_from_env()?;
            let outcome = RidgeGrowthProvider.fit(&panel, &config);
            for warning in &outcome.status.warnings {
                eprintln!("warning: {warning}");
            }
            if !outcome.status.converged {
                println!("Score fit did not converge; no quadrant table produced.");
                return Ok(());
            }

            // One row per entity: shared effects, total count.
            let mut by_entity: BTreeMap<String, models::ScoredPoint> = BTreeMap::new();
            for point in outcome.points {
                by_entity
                    .entry(point.entity.clone())
                    .and_modify(|p| p.count += point.count)
                    .or_insert(point);
            }
            let points: Vec<models::ScoredPoint> = by_entity.into_values().collect();
            let reference = PeriodReference::compute(ReferencePolicy::Zero, &points);
            let quadrants: Vec<models::Quadrant> = points
                .iter()
                .map(|p| classify(p.x_score, p.y_score, reference.x_ref, reference.y_ref))
                .collect();

            let table = report::quadrant_table(&points, &quadrants);
            println!("Quadrant table ({} entities):", table.len());
            for row in &table {
                println!(
                    "- {} [{} {}] x {:.3} y {:.3} count {}",
                    row.entity,
                    row.quadrant,
                    row.quadrant.description(),
                    row.x_score,
                    row.y_score,
                    row.count
                );
            }
            if let Some(out) = out {
                report::write_quadrant_csv(&out, &table)?;
                println!("Quadrant table written to {}.", out.display());
            }
        }
        Commands::Track {
            granularity,
            min_total_count,
            cumulative,
            focus_risk_increasing,
            out_dir,
        } => {
            let params =
                track_params(granularity.parse::<Granularity>()?, min_total_count, cumulative)?;
            let events = db::fetch_events(&pool, None, None).await?;

            let run_signature = signature::input_signature(
                &events,
                &serde_json::json!({
                    "granularity": params.granularity,
                    "min_total_count": params.min_total_count,
                    "mode": params.mode,
                }),
            );

            let (records, meta) = movement::track(&events, &params, &RidgeGrowthProvider)?;
            let transitions = transitions::extract(
                &records,
                focus_risk_increasing,
                &priority::PriorityRules::default(),
            );

            println!(
                "Tracked {} entities over {} periods ({} skipped); {} transitions.",
                meta.entity_count,
                meta.periods_tracked.len(),
                meta.skipped_periods.len(),
                transitions.len()
            );
            println!("Input signature: {run_signature}");
            for skipped in &meta.skipped_periods {
                println!("- skipped {}: {}", skipped.period, skipped.messages.join("; "));
            }
            for t in transitions.iter().take(10) {
                println!(
                    "- [{}] {} {} -> {} in {} ({})",
                    t.priority.tier.name(),
                    t.entity,
                    t.quadrant_from,
                    t.quadrant_to,
                    t.period_to,
                    t.priority.reason
                );
            }

            if let Some(dir) = out_dir {
                std::fs::create_dir_all(&dir)?;
                report::write_movement_csv(&dir.join("movement.csv"), &records)?;
                report::write_transitions_csv(&dir.join("transitions.csv"), &transitions)?;
                println!("Movement tables written to {}.", dir.display());
            }
        }
        Commands::Drivers {
            entity,
            from,
            to,
            subcategory,
            numeric,
            top_n,
            min_delta,
            min_total_count,
            cumulative,
        } => {
            // Tracking granularity follows the period labels themselves.
            let period_from = Period::parse(&from)?;
            let params = track_params(period_from.granularity, min_total_count, cumulative)?;
            let period_to = parse_period(&to, params.granularity)?;

            let events = db::fetch_events(&pool, None, None).await?;
            let (records, _) = movement::track(&events, &params, &RidgeGrowthProvider)?;

            let mut query = DriverQuery::new(&entity, period_from, period_to);
            query.top_n = top_n;
            query.min_delta = min_delta;
            if !subcategory.is_empty() {
                query.subcategory_cols = Some(subcategory);
            }
            for raw in &numeric {
                let (column, spec) = parse_numeric_spec(raw)?;
                query.numeric_cols.insert(column, spec);
            }

            let analysis = drivers::analyze(&records, &events, &query)?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Report {
            granularity,
            min_total_count,
            cumulative,
            out,
        } => {
            let params =
                track_params(granularity.parse::<Granularity>()?, min_total_count, cumulative)?;
            let events = db::fetch_events(&pool, None, None).await?;
            let (records, meta) = movement::track(&events, &params, &RidgeGrowthProvider)?;
            let transitions =
                transitions::extract(&records, false, &priority::PriorityRules::default());

            let report = report::build_report("entities", &records, &transitions, &meta.skipped_periods);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
