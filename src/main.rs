use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod analysis;
mod data;
mod error;
mod models;
mod report;

use analysis::{TestOptions, DEFAULT_CONTROL, DEFAULT_TREATMENT};
use data::SampleSpec;
use models::{Horizon, KpiSummary};

const DATA_ENV: &str = "RETENTION_AB_DATA";
const DEFAULT_DATA_PATH: &str = "cookie_cats.csv";

#[derive(Parser)]
#[command(name = "retention-ab")]
#[command(about = "Retention A/B experiment analysis for mobile game cohorts", long_about = None)]
struct Cli {
    /// Dataset CSV; falls back to $RETENTION_AB_DATA, then cookie_cats.csv
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ExperimentArgs {
    #[arg(long, default_value = DEFAULT_CONTROL)]
    control: String,
    #[arg(long, default_value = DEFAULT_TREATMENT)]
    treatment: String,
    /// Reject tables whose smallest expected cell count is below this value
    #[arg(long)]
    min_expected: Option<f64>,
    /// Apply Yates' continuity correction
    #[arg(long)]
    yates: bool,
}

impl ExperimentArgs {
    fn options(&self) -> TestOptions {
        TestOptions {
            min_expected_count: self.min_expected,
            continuity_correction: self.yates,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print retention KPIs
    Kpis {
        #[arg(long)]
        json: bool,
    },
    /// Compare retention between the control and treatment arms
    AbTest {
        #[command(flatten)]
        experiment: ExperimentArgs,
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        experiment: ExperimentArgs,
        #[arg(long, default_value_t = 0.05)]
        alpha: f64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Write a synthetic experiment dataset
    Generate {
        #[arg(long, default_value_t = 90_189)]
        users: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        out: PathBuf,
    },
}

fn data_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(DATA_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH))
}

fn print_kpis(kpis: &KpiSummary) {
    println!("Total users: {}", kpis.total_users);
    println!("Daily active users: {}", kpis.daily_active_users);
    println!("Day 1 retention: {:.1}%", kpis.overall_d1_retention * 100.0);
    println!("Day 7 retention: {:.1}%", kpis.overall_d7_retention * 100.0);
    for (arm, summary) in &kpis.by_arm {
        println!(
            "- {} ({} users) day 1 {:.2}%, day 7 {:.2}%",
            arm,
            summary.users,
            summary.d1_retention * 100.0,
            summary.d7_retention * 100.0
        );
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("retention_ab=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = data_path(cli.data);
    let spec = SampleSpec::default();

    match cli.command {
        Commands::Kpis { json } => {
            let dataset = data::load_or_generate(&path, &spec)?;
            let kpis = analysis::compute_kpis(&dataset.records)
                .with_context(|| format!("cannot compute KPIs for {}", dataset.source))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&kpis)?);
            } else {
                print_kpis(&kpis);
            }
        }
        Commands::AbTest { experiment, json } => {
            let dataset = data::load_or_generate(&path, &spec)?;
            let result = analysis::compute_ab_test(
                &dataset.records,
                &experiment.control,
                &experiment.treatment,
                &experiment.options(),
            )
            .with_context(|| format!("cannot analyze {}", dataset.source))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }

            println!(
                "{} ({} users) vs {} ({} users):",
                result.control, result.n_control, result.treatment, result.n_treatment
            );
            for horizon in Horizon::ALL {
                let outcome = result.horizon(horizon);
                let p_value = match outcome.p_value() {
                    Ok(p) => format!("{p:.4}"),
                    Err(err) => err.to_string(),
                };
                println!(
                    "- {}: {:.2}% vs {:.2}%, diff {:+.2} pp ({:+.1}% lift), 95% CI [{:.2}, {:.2}] pp, p {}",
                    horizon,
                    outcome.rate_a * 100.0,
                    outcome.rate_b * 100.0,
                    outcome.diff * 100.0,
                    outcome.lift_percent,
                    outcome.ci_lower * 100.0,
                    outcome.ci_upper * 100.0,
                    p_value
                );
            }
        }
        Commands::Report {
            experiment,
            alpha,
            out,
        } => {
            let dataset = data::load_or_generate(&path, &spec)?;
            let kpis = analysis::compute_kpis(&dataset.records)
                .with_context(|| format!("cannot compute KPIs for {}", dataset.source))?;
            let result = analysis::compute_ab_test(
                &dataset.records,
                &experiment.control,
                &experiment.treatment,
                &experiment.options(),
            )
            .with_context(|| format!("cannot analyze {}", dataset.source))?;

            let report =
                report::build_report(&dataset.source, chrono::Utc::now(), &kpis, &result, alpha);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Generate { users, seed, out } => {
            let spec = SampleSpec {
                n_users: users,
                seed,
                ..spec
            };
            let records = data::generate_sample(&spec);
            data::write_csv(&out, &records)?;
            info!(users, seed, out = %out.display(), "wrote synthetic dataset");
            println!("Wrote {} users to {}.", records.len(), out.display());
        }
    }

    Ok(())
}
