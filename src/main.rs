mod aggregator;
mod api_client;
mod checkpoint;
mod config;
mod creatives;
mod data;
mod error;
mod reconcile;
mod runner;
mod sink;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::Config;
use error::Error;
use log::error;
use reconcile::ConversionPolicy;
use runner::FetchRequest;
use sink::OutputFormat;
use std::path::PathBuf;

const DEFAULT_REPORT_INPUT: &str = "./output/offsite_conversions.json";

#[derive(Parser)]
#[command(about = "Pulls ad insights day by day and reconciles custom conversion counts")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch insights window by window, reconcile them and write the series.
    Fetch {
        #[command(flatten)]
        config: Config,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: Option<NaiveDate>,

        #[arg(long, help = "Exclusive end, YYYY-MM-DD; defaults to today", value_parser = validate_date)]
        end: Option<NaiveDate>,

        #[arg(long, default_value_t = 1)]
        step_days: u32,

        #[arg(long, default_value_t = 30, help = "Days before the end to start from when there is no checkpoint")]
        days_back: u32,

        #[arg(long, value_enum, default_value_t = ConversionPolicy::Ratio)]
        policy: ConversionPolicy,

        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        #[arg(long, help = "Don't fetch ad_creatives.json for the ads seen in the run")]
        skip_creatives: bool,
    },

    /// Print per-ad totals and rates from a saved JSON series.
    Report {
        #[arg(long, default_value = DEFAULT_REPORT_INPUT)]
        input: PathBuf,

        #[arg(long)]
        ad_id: Option<String>,

        #[arg(long, help = "Inclusive, YYYY-MM-DD", value_parser = validate_date)]
        start: Option<NaiveDate>,

        #[arg(long, help = "Inclusive, YYYY-MM-DD", value_parser = validate_date)]
        end: Option<NaiveDate>,
    },
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|err| format!("Invalid date '{s}', expected YYYY-MM-DD: {err}"))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::init();

    match args.command {
        Command::Fetch {
            config,
            start,
            end,
            step_days,
            days_back,
            policy,
            format,
            skip_creatives,
        } => {
            let request = FetchRequest {
                start,
                end,
                step_days,
                days_back,
                policy,
                format,
                fetch_creatives: !skip_creatives,
            };
            if let Err(err) = runner::fetch_and_reconcile(config, request).await {
                error!("failed to fetch and reconcile insights: {}", err);
                std::process::exit(1);
            }
        }
        Command::Report {
            input,
            ad_id,
            start,
            end,
        } => {
            if let Err(err) = runner::report(&input, ad_id.as_deref(), start, end) {
                error!("failed to build report: {}", err);
                std::process::exit(1);
            }
        }
    };

    Ok(())
}
