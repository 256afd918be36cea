use crate::aggregator::{derived_rates, rollup_all, DailyAggregator, RollupMetrics, RunReport};
use crate::api_client::{ApiClient, InsightsSource};
use crate::checkpoint::{CheckpointStore, FileCheckpoint};
use crate::config::Config;
use crate::creatives::{fetch_creatives, save_creatives, CREATIVES_FILE_NAME};
use crate::error::Error;
use crate::reconcile::ConversionPolicy;
use crate::sink::{self, OutputFormat, SeriesSink};
use chrono::{Days, Local, NaiveDate};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};

pub struct FetchRequest {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub step_days: u32,
    pub days_back: u32,
    pub policy: ConversionPolicy,
    pub format: OutputFormat,
    pub fetch_creatives: bool,
}

pub async fn fetch_and_reconcile(config: Config, request: FetchRequest) -> Result<(), Error> {
    let api_client = ApiClient::new(&config);
    let checkpoint = FileCheckpoint::new(&config);
    let sink = sink::sink_for(request.format, &config);
    let today = Local::now().date_naive();
    let creatives_path: Option<PathBuf> = request
        .fetch_creatives
        .then(|| Path::new(&config.output_dir).join(CREATIVES_FILE_NAME));

    run_pipeline(
        api_client,
        sink.as_ref(),
        &checkpoint,
        &request,
        today,
        creatives_path.as_deref(),
    )
    .await
    .map(|_| ())
}

/// Resolves the range, runs the aggregator, merges the new rows into what the
/// sink already holds, persists the result and advances the checkpoint. With a
/// `creatives_path`, the creatives of every ad seen in the run are saved there too.
///
/// # Returns
/// The [`RunReport`] of the run, `None` if the checkpoint is already past the requested end,
/// or an [`Error`] if the range is invalid, every window failed, or the output couldn't be written.
pub async fn run_pipeline<S: InsightsSource>(
    source: S,
    sink: &dyn SeriesSink,
    checkpoint: &dyn CheckpointStore,
    request: &FetchRequest,
    today: NaiveDate,
    creatives_path: Option<&Path>,
) -> Result<Option<RunReport>, Error> {
    let last_processed = checkpoint.last_processed()?;

    let Some((start, end)) = resolve_range(request, last_processed, today) else {
        info!(last_processed:? = last_processed; "already up to date, nothing to fetch");
        return Ok(None);
    };

    info!(start:% = start, end:% = end, step_days = request.step_days; "starting run");

    let aggregator = DailyAggregator::new(source, request.policy);
    let report = aggregator.run(start, end, request.step_days).await?;

    if report.all_windows_failed() {
        return Err(Error::NoData {
            message: format!("every window between {} and {} failed", start, end),
        });
    }

    if report.is_degraded() {
        warn!(
            skipped_windows = report.skipped_windows.len(),
            rejected_rows = report.rejected_rows;
            "run finished with gaps"
        );
        for skipped in &report.skipped_windows {
            warn!(window:% = skipped.window, reason = skipped.reason.as_str(); "window skipped");
        }
    }

    let mut stored = sink.load().await?;
    let previously_stored = stored.len();
    stored.extend(report.series.rows().cloned());
    sink.write(&stored).await?;
    info!(stored_before = previously_stored, stored_now = stored.len(); "series merged");

    if let Some(completed) = report.completed_through {
        if checkpoint_advances(last_processed, start, completed) {
            checkpoint.record(completed)?;
        } else {
            debug!(last_processed:? = last_processed, completed:% = completed; "checkpoint left as is");
        }
    }

    if let Some(path) = creatives_path {
        let ad_ids: Vec<String> = report.series.ad_ids().map(str::to_string).collect();
        let creatives = fetch_creatives(aggregator.source(), &ad_ids).await;
        save_creatives(path, creatives)?;
    }

    if let Some(last_day) = end.pred_opt() {
        for (ad_id, metrics) in rollup_all(&report.series, start, last_day) {
            log_rollup(&ad_id, &metrics);
        }
    }

    info!(
        rows = report.series.len(),
        windows = report.windows,
        skipped_windows = report.skipped_windows.len(),
        rejected_rows = report.rejected_rows;
        "run complete"
    );

    Ok(Some(report))
}

/// The checkpoint only moves forward, and only when the run picked up where the
/// last one stopped; a run starting past `last_processed + 1` would leave a gap behind it.
fn checkpoint_advances(last_processed: Option<NaiveDate>, start: NaiveDate, completed: NaiveDate) -> bool {
    match last_processed {
        None => true,
        Some(last) => completed > last && last.succ_opt().is_some_and(|next| start <= next),
    }
}

/// Picks the `[start, end)` range to fetch.
///
/// An explicit start wins; otherwise the day after the checkpoint, otherwise
/// `days_back` days before the end. Returns `None` when a checkpoint-derived
/// start has already reached the end.
pub fn resolve_range(
    request: &FetchRequest,
    last_processed: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<(NaiveDate, NaiveDate)> {
    let end = request.end.unwrap_or(today);

    if let Some(start) = request.start {
        return Some((start, end));
    }

    match last_processed {
        Some(last) => {
            let start = last.succ_opt()?;
            (start < end).then_some((start, end))
        }
        None => {
            let start = end
                .checked_sub_days(Days::new(u64::from(request.days_back)))
                .unwrap_or(NaiveDate::MIN);
            Some((start, end))
        }
    }
}

/// Prints per-ad roll-ups of a saved JSON series over `[start, end]`.
///
/// Missing bounds default to the first and last day in the file.
pub fn report(
    input: &Path,
    ad_id: Option<&str>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<(), Error> {
    let series = sink::load_series(input)?;

    let Some((first, last)) = series.date_span() else {
        return Err(Error::NoData {
            message: format!("{} contains no rows", input.display()),
        });
    };
    let start = start.unwrap_or(first);
    let end = end.unwrap_or(last);

    let mut rollups = rollup_all(&series, start, end);
    if let Some(ad_id) = ad_id {
        rollups.retain(|id, _| id == ad_id);
    }

    if rollups.is_empty() {
        error!(start:% = start, end:% = end; "no rows in range");
        return Err(Error::NoData {
            message: format!("no rows between {} and {}", start, end),
        });
    }

    println!("{}", report_header());
    for (ad_id, metrics) in &rollups {
        println!("{}", report_line(ad_id, metrics));
    }

    Ok(())
}

fn log_rollup(ad_id: &str, metrics: &RollupMetrics) {
    let rates = derived_rates(metrics);
    info!(
        ad_id = ad_id,
        impressions = metrics.impressions,
        clicks = metrics.clicks,
        spend = metrics.spend,
        custom_conversions = metrics.custom_conversion_count,
        ctr = rates.ctr,
        cpc = rates.cpc,
        cpm = rates.cpm;
        "ad rollup"
    );
}

fn report_header() -> String {
    format!(
        "{:<24} {:>12} {:>10} {:>12} {:>12} {:>8} {:>8} {:>8}",
        "ad_id", "impressions", "clicks", "spend", "conversions", "ctr%", "cpc", "cpm"
    )
}

fn report_line(ad_id: &str, metrics: &RollupMetrics) -> String {
    let rates = derived_rates(metrics);
    format!(
        "{:<24} {:>12} {:>10} {:>12.2} {:>12} {:>8.2} {:>8.2} {:>8.2}",
        ad_id,
        metrics.impressions,
        metrics.clicks,
        metrics.spend,
        metrics.custom_conversion_count,
        rates.ctr,
        rates.cpc,
        rates.cpm
    )
}
