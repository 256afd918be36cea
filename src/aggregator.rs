use crate::api_client::InsightsSource;
use crate::error::Error;
use crate::reconcile::{ConversionPolicy, ReconciledRow};
use chrono::{Days, NaiveDate};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fmt;

/// A half-open `[start, end)` range of days fetched as one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// The last day the window covers.
    pub fn last_day(&self) -> NaiveDate {
        self.end.pred_opt().unwrap_or(self.start).max(self.start)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Splits `[start, end)` into consecutive windows of `step_days`, the last one
/// clipped to `end`.
///
/// # Returns
/// The windows in increasing date order, or an [`Error`] if the range is
/// empty or the step is zero.
pub fn date_windows(start: NaiveDate, end: NaiveDate, step_days: u32) -> Result<Vec<DateWindow>, Error> {
    if start >= end {
        return Err(Error::InvalidDateRange {
            start_date: start.to_string(),
            end_date: end.to_string(),
        });
    }

    if step_days < 1 {
        return Err(Error::InvalidStepDays { step_days });
    }

    let mut windows = vec![];
    let mut current = start;
    while current < end {
        let next = current
            .checked_add_days(Days::new(u64::from(step_days)))
            .map_or(end, |next| next.min(end));
        windows.push(DateWindow {
            start: current,
            end: next,
        });
        current = next;
    }

    Ok(windows)
}

/// Reconciled rows keyed by ad, then by day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdDailySeries {
    ads: BTreeMap<String, BTreeMap<NaiveDate, ReconciledRow>>,
}

impl AdDailySeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row, replacing (and returning) any earlier row for the same ad and day.
    pub fn insert(&mut self, row: ReconciledRow) -> Option<ReconciledRow> {
        self.ads
            .entry(row.ad_id.clone())
            .or_default()
            .insert(row.date, row)
    }

    /// Every row, ordered by ad then date.
    pub fn rows(&self) -> impl Iterator<Item = &ReconciledRow> {
        self.ads.values().flat_map(|days| days.values())
    }

    pub fn ad_ids(&self) -> impl Iterator<Item = &str> {
        self.ads.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ads.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ads.is_empty()
    }

    /// Earliest and latest day present in the series.
    pub fn date_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self.ads.values().flat_map(|days| days.keys().copied());
        let first = dates.next()?;
        Some(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
    }
}

impl Extend<ReconciledRow> for AdDailySeries {
    /// Inserts every row in order, later rows replacing earlier ones for the same ad and day.
    fn extend<I: IntoIterator<Item = ReconciledRow>>(&mut self, iter: I) {
        for row in iter {
            self.insert(row);
        }
    }
}

impl FromIterator<ReconciledRow> for AdDailySeries {
    fn from_iter<I: IntoIterator<Item = ReconciledRow>>(iter: I) -> Self {
        let mut series = AdDailySeries::new();
        series.extend(iter);
        series
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedWindow {
    pub window: DateWindow,
    pub reason: String,
}

/// The outcome of one [`DailyAggregator::run`].
#[derive(Debug, Default)]
pub struct RunReport {
    pub series: AdDailySeries,
    pub windows: usize,
    pub skipped_windows: Vec<SkippedWindow>,
    pub rejected_rows: usize,
    /// Last day of the unbroken run of successful windows from the start.
    pub completed_through: Option<NaiveDate>,
}

impl RunReport {
    pub fn is_degraded(&self) -> bool {
        !self.skipped_windows.is_empty() || self.rejected_rows > 0
    }

    pub fn all_windows_failed(&self) -> bool {
        self.windows > 0 && self.skipped_windows.len() == self.windows
    }
}

/// Walks a date range window by window, reconciling every row the source returns.
pub struct DailyAggregator<S> {
    source: S,
    policy: ConversionPolicy,
}

impl<S: InsightsSource> DailyAggregator<S> {
    pub fn new(source: S, policy: ConversionPolicy) -> Self {
        DailyAggregator { source, policy }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches and reconciles `[start, end)` in windows of `step_days`.
    ///
    /// Windows are fetched one at a time in date order. A failed fetch is
    /// logged and recorded in the report; the run moves on to the next window.
    ///
    /// # Returns
    /// A [`RunReport`] with whatever was reconciled, or an [`Error`] if the
    /// range or step is invalid (checked before anything is fetched).
    pub async fn run(&self, start: NaiveDate, end: NaiveDate, step_days: u32) -> Result<RunReport, Error> {
        let windows = date_windows(start, end, step_days)?;
        let mut report = RunReport {
            windows: windows.len(),
            ..Default::default()
        };

        for window in windows {
            let rows = match self.source.fetch_window(&window).await {
                Ok(rows) => rows,
                Err(err) => {
                    error!(window:% = window, reason:% = err; "failed to fetch window, skipping");
                    report.skipped_windows.push(SkippedWindow {
                        window,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let fetched = rows.len();
            let mut accepted = 0usize;
            for fetched in rows {
                match fetched.and_then(|raw| ReconciledRow::from_raw(raw, &window, self.policy)) {
                    Ok(row) => {
                        report.series.insert(row);
                        accepted += 1;
                    }
                    Err(rejection) => {
                        warn!(window:% = window, reason:% = rejection; "rejected row");
                        report.rejected_rows += 1;
                    }
                }
            }

            info!(window:% = window, fetched = fetched, accepted = accepted; "window reconciled");

            if report.skipped_windows.is_empty() {
                report.completed_through = Some(window.last_day());
            }
        }

        Ok(report)
    }
}

/// Totals of one ad over a reporting range.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollupMetrics {
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub custom_conversion_count: u64,
}

impl RollupMetrics {
    fn add(&mut self, row: &ReconciledRow) {
        self.impressions = self.impressions.saturating_add(row.impressions);
        self.clicks = self.clicks.saturating_add(row.clicks);
        self.spend += row.spend;
        self.custom_conversion_count = self
            .custom_conversion_count
            .saturating_add(row.custom_conversion_count.unwrap_or(0));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedRates {
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
}

/// Sums one ad's rows whose date falls in `[start, end]`.
pub fn rollup(series: &AdDailySeries, ad_id: &str, start: NaiveDate, end: NaiveDate) -> RollupMetrics {
    let mut metrics = RollupMetrics::default();
    if start > end {
        return metrics;
    }

    if let Some(days) = series.ads.get(ad_id) {
        for row in days.range(start..=end).map(|(_, row)| row) {
            metrics.add(row);
        }
    }

    metrics
}

/// [`rollup`] for every ad in the series that has rows in `[start, end]`.
pub fn rollup_all(series: &AdDailySeries, start: NaiveDate, end: NaiveDate) -> BTreeMap<String, RollupMetrics> {
    if start > end {
        return BTreeMap::new();
    }

    series
        .ads
        .iter()
        .filter(|(_, days)| days.range(start..=end).next().is_some())
        .map(|(ad_id, _)| (ad_id.clone(), rollup(series, ad_id, start, end)))
        .collect()
}

/// Click-through rate (%), cost per click and cost per thousand impressions.
/// A zero denominator yields zero.
pub fn derived_rates(m: &RollupMetrics) -> DerivedRates {
    let impressions = m.impressions as f64;
    let clicks = m.clicks as f64;

    DerivedRates {
        ctr: if m.impressions > 0 { clicks * 100.0 / impressions } else { 0.0 },
        cpc: if m.clicks > 0 { m.spend / clicks } else { 0.0 },
        cpm: if m.impressions > 0 { m.spend * 1000.0 / impressions } else { 0.0 },
    }
}
