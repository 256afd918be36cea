use crate::aggregator::DateWindow;
use crate::api_client::{parse_amount, ActionTuple, RawMetricRow, WindowValue};
use crate::error::RowRejection;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action type the tracking pixel reports custom conversions under.
pub const CUSTOM_CONVERSION: &str = "offsite_conversion.fb_pixel_custom";

const RATIO_WINDOW: &str = "1d_click";
const MAX_WINDOW: &str = "28d_click";

/// The count/value pair for a genuine conversion comes back roughly 35:1.
const EXPECTED_RATIO: f64 = 35.0;
const RATIO_TOLERANCE: f64 = 1.0;

/// How a single trustworthy conversion count is picked out of a row's actions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConversionPolicy {
    /// Compare the `1d_click` count in `actions` against `action_values`;
    /// keep the smaller one when the two are about 35:1 apart.
    #[default]
    Ratio,
    /// Highest `28d_click` count among the custom conversion actions.
    MaxWindow,
}

/// One cleaned (ad, day) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRow {
    pub ad_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_conversion_count: Option<u64>,
}

impl ReconciledRow {
    /// Validates a raw row and attaches its reconciled conversion count.
    ///
    /// Rows without a date of their own are stamped with the window's start.
    pub fn from_raw(
        raw: RawMetricRow,
        window: &DateWindow,
        policy: ConversionPolicy,
    ) -> Result<Self, RowRejection> {
        let custom_conversion_count = reconcile(&raw, policy);

        let ad_id = raw
            .ad_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(RowRejection::MissingAdId)?;

        if !is_valid_ad_id(&ad_id) {
            return Err(RowRejection::InvalidAdId { ad_id });
        }

        if let (Some(date_start), Some(date_stop)) = (raw.date_start, raw.date_stop) {
            if date_stop < date_start {
                return Err(RowRejection::InvertedDates {
                    date_start,
                    date_stop,
                });
            }
        }

        Ok(ReconciledRow {
            ad_id,
            ad_name: raw.ad_name,
            adset_id: raw.adset_id,
            campaign_id: raw.campaign_id,
            date: raw.date_start.unwrap_or(window.start),
            impressions: metric("impressions", raw.impressions.as_ref())?.trunc() as u64,
            clicks: metric("clicks", raw.clicks.as_ref())?.trunc() as u64,
            spend: metric("spend", raw.spend.as_ref())?,
            custom_conversion_count,
        })
    }
}

/// Ad ids end up in file names, so only letters, digits, `_` and `-` are accepted.
pub fn is_valid_ad_id(ad_id: &str) -> bool {
    !ad_id.is_empty()
        && ad_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn metric(field: &'static str, value: Option<&Value>) -> Result<f64, RowRejection> {
    match value {
        None | Some(Value::Null) => Ok(0.0),
        Some(value) => parse_amount(value).ok_or_else(|| RowRejection::InvalidMetric {
            field,
            value: match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }),
    }
}

/// Derives the custom conversion count of one row, or `None` when the row's
/// signals can't be trusted.
pub fn reconcile(row: &RawMetricRow, policy: ConversionPolicy) -> Option<u64> {
    match policy {
        ConversionPolicy::Ratio => reconcile_by_ratio(&row.actions, &row.action_values),
        ConversionPolicy::MaxWindow => reconcile_by_max_window(&row.actions),
    }
}

fn reconcile_by_ratio(actions: &[ActionTuple], action_values: &[ActionTuple]) -> Option<u64> {
    let count = last_custom_count(actions)?;
    let value = last_custom_count(action_values)?;

    match (count, value) {
        (0, 0) => Some(0),
        (0, _) | (_, 0) => None,
        _ => {
            let smaller = count.min(value);
            let larger = count.max(value);
            let ratio = larger as f64 / smaller as f64;

            ((ratio - EXPECTED_RATIO).abs() < RATIO_TOLERANCE).then_some(smaller)
        }
    }
}

// An entry without the window key reads as zero; a malformed one is skipped
// and the previous match stands.
fn last_custom_count(entries: &[ActionTuple]) -> Option<u64> {
    entries
        .iter()
        .filter(|entry| entry.action_type == CUSTOM_CONVERSION)
        .fold(None, |last, entry| match entry.window(RATIO_WINDOW) {
            WindowValue::Count(count) => Some(count),
            WindowValue::Missing => Some(0),
            WindowValue::Malformed => last,
        })
}

fn reconcile_by_max_window(actions: &[ActionTuple]) -> Option<u64> {
    let mut matching = actions
        .iter()
        .filter(|entry| entry.action_type == CUSTOM_CONVERSION)
        .peekable();

    matching.peek()?;

    Some(
        matching
            .filter_map(|entry| match entry.window(MAX_WINDOW) {
                WindowValue::Count(count) => Some(count),
                WindowValue::Missing | WindowValue::Malformed => None,
            })
            .max()
            .unwrap_or(0),
    )
}
