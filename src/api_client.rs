use crate::aggregator::DateWindow;
use crate::config::Config;
use crate::error::{Error, RowRejection};
use chrono::NaiveDate;
use log::debug;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const INSIGHT_FIELDS: &str =
    "ad_id,ad_name,adset_id,campaign_id,impressions,clicks,spend,actions,action_values";
const ATTRIBUTION_WINDOWS: &str = r#"["1d_click","28d_click"]"#;
const CREATIVE_FIELDS: &str = "id,name,title,body,image_url,video_id,object_story_spec,url_tags";

/// A raw row as it came off the wire, or the reason it could not be read.
pub type FetchedRow = Result<RawMetricRow, RowRejection>;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait InsightsSource: Send + Sync + 'static {
    /// Fetches the ad-level insight rows reported for one date window.
    /// # Arguments
    /// * `window` - The half-open `[start, end)` range of days to query.
    /// # Returns
    /// A Result containing every row of every page, or an Error if any page failed.
    /// Entries that don't read as a [`RawMetricRow`] come back as rejections
    /// alongside the good rows of the same page.
    async fn fetch_window(&self, window: &DateWindow) -> Result<Vec<FetchedRow>, Error>;

    /// Fetches the first creative attached to an ad, if it has any.
    async fn fetch_creative(&self, ad_id: &str) -> Result<Option<AdCreative>, Error>;
}

/// One ad's metrics for one reporting window, as the insights endpoint returns them.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawMetricRow {
    #[serde(default)]
    pub ad_id: Option<String>,
    #[serde(default)]
    pub ad_name: Option<String>,
    #[serde(default)]
    pub adset_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub date_start: Option<NaiveDate>,
    #[serde(default)]
    pub date_stop: Option<NaiveDate>,
    #[serde(default)]
    pub impressions: Option<Value>,
    #[serde(default)]
    pub clicks: Option<Value>,
    #[serde(default)]
    pub spend: Option<Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub actions: Vec<ActionTuple>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub action_values: Vec<ActionTuple>,
}

impl RawMetricRow {
    /// Reads one entry of an insights page.
    pub fn from_value(value: Value) -> FetchedRow {
        serde_json::from_value(value).map_err(|err| RowRejection::Unreadable {
            reason: err.to_string(),
        })
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// An `action_type` with its per-attribution-window counts (`1d_click`, `28d_click`, `value`...).
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ActionTuple {
    pub action_type: String,
    #[serde(flatten)]
    pub windows: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowValue {
    Missing,
    Malformed,
    Count(u64),
}

impl ActionTuple {
    #[cfg(test)]
    pub fn new<'a>(action_type: &str, windows: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        ActionTuple {
            action_type: action_type.to_string(),
            windows: windows
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        }
    }

    /// Reads the count attributed under `key`, truncated toward zero.
    pub fn window(&self, key: &str) -> WindowValue {
        match self.windows.get(key) {
            None => WindowValue::Missing,
            Some(value) => match parse_amount(value) {
                Some(amount) => WindowValue::Count(amount.trunc() as u64),
                None => WindowValue::Malformed,
            },
        }
    }
}

/// Parses a numeric string or JSON number into a finite, non-negative amount.
pub fn parse_amount(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };

    (amount.is_finite() && amount >= 0.0).then_some(amount)
}

/// The creative an ad runs, as `ad_creatives.json` stores it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AdCreative {
    #[serde(default)]
    pub ad_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_story_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_tags: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    account_id: String,
    token: String,
    page_limit: u32,
}

#[derive(Deserialize)]
struct InsightsPage {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct CreativesPage {
    #[serde(default)]
    data: Vec<AdCreative>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ApiClient {
    pub fn new(config: &Config) -> Self {
        ApiClient {
            client: Client::new(),
            base_url: config.api_url.to_string(),
            account_id: config.account_id().to_string(),
            token: config.access_token.to_string(),
            page_limit: config.page_limit,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    fn insights_url(&self, window: &DateWindow) -> Result<Url, Error> {
        let account = format!("act_{}", self.account_id);
        let mut url = self.endpoint(&[account.as_str(), "insights"])?;

        let time_range = serde_json::json!({
            "since": window.start.format("%Y-%m-%d").to_string(),
            "until": window.last_day().format("%Y-%m-%d").to_string(),
        });

        url.query_pairs_mut()
            .append_pair("fields", INSIGHT_FIELDS)
            .append_pair("level", "ad")
            .append_pair("limit", &self.page_limit.to_string())
            .append_pair("time_range", &time_range.to_string())
            .append_pair("action_attribution_windows", ATTRIBUTION_WINDOWS)
            .append_pair("access_token", &self.token);

        Ok(url)
    }

    fn creatives_url(&self, ad_id: &str) -> Result<Url, Error> {
        let mut url = self.endpoint(&[ad_id, "adcreatives"])?;

        url.query_pairs_mut()
            .append_pair("fields", CREATIVE_FIELDS)
            .append_pair("access_token", &self.token);

        Ok(url)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error.message,
        Err(_) => status.to_string(),
    };
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait::async_trait]
impl InsightsSource for ApiClient {
    async fn fetch_window(&self, window: &DateWindow) -> Result<Vec<FetchedRow>, Error> {
        let mut url = self.insights_url(window)?;
        let mut rows = vec![];

        loop {
            let resp = ensure_success(self.client.get(url).send().await?).await?;

            let page: InsightsPage = resp.json().await?;
            debug!(window:% = window, rows = page.data.len(); "fetched insights page");
            rows.extend(page.data.into_iter().map(RawMetricRow::from_value));

            match page.paging.and_then(|paging| paging.next) {
                Some(next) => url = Url::parse(&next)?,
                None => break,
            }
        }

        Ok(rows)
    }

    async fn fetch_creative(&self, ad_id: &str) -> Result<Option<AdCreative>, Error> {
        let url = self.creatives_url(ad_id)?;
        let resp = ensure_success(self.client.get(url).send().await?).await?;

        let page: CreativesPage = resp.json().await?;
        Ok(page.data.into_iter().next().map(|creative| AdCreative {
            ad_id: ad_id.to_string(),
            ..creative
        }))
    }
}
