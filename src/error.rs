use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("'The date supplied {date} is invalid'")]
    InvalidDate { date: String },

    #[error("The start date: '{start_date}' must be before the end date: '{end_date}'")]
    InvalidDateRange {
        start_date: String,
        end_date: String,
    },

    #[error("Step size must be at least one day, got {step_days}")]
    InvalidStepDays { step_days: u32 },

    #[error("API request failed: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("API responded with {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    NoData { message: String },

    #[error("ad_id '{ad_id}' can't be used in a file name")]
    InvalidAdId { ad_id: String },
}

/// Reasons a raw report row is dropped before it reaches the series.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowRejection {
    #[error("row could not be read: {reason}")]
    Unreadable { reason: String },

    #[error("row has no ad_id")]
    MissingAdId,

    #[error("ad_id '{ad_id}' has characters other than letters, digits, '_' or '-'")]
    InvalidAdId { ad_id: String },

    #[error("metric '{field}' has malformed value '{value}'")]
    InvalidMetric { field: &'static str, value: String },

    #[error("date_stop {date_stop} is before date_start {date_start}")]
    InvertedDates {
        date_start: chrono::NaiveDate,
        date_stop: chrono::NaiveDate,
    },
}
