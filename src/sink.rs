use crate::aggregator::AdDailySeries;
use crate::config::Config;
use crate::data::{
    convert_rows_to_df, partition_and_save_by_ad, read_ad_parquet, reconciled_schema,
    AD_FILE_EXTENSION, AD_FILE_PREFIX,
};
use crate::error::Error;
use crate::reconcile::ReconciledRow;
use datafusion::prelude::SessionContext;
use log::{debug, info};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const JSON_FILE_NAME: &str = "offsite_conversions.json";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Parquet,
}

#[async_trait::async_trait]
pub trait SeriesSink: Send + Sync {
    /// Reads back everything earlier runs persisted; empty when nothing was written yet.
    async fn load(&self) -> Result<AdDailySeries, Error>;

    /// Persists a finished series, replacing what was there.
    async fn write(&self, series: &AdDailySeries) -> Result<(), Error>;
}

/// Writes the series as one JSON array of rows, ordered by ad then date.
#[derive(Clone, Debug)]
pub struct JsonSink {
    path: PathBuf,
}

impl JsonSink {
    pub fn new(config: &Config) -> Self {
        JsonSink::at(Path::new(&config.output_dir).join(JSON_FILE_NAME))
    }

    pub fn at(path: impl AsRef<Path>) -> Self {
        JsonSink {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl SeriesSink for JsonSink {
    async fn load(&self) -> Result<AdDailySeries, Error> {
        match load_series(&self.path) {
            Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => Ok(AdDailySeries::new()),
            result => result,
        }
    }

    async fn write(&self, series: &AdDailySeries) -> Result<(), Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let rows: Vec<&ReconciledRow> = series.rows().collect();
        let payload = serde_json::to_vec_pretty(&rows)?;
        fs::write(&self.path, payload)?;

        info!(path:% = self.path.display(), rows = rows.len(); "series written");
        Ok(())
    }
}

/// Writes one `ad-{ad_id}.parquet` file per ad.
#[derive(Clone, Debug)]
pub struct ParquetSink {
    output_dir: String,
}

impl ParquetSink {
    pub fn new(config: &Config) -> Self {
        ParquetSink {
            output_dir: config.output_dir.clone(),
        }
    }
}

#[async_trait::async_trait]
impl SeriesSink for ParquetSink {
    async fn load(&self) -> Result<AdDailySeries, Error> {
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(AdDailySeries::new()),
            Err(err) => return Err(err.into()),
        };

        let ctx = SessionContext::new();
        let mut series = AdDailySeries::new();
        for entry in entries {
            let path = entry?.path();
            let is_ad_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(AD_FILE_PREFIX) && name.ends_with(AD_FILE_EXTENSION));
            if !is_ad_file {
                continue;
            }

            let rows = read_ad_parquet(&ctx, &path).await?;
            debug!(path:% = path.display(), rows = rows.len(); "loaded saved rows");
            series.extend(rows);
        }

        Ok(series)
    }

    async fn write(&self, series: &AdDailySeries) -> Result<(), Error> {
        let ctx = SessionContext::new();
        let df = convert_rows_to_df(series.rows(), &ctx, reconciled_schema())?;
        partition_and_save_by_ad(df, &self.output_dir).await
    }
}

pub fn sink_for(format: OutputFormat, config: &Config) -> Box<dyn SeriesSink> {
    match format {
        OutputFormat::Json => Box::new(JsonSink::new(config)),
        OutputFormat::Parquet => Box::new(ParquetSink::new(config)),
    }
}

/// Reads a series previously written by [`JsonSink`].
pub fn load_series(path: impl AsRef<Path>) -> Result<AdDailySeries, Error> {
    let bytes = fs::read(path)?;
    let rows: Vec<ReconciledRow> = serde_json::from_slice(&bytes)?;
    Ok(rows.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn row(ad_id: &str, day: u32, custom: Option<u64>) -> ReconciledRow {
        ReconciledRow {
            ad_id: ad_id.to_string(),
            ad_name: Some(format!("{ad_id} name")),
            adset_id: None,
            campaign_id: Some("cmp".to_string()),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            impressions: 100,
            clicks: 10,
            spend: 2.5,
            custom_conversion_count: custom,
        }
    }

    #[tokio::test]
    async fn test_json_sink_writes_and_loads() {
        let temp_dir = TempDir::new().unwrap();
        let sink = JsonSink::at(temp_dir.path().join("out").join(JSON_FILE_NAME));
        let series: AdDailySeries = vec![row("B", 1, Some(3)), row("A", 2, None), row("A", 1, Some(0))]
            .into_iter()
            .collect();

        sink.write(&series).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(sink.path()).unwrap()).unwrap();
        let rows = written.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["ad_id"], "A");
        assert_eq!(rows[0]["date"], "2024-01-01");
        assert_eq!(rows[0]["custom_conversion_count"], 0);
        assert!(rows[1].get("custom_conversion_count").is_none());
        assert_eq!(rows[2]["ad_id"], "B");

        assert_eq!(load_series(sink.path()).unwrap(), series);
    }

    #[tokio::test]
    async fn test_json_sink_load_without_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let sink = JsonSink::at(temp_dir.path().join(JSON_FILE_NAME));

        assert!(sink.load().await.unwrap().is_empty());
    }

    #[test]
    fn test_load_series_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_series(temp_dir.path().join("nope.json"));
        assert!(matches!(result.unwrap_err(), Error::Io(_)));
    }

    #[tokio::test]
    async fn test_parquet_sink_writes_per_ad() {
        let temp_dir = TempDir::new().unwrap();
        let sink = ParquetSink {
            output_dir: temp_dir.path().to_str().unwrap().to_string(),
        };
        let series: AdDailySeries = vec![row("A", 1, Some(1)), row("B", 1, None)].into_iter().collect();

        sink.write(&series).await.unwrap();

        assert!(temp_dir.path().join("ad-A.parquet").exists());
        assert!(temp_dir.path().join("ad-B.parquet").exists());
    }

    #[tokio::test]
    async fn test_parquet_sink_loads_what_it_wrote() {
        let temp_dir = TempDir::new().unwrap();
        let sink = ParquetSink {
            output_dir: temp_dir.path().to_str().unwrap().to_string(),
        };
        assert!(sink.load().await.unwrap().is_empty());

        let mut first = row("A", 1, Some(1));
        first.ad_name = None;
        let mut second = row("B", 2, None);
        second.ad_name = None;
        let series: AdDailySeries = vec![first, second].into_iter().collect();
        sink.write(&series).await.unwrap();
        fs::write(temp_dir.path().join(JSON_FILE_NAME), "[]").unwrap();

        assert_eq!(sink.load().await.unwrap(), series);
    }
}
