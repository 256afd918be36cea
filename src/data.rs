use crate::error::Error;
use crate::reconcile::{is_valid_ad_id, ReconciledRow};
use chrono::{NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{
    Array, ArrayRef, Date32Array, Date64Builder, Float64Array, Float64Builder, RecordBatch,
    StringArray, StringDictionaryBuilder, UInt64Array, UInt64Builder,
};
use datafusion::arrow::compute::{cast_with_options, CastOptions};
use datafusion::arrow::datatypes::{DataType, Field, Int32Type, Schema};
use datafusion::arrow::error::ArrowError;
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::prelude::{col, lit, DataFrame, ParquetReadOptions, SessionContext};
use std::path::Path;
use std::sync::Arc;

pub const AD_FILE_PREFIX: &str = "ad-";
pub const AD_FILE_EXTENSION: &str = ".parquet";

/// Creates the schema for reconciled rows.
///
/// # Returns
/// An [`Arc<Schema>`] with ad_id, campaign_id, date, impressions, clicks, spend
/// and the nullable custom_conversion_count.
pub fn reconciled_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(
            "ad_id",
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
            false,
        ),
        Field::new(
            "campaign_id",
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
            true,
        ),
        Field::new("date", DataType::Date64, false),
        Field::new("impressions", DataType::UInt64, false),
        Field::new("clicks", DataType::UInt64, false),
        Field::new("spend", DataType::Float64, false),
        Field::new("custom_conversion_count", DataType::UInt64, true),
    ]))
}

/// Converts reconciled rows to a DataFrame.
///
/// # Arguments
/// * `rows` - The rows to convert, in any order
/// * `ctx` - A reference to the [`SessionContext`] for DataFrame operations
/// * `schema` - The schema from [`reconciled_schema`]
///
/// # Returns
/// A Result containing either a [`DataFrame`] or an [`Error`]
pub fn convert_rows_to_df<'a>(
    rows: impl IntoIterator<Item = &'a ReconciledRow>,
    ctx: &SessionContext,
    schema: Arc<Schema>,
) -> Result<DataFrame, Error> {
    let rows: Vec<&ReconciledRow> = rows.into_iter().collect();

    let record_batch = {
        let num_rows = rows.len();

        let mut ad_id_builder = StringDictionaryBuilder::<Int32Type>::new();
        let mut campaign_id_builder = StringDictionaryBuilder::<Int32Type>::new();
        let mut date_builder = Date64Builder::with_capacity(num_rows);
        let mut impressions_builder = UInt64Builder::with_capacity(num_rows);
        let mut clicks_builder = UInt64Builder::with_capacity(num_rows);
        let mut spend_builder = Float64Builder::with_capacity(num_rows);
        let mut conversions_builder = UInt64Builder::with_capacity(num_rows);

        for row in rows {
            ad_id_builder.append(&row.ad_id)?;
            match &row.campaign_id {
                Some(campaign_id) => {
                    campaign_id_builder.append(campaign_id)?;
                }
                None => campaign_id_builder.append_null(),
            }
            date_builder.append_value(date_as_unix_ms(row.date));
            impressions_builder.append_value(row.impressions);
            clicks_builder.append_value(row.clicks);
            spend_builder.append_value(row.spend);
            conversions_builder.append_option(row.custom_conversion_count);
        }

        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(ad_id_builder.finish()),
                Arc::new(campaign_id_builder.finish()),
                Arc::new(date_builder.finish()),
                Arc::new(impressions_builder.finish()),
                Arc::new(clicks_builder.finish()),
                Arc::new(spend_builder.finish()),
                Arc::new(conversions_builder.finish()),
            ],
        )
    }?;

    let df = ctx.read_batch(record_batch)?;

    Ok(df)
}

/// Partitions the DataFrame by ad_id and saves each partition to a Parquet file.
///
/// # Arguments
/// * `df` - The DataFrame to be partitioned
/// * `output_dir` - The directory where the `ad-{ad_id}.parquet` files will be saved
///
/// # Returns
/// A Result containing either `()` or an [`Error`]
pub async fn partition_and_save_by_ad(df: DataFrame, output_dir: &str) -> Result<(), Error> {
    let distinct = df.clone().select(vec![col("ad_id")])?.distinct()?;
    let batches: Vec<RecordBatch> = distinct.collect().await?;

    let mut ad_ids = Vec::new();
    for batch in batches {
        let col0 = batch.column(0);

        let utf8_col = if col0.data_type() != &DataType::Utf8 {
            cast_with_options(col0.as_ref(), &DataType::Utf8, &CastOptions::default())?
        } else {
            col0.clone()
        };

        let sa = utf8_col
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| ArrowError::CastError("ad_id did not cast to Utf8".to_string()))?;

        for i in 0..sa.len() {
            if sa.is_valid(i) {
                ad_ids.push(sa.value(i).to_string());
            }
        }
    }

    std::fs::create_dir_all(output_dir)?;

    for ad_id in ad_ids {
        let path = Path::new(output_dir).join(ad_file_name(&ad_id)?);
        let slice = df.clone().filter(col("ad_id").eq(lit(ad_id.as_str())))?;

        slice
            .write_parquet(&path.to_string_lossy(), DataFrameWriteOptions::default(), None)
            .await?;
    }

    Ok(())
}

/// `ad-{ad_id}.parquet`, refusing ids that would escape the output directory.
pub fn ad_file_name(ad_id: &str) -> Result<String, Error> {
    if !is_valid_ad_id(ad_id) {
        return Err(Error::InvalidAdId {
            ad_id: ad_id.to_string(),
        });
    }

    Ok(format!("{AD_FILE_PREFIX}{ad_id}{AD_FILE_EXTENSION}"))
}

/// Reads back the rows of one file written by [`partition_and_save_by_ad`].
///
/// Only the columns of [`reconciled_schema`] survive, so `ad_name` and
/// `adset_id` come back empty.
pub async fn read_ad_parquet(ctx: &SessionContext, path: &Path) -> Result<Vec<ReconciledRow>, Error> {
    let df = ctx
        .read_parquet(&*path.to_string_lossy(), ParquetReadOptions::default())
        .await?;

    let mut rows = vec![];
    for batch in df.collect().await? {
        rows.extend(batch_to_rows(&batch)?);
    }

    Ok(rows)
}

fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<ReconciledRow>, Error> {
    let ad_ids = cast_column(batch, "ad_id", &DataType::Utf8)?;
    let campaign_ids = cast_column(batch, "campaign_id", &DataType::Utf8)?;
    let dates = cast_column(batch, "date", &DataType::Date32)?;
    let impressions = cast_column(batch, "impressions", &DataType::UInt64)?;
    let clicks = cast_column(batch, "clicks", &DataType::UInt64)?;
    let spend = cast_column(batch, "spend", &DataType::Float64)?;
    let conversions = cast_column(batch, "custom_conversion_count", &DataType::UInt64)?;

    let ad_ids = downcast::<StringArray>(&ad_ids, "ad_id")?;
    let campaign_ids = downcast::<StringArray>(&campaign_ids, "campaign_id")?;
    let dates = downcast::<Date32Array>(&dates, "date")?;
    let impressions = downcast::<UInt64Array>(&impressions, "impressions")?;
    let clicks = downcast::<UInt64Array>(&clicks, "clicks")?;
    let spend = downcast::<Float64Array>(&spend, "spend")?;
    let conversions = downcast::<UInt64Array>(&conversions, "custom_conversion_count")?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let date = dates
            .value_as_date(i)
            .ok_or_else(|| ArrowError::CastError(format!("date at row {i} is out of range")))?;

        rows.push(ReconciledRow {
            ad_id: ad_ids.value(i).to_string(),
            ad_name: None,
            adset_id: None,
            campaign_id: campaign_ids
                .is_valid(i)
                .then(|| campaign_ids.value(i).to_string()),
            date,
            impressions: impressions.value(i),
            clicks: clicks.value(i),
            spend: spend.value(i),
            custom_conversion_count: conversions.is_valid(i).then(|| conversions.value(i)),
        });
    }

    Ok(rows)
}

fn cast_column(batch: &RecordBatch, name: &str, to: &DataType) -> Result<ArrayRef, Error> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing column '{name}'")))?;

    Ok(cast_with_options(column.as_ref(), to, &CastOptions::default())?)
}

fn downcast<'a, T: Array + 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T, Error> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::from(ArrowError::CastError(format!("column '{name}' has an unexpected type"))))
}

fn date_as_unix_ms(date: NaiveDate) -> i64 {
    let unix_duration = date - NaiveDateTime::UNIX_EPOCH.date();

    unix_duration.num_milliseconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(ad_id: &str, campaign_id: Option<&str>, date: &str, custom: Option<u64>) -> ReconciledRow {
        ReconciledRow {
            ad_id: ad_id.to_string(),
            ad_name: None,
            adset_id: None,
            campaign_id: campaign_id.map(str::to_string),
            date: date.parse().unwrap(),
            impressions: 1000,
            clicks: 100,
            spend: 50.0,
            custom_conversion_count: custom,
        }
    }

    #[test]
    fn test_reconciled_schema() {
        let schema = reconciled_schema();
        assert_eq!(schema.fields().len(), 7);
        assert_eq!(schema.field(0).name(), "ad_id");
        assert_eq!(schema.field(2).name(), "date");
        assert_eq!(schema.field(6).name(), "custom_conversion_count");
        assert!(schema.field(6).is_nullable());
    }

    #[test]
    fn test_date_as_unix_ms() {
        let date = NaiveDate::from_ymd_opt(2023, 10, 1).unwrap();
        assert_eq!(date_as_unix_ms(date), 1696118400000);
    }

    #[tokio::test]
    async fn test_convert_rows_to_df() {
        let ctx = SessionContext::new();
        let rows = vec![
            row("123", Some("456"), "2023-10-01", Some(2)),
            row("123", None, "2023-10-02", None),
        ];

        let df = convert_rows_to_df(rows.iter(), &ctx, reconciled_schema()).unwrap();
        let result = df.collect().await.unwrap();
        assert_eq!(result.len(), 1); // One batch
        assert_eq!(result[0].num_rows(), 2);
        assert_eq!(result[0].column(1).null_count(), 1);
        assert_eq!(result[0].column(6).null_count(), 1);
    }

    #[tokio::test]
    async fn test_partition_and_save_by_ad() -> Result<(), Error> {
        let temp_dir = TempDir::new().unwrap();
        let output_dir = temp_dir.path().to_str().unwrap();
        let ctx = SessionContext::new();
        let rows = vec![
            row("123", Some("cmp"), "2023-10-01", Some(1)),
            row("789", Some("cmp"), "2023-10-01", None),
        ];

        let df = convert_rows_to_df(rows.iter(), &ctx, reconciled_schema())?;
        partition_and_save_by_ad(df, output_dir).await?;

        assert!(temp_dir.path().join("ad-123.parquet").exists());
        assert!(temp_dir.path().join("ad-789.parquet").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_ad_parquet_restores_rows() -> Result<(), Error> {
        let temp_dir = TempDir::new().unwrap();
        let output_dir = temp_dir.path().to_str().unwrap();
        let ctx = SessionContext::new();
        let rows = vec![
            row("123", Some("cmp"), "2023-10-01", Some(4)),
            row("123", None, "2023-10-02", None),
        ];

        let df = convert_rows_to_df(rows.iter(), &ctx, reconciled_schema())?;
        partition_and_save_by_ad(df, output_dir).await?;

        let mut restored = read_ad_parquet(&ctx, &temp_dir.path().join("ad-123.parquet")).await?;
        restored.sort_by_key(|row| row.date);
        assert_eq!(restored, rows);
        Ok(())
    }

    #[tokio::test]
    async fn test_partition_refuses_path_like_ad_id() {
        let temp_dir = TempDir::new().unwrap();
        let output_dir = temp_dir.path().join("out");
        let ctx = SessionContext::new();
        let rows = vec![row("../escape", None, "2023-10-01", None)];

        let df = convert_rows_to_df(rows.iter(), &ctx, reconciled_schema()).unwrap();
        let result = partition_and_save_by_ad(df, output_dir.to_str().unwrap()).await;

        assert!(matches!(result.unwrap_err(), Error::InvalidAdId { .. }));
        assert!(!temp_dir.path().join("escape.parquet").exists());
    }

    #[test]
    fn test_ad_file_name() {
        assert_eq!(ad_file_name("123").unwrap(), "ad-123.parquet");
        assert!(ad_file_name("a/b").is_err());
        assert!(ad_file_name("").is_err());
    }

    #[tokio::test]
    async fn test_partition_and_save_no_rows() {
        let temp_dir = TempDir::new().unwrap();
        let output_dir = temp_dir.path().to_str().unwrap();
        let ctx = SessionContext::new();
        let rows: Vec<ReconciledRow> = vec![];

        let df = convert_rows_to_df(rows.iter(), &ctx, reconciled_schema()).unwrap();
        partition_and_save_by_ad(df, output_dir).await.unwrap();
    }
}
