use crate::api_client::{AdCreative, InsightsSource};
use crate::error::Error;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const CREATIVES_FILE_NAME: &str = "ad_creatives.json";

/// Fetches the creative of each ad in turn.
///
/// An ad whose request fails is logged and left out; an ad without a
/// creative is simply absent from the result.
pub async fn fetch_creatives<S: InsightsSource>(source: &S, ad_ids: &[String]) -> Vec<AdCreative> {
    let mut creatives = Vec::with_capacity(ad_ids.len());

    for ad_id in ad_ids {
        match source.fetch_creative(ad_id).await {
            Ok(Some(creative)) => creatives.push(creative),
            Ok(None) => warn!(ad_id = ad_id.as_str(); "ad has no creative"),
            Err(err) => warn!(ad_id = ad_id.as_str(), reason:% = err; "failed to fetch creative, skipping"),
        }
    }

    creatives
}

/// Reads `ad_creatives.json`; a missing file reads as no creatives.
pub fn load_creatives(path: impl AsRef<Path>) -> Result<Vec<AdCreative>, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err.into()),
    };

    Ok(serde_json::from_slice(&bytes)?)
}

/// Merges `creatives` into the file at `path`, one entry per ad, newest wins.
///
/// # Returns
/// The number of creatives now in the file.
pub fn save_creatives(path: impl AsRef<Path>, creatives: Vec<AdCreative>) -> Result<usize, Error> {
    let path = path.as_ref();

    let mut by_ad: BTreeMap<String, AdCreative> = load_creatives(path)?
        .into_iter()
        .chain(creatives)
        .map(|creative| (creative.ad_id.clone(), creative))
        .collect();
    by_ad.retain(|ad_id, _| !ad_id.is_empty());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let merged: Vec<&AdCreative> = by_ad.values().collect();
    fs::write(path, serde_json::to_vec_pretty(&merged)?)?;

    info!(path:% = path.display(), creatives = merged.len(); "creatives written");
    Ok(merged.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::MockInsightsSource;
    use tempfile::TempDir;

    fn creative(ad_id: &str, title: &str) -> AdCreative {
        AdCreative {
            ad_id: ad_id.to_string(),
            id: Some(format!("cr-{ad_id}")),
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_creatives_skips_failures() {
        let mut source = MockInsightsSource::new();
        source
            .expect_fetch_creative()
            .times(3)
            .returning(|ad_id| match ad_id {
                "A" => Ok(Some(creative("A", "first"))),
                "B" => Err(Error::Api {
                    status: 400,
                    message: "unsupported get request".to_string(),
                }),
                _ => Ok(None),
            });

        let ad_ids = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let creatives = fetch_creatives(&source, &ad_ids).await;

        assert_eq!(creatives, vec![creative("A", "first")]);
    }

    #[test]
    fn test_save_creatives_merges_by_ad() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out").join(CREATIVES_FILE_NAME);

        assert_eq!(save_creatives(&path, vec![creative("A", "old"), creative("B", "kept")]).unwrap(), 2);
        assert_eq!(save_creatives(&path, vec![creative("A", "new")]).unwrap(), 2);

        let saved = load_creatives(&path).unwrap();
        assert_eq!(saved, vec![creative("A", "new"), creative("B", "kept")]);
    }

    #[test]
    fn test_load_creatives_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_creatives(temp_dir.path().join(CREATIVES_FILE_NAME)).unwrap().is_empty());
    }
}
