use crate::config::Config;
use crate::error::Error;
use chrono::NaiveDate;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub trait CheckpointStore {
    /// Reads the last day a previous run fully processed.
    /// # Returns
    /// `None` if no run has completed yet, or an Error if the stored value is unreadable.
    fn last_processed(&self) -> Result<Option<NaiveDate>, Error>;

    /// Records `date` as the last fully processed day.
    fn record(&self, date: NaiveDate) -> Result<(), Error>;
}

/// Keeps the checkpoint as a single `YYYY-MM-DD` line in a file.
#[derive(Clone, Debug)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(config: &Config) -> Self {
        FileCheckpoint::at(&config.checkpoint_path)
    }

    pub fn at(path: impl AsRef<Path>) -> Self {
        FileCheckpoint {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CheckpointStore for FileCheckpoint {
    fn last_processed(&self) -> Result<Option<NaiveDate>, Error> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let value = contents.trim();
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| Error::InvalidDate {
                date: value.to_string(),
            })
    }

    fn record(&self, date: NaiveDate) -> Result<(), Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", date.format("%Y-%m-%d")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_checkpoint_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpoint::at(temp_dir.path().join("last_processed"));

        assert!(store.last_processed().unwrap().is_none());
    }

    #[test]
    fn test_record_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("last_processed");
        let store = FileCheckpoint::at(&path);
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();

        store.record(date).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "2024-03-09\n");
        assert_eq!(store.last_processed().unwrap(), Some(date));
    }

    #[test]
    fn test_garbage_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("last_processed");
        fs::write(&path, "yesterday").unwrap();

        let result = FileCheckpoint::at(&path).last_processed();
        assert!(matches!(
            result.unwrap_err(),
            Error::InvalidDate { date } if date == "yesterday"
        ));
    }
}
