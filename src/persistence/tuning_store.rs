use super::TuningFile;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TuningStore {
    path: PathBuf,
}

impl TuningStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored values, or defaults when the file is missing,
    /// unreadable or holds values that fail validation.
    pub async fn load(&self) -> TuningFile {
        match self.try_load().await {
            Ok(Some(file)) => {
                info!("Loaded tuning from {}", self.path.display());
                file
            }
            Ok(None) => {
                info!("No tuning file at {}, using defaults", self.path.display());
                TuningFile::default()
            }
            Err(e) => {
                warn!("{}; using default tuning", e);
                TuningFile::default()
            }
        }
    }

    async fn try_load(&self) -> Result<Option<TuningFile>> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check tuning file: {}", e))?;
        if !exists {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read tuning file {}: {}", self.path.display(), e))?;
        let file: TuningFile = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse tuning file {}: {}", self.path.display(), e))?;

        file.params
            .validate()
            .map_err(|e| eyre!("Stored tuning parameters invalid: {}", e))?;
        file.presets
            .validate()
            .map_err(|e| eyre!("Stored mode presets invalid: {}", e))?;
        Ok(Some(file))
    }

    /// Writes through a temporary file so a crash mid-write keeps the old
    /// contents.
    pub async fn save(&self, file: &TuningFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create tuning directory: {}", e))?;
        }

        let content =
            toml::to_string_pretty(file).map_err(|e| eyre!("Failed to serialize tuning: {}", e))?;
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| eyre!("Failed to write tuning file: {}", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| eyre!("Failed to replace tuning file: {}", e))?;

        debug!("Tuning saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::{ModePresets, TuningParameters};

    #[tokio::test]
    async fn test_saved_values_come_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = TuningStore::new(dir.path().join("tuning.toml"));
        let file = TuningFile {
            params: TuningParameters {
                piston_speed_scale: 1.5,
                stroke_range_min: 0.1,
                stroke_range_max: 0.9,
                vibration_strength_scale: 0.7,
            },
            presets: ModePresets {
                piston_interval_secs: [1.2, 0.6, 0.2],
                vibe_strength: [0.3, 0.9],
            },
        };

        store.save(&file).await.unwrap();
        assert_eq!(store.load().await, file);
        assert!(!dir.path().join("tuning.toml.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = TuningStore::new(dir.path().join("absent.toml"));
        assert_eq!(store.load().await, TuningFile::default());
    }

    #[tokio::test]
    async fn test_damaged_or_invalid_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.toml");
        let store = TuningStore::new(&path);

        tokio::fs::write(&path, "params = [not toml").await.unwrap();
        assert_eq!(store.load().await, TuningFile::default());

        tokio::fs::write(
            &path,
            "[params]\nstroke_range_min = 0.9\nstroke_range_max = 0.1\n",
        )
        .await
        .unwrap();
        assert_eq!(store.load().await, TuningFile::default());
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.toml");
        tokio::fs::write(&path, "[params]\npiston_speed_scale = 2.0\n")
            .await
            .unwrap();

        let file = TuningStore::new(&path).load().await;
        assert_eq!(file.params.piston_speed_scale, 2.0);
        assert_eq!(file.params.stroke_range_max, 0.8);
        assert_eq!(file.presets, ModePresets::default());
    }
}
