use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Result, ThumbnailError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub thumbnail: ThumbnailConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.thumbnail.validate()
    }
}

/// Settings for a single thumbnail renderer and its decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Number of source frames folded into one thumbnail pixel.
    pub samples_per_thumbnail_sample: usize,
    pub image_height: u32,
    /// Horizontal oversampling applied before compositing into the image.
    pub resolution: f64,
    /// Delay the renderer asks for between two background slices.
    pub slice_interval_ms: u64,
    /// Period of the owner-thread repaint timer.
    pub timer_interval_ms: u64,
    /// Number of finished thumbnails kept for instant reloads.
    pub cache_capacity: usize,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            samples_per_thumbnail_sample: 512,
            image_height: 100,
            resolution: 3.0,
            slice_interval_ms: 50,
            timer_interval_ms: 100,
            cache_capacity: 3,
        }
    }
}

impl ThumbnailConfig {
    pub fn slice_interval(&self) -> Duration {
        Duration::from_millis(self.slice_interval_ms)
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.samples_per_thumbnail_sample == 0 {
            return Err(ThumbnailError::InvalidInput(
                "samples_per_thumbnail_sample must be at least one",
            ));
        }
        if self.image_height == 0 {
            return Err(ThumbnailError::InvalidInput(
                "image_height must be at least one pixel",
            ));
        }
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(ThumbnailError::InvalidInput(
                "resolution must be a positive number",
            ));
        }
        Ok(())
    }
}

/// Configuration of the shared background slicing thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: "thumbnail-slicer".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json(r#"{ "thumbnail": { "resolution": 2.0 } }"#).unwrap();

        assert_eq!(config.thumbnail.resolution, 2.0);
        assert_eq!(config.thumbnail.samples_per_thumbnail_sample, 512);
        assert_eq!(config.thumbnail.slice_interval(), Duration::from_millis(50));
        assert_eq!(config.scheduler.thread_name, "thumbnail-slicer");
    }

    #[test]
    fn rejects_non_positive_resolution() {
        let err = AppConfig::from_json(r#"{ "thumbnail": { "resolution": 0.0 } }"#).unwrap_err();
        assert!(matches!(err, ThumbnailError::InvalidInput(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "scheduler": { "thread_name": "slicer" } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.scheduler.thread_name, "slicer");
        assert_eq!(config.thumbnail, ThumbnailConfig::default());
    }
}
