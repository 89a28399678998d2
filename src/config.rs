// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use crate::error::Error;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Ring sizes the frame ring supports (double or triple buffering)
pub const RING_SIZES: std::ops::RangeInclusive<usize> = 2..=3;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub frames: FrameConfig,
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
    pub buffers: BufferConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// CPU simulation, no GPU needed
    Host,
    Vulkan,
}

/// Device settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub app_name: String,
    pub validation_layers: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            app_name: "frame-ring".to_string(),
            validation_layers: true,
        }
    }
}

/// Frame ring settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FrameConfig {
    /// Frames in flight (2 or 3)
    pub ring_size: usize,
    /// How many frames the headless loop runs before exiting
    pub frames_to_run: u64,
    /// Virtual images cycled by the offscreen presenter
    pub offscreen_images: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            ring_size: 2,
            frames_to_run: 600,
            offscreen_images: 3,
        }
    }
}

/// Worker pool settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total workers; 0 = one per CPU minus the render thread
    pub workers: usize,
    pub rendering_workers: usize,
    pub resource_workers: usize,
    pub logging_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            rendering_workers: 1,
            resource_workers: 1,
            logging_workers: 0,
        }
    }
}

impl SchedulerConfig {
    /// Worker count with `0` resolved against the machine. The automatic
    /// count never drops below the specialised workers asked for.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
                .saturating_sub(1)
                .max(self.specialised_workers())
                .max(1)
        } else {
            self.workers
        }
    }

    pub fn specialised_workers(&self) -> usize {
        self.rendering_workers + self.resource_workers + self.logging_workers
    }
}

/// Synchronization settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Longest host wait on a timeline before the device is declared lost
    pub wait_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5000,
        }
    }
}

impl SyncConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Frame-local buffer capacities, in records
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BufferConfig {
    pub max_draws: usize,
    pub max_transforms: usize,
    pub max_materials: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_draws: 4096,
            max_transforms: 4096,
            max_materials: 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "frame_ring.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Clamp what can be clamped, reject what cannot.
    pub fn validate(&mut self) -> std::result::Result<(), Error> {
        if !RING_SIZES.contains(&self.frames.ring_size) {
            let clamped = self
                .frames
                .ring_size
                .clamp(*RING_SIZES.start(), *RING_SIZES.end());
            log::warn!(
                "ring_size {} is outside {:?}, using {}",
                self.frames.ring_size,
                RING_SIZES,
                clamped
            );
            self.frames.ring_size = clamped;
        }

        let workers = self.scheduler.worker_count();
        let specialised = self.scheduler.specialised_workers();
        if specialised > workers {
            return Err(Error::InvalidConfig(format!(
                "{} specialised workers requested but the pool only has {}",
                specialised, workers
            )));
        }

        if self.frames.offscreen_images == 0 {
            return Err(Error::InvalidConfig(
                "offscreen_images must be at least 1".into(),
            ));
        }

        let buffers = &self.buffers;
        if buffers.max_draws == 0 || buffers.max_transforms == 0 || buffers.max_materials == 0 {
            return Err(Error::InvalidConfig(format!(
                "frame buffers must hold at least one record (draws={}, transforms={}, materials={})",
                buffers.max_draws, buffers.max_transforms, buffers.max_materials
            )));
        }

        Ok(())
    }

    /// Get log level as a `log` filter
    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug.log_level.to_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => {
                log::warn!(
                    "Unknown log level '{}', defaulting to info",
                    self.debug.log_level
                );
                log::LevelFilter::Info
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.frames.ring_size, 2);
        assert_eq!(config.device.backend, BackendKind::Host);
        assert_eq!(config.sync.wait_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"
            [device]
            backend = "vulkan"

            [frames]
            ring_size = 3

            [scheduler]
            workers = 4
            logging_workers = 1
            "#,
        );
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.device.backend, BackendKind::Vulkan);
        assert_eq!(config.device.app_name, "frame-ring");
        assert_eq!(config.frames.ring_size, 3);
        assert_eq!(config.scheduler.worker_count(), 4);
        assert_eq!(config.scheduler.rendering_workers, 1);
        assert_eq!(config.buffers.max_materials, 1024);
    }

    #[test]
    fn ring_size_is_clamped() {
        let file = write_config("[frames]\nring_size = 8\n");
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.frames.ring_size, 3);

        let mut config = Config::default();
        config.frames.ring_size = 1;
        config.validate().unwrap();
        assert_eq!(config.frames.ring_size, 2);
    }

    #[test]
    fn too_many_specialised_workers_is_rejected() {
        let mut config = Config::default();
        config.scheduler.workers = 2;
        config.scheduler.logging_workers = 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn empty_buffers_are_rejected() {
        let file = write_config("[buffers]\nmax_draws = 0\n");
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let file = write_config("[frames\nring_size = ");
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn auto_worker_count_is_at_least_one() {
        let config = SchedulerConfig::default();
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn log_level_parsing() {
        let mut config = Config::default();
        config.debug.log_level = "DEBUG".into();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        config.debug.log_level = "loud".into();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }
}
