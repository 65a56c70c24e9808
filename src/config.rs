//! Pipeline configuration file support

use crate::capture::{CropRect, ReadBuffer};
use crate::error::{GlcastError, Result};
use crate::message::PixelFormat;
use crate::runner::ThreadRunner;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pipeline configuration loaded from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target capture rate in frames per second
    pub fps: f64,

    /// Scale factor applied by the scale stage, in (0, 1]
    pub scale: f64,

    /// Capture pixel format: "bgra" or "bgr"
    pub pixel_format: String,

    /// Row pack alignment: 1 or 8
    pub pack_alignment: u32,

    /// Hardware buffer to read from: "front" or "back"
    pub read_buffer: String,

    /// Probe for asynchronous device-to-host transfer
    pub try_async_transfer: bool,

    /// Draw the capture indicator on captured surfaces
    pub draw_indicator: bool,

    /// Never drop frames; block the host instead
    pub lock_fps: bool,

    /// Stamp frames with synthetic perfectly-spaced timestamps
    pub ignore_time: bool,

    /// Crop rectangle; all zero disables cropping
    #[serde(default)]
    pub crop_x: u32,
    #[serde(default)]
    pub crop_y: u32,
    #[serde(default)]
    pub crop_w: u32,
    #[serde(default)]
    pub crop_h: u32,

    /// Packet buffer capacity in bytes
    pub buffer_capacity: usize,

    /// Scale worker threads; 0 matches the available parallelism
    pub workers: usize,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            scale: 1.0,
            pixel_format: "bgra".to_string(),
            pack_alignment: 8,
            read_buffer: "front".to_string(),
            try_async_transfer: false,
            draw_indicator: false,
            lock_fps: false,
            ignore_time: false,
            crop_x: 0,
            crop_y: 0,
            crop_w: 0,
            crop_h: 0,
            buffer_capacity: 25 * 1024 * 1024,
            workers: 0,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as the executable: glcast.toml
    /// 2. $XDG_CONFIG_HOME/glcast/config.toml (or ~/.config)
    pub fn load_default() -> std::result::Result<Self, ConfigError> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let config_path = exe_dir.join("glcast.toml");
                if config_path.exists() {
                    return Self::load(&config_path);
                }
            }
        }

        let config_home = std::env::var("XDG_CONFIG_HOME").ok().or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| format!("{home}/.config"))
        });
        if let Some(config_home) = config_home {
            let config_path = Path::new(&config_home).join("glcast").join("config.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Parse the configured pixel format
    pub fn pixel_format(&self) -> Result<PixelFormat> {
        match self.pixel_format.as_str() {
            "bgra" => Ok(PixelFormat::Bgra),
            "bgr" => Ok(PixelFormat::Bgr),
            _ => Err(GlcastError::InvalidArgument("pixel_format")),
        }
    }

    /// Parse the configured read buffer
    pub fn read_buffer(&self) -> Result<ReadBuffer> {
        match self.read_buffer.as_str() {
            "front" => Ok(ReadBuffer::Front),
            "back" => Ok(ReadBuffer::Back),
            _ => Err(GlcastError::InvalidArgument("read_buffer")),
        }
    }

    /// Crop rectangle, None when disabled
    pub fn crop(&self) -> Option<CropRect> {
        if self.crop_x == 0 && self.crop_y == 0 && self.crop_w == 0 && self.crop_h == 0 {
            return None;
        }
        Some(CropRect {
            x: self.crop_x,
            y: self.crop_y,
            w: self.crop_w,
            h: self.crop_h,
        })
    }

    /// Effective scale worker count
    pub fn workers(&self) -> usize {
        if self.workers == 0 {
            ThreadRunner::default_threads()
        } else {
            self.workers
        }
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing the config file
    Io {
        path: String,
        source: std::io::Error,
    },
    /// Error parsing TOML
    Parse {
        path: String,
        source: toml::de::Error,
    },
    /// Error serializing config
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config file '{path}': {source}")
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file '{path}': {source}")
            }
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize(e) => Some(e),
        }
    }
}
