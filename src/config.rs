use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:8732";
const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:8732";
const DEFAULT_CAMERA_SOURCE: &str = "stub://table";
const DEFAULT_CAMERA_WIDTH: u32 = 1280;
const DEFAULT_CAMERA_HEIGHT: u32 = 720;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_UPSTREAM_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_VISION_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_GENERATION_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Deserialize, Default)]
struct CalcamConfigFile {
    proxy_url: Option<String>,
    camera: Option<CameraConfigFile>,
    proxy: Option<ProxyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
    rotation: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ProxyConfigFile {
    addr: Option<String>,
    upstream_url: Option<String>,
    vision_model: Option<String>,
    generation_model: Option<String>,
}

/// Client-side configuration (the `calcam` CLI).
#[derive(Debug, Clone)]
pub struct CalcamConfig {
    /// Base URL of the proxy endpoint. The client never holds the upstream
    /// credential; every credentialed call goes through the proxy.
    pub proxy_url: String,
    pub camera: CameraSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Frame source: a device path (/dev/video0), an http(s) snapshot or
    /// MJPEG URL, or a stub:// synthetic source.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    /// Display rotation in degrees (0, 90, 180, 270).
    pub rotation: u32,
}

/// Server-side configuration (the `calcam_proxy` daemon).
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub addr: String,
    pub upstream_url: String,
    pub vision_model: String,
    pub generation_model: String,
}

impl CalcamConfig {
    /// Load configuration from the file named by `CALCAM_CONFIG` (if set),
    /// then apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let file_cfg = read_env_config_file()?;
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CalcamConfigFile) -> Self {
        let camera = CameraSettings {
            source: file
                .camera
                .as_ref()
                .and_then(|c| c.source.clone())
                .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string()),
            width: file
                .camera
                .as_ref()
                .and_then(|c| c.width)
                .unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: file
                .camera
                .as_ref()
                .and_then(|c| c.height)
                .unwrap_or(DEFAULT_CAMERA_HEIGHT),
            jpeg_quality: file
                .camera
                .as_ref()
                .and_then(|c| c.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
            rotation: file.camera.as_ref().and_then(|c| c.rotation).unwrap_or(0),
        };
        Self {
            proxy_url: file
                .proxy_url
                .unwrap_or_else(|| DEFAULT_PROXY_URL.to_string()),
            camera,
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CALCAM_PROXY_URL") {
            if !url.trim().is_empty() {
                self.proxy_url = url;
            }
        }
        if let Ok(source) = std::env::var("CALCAM_CAMERA_SOURCE") {
            if !source.trim().is_empty() {
                self.camera.source = source;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.camera.jpeg_quality == 0 || self.camera.jpeg_quality > 100 {
            return Err(anyhow!(
                "camera.jpeg_quality must be in 1..=100, got {}",
                self.camera.jpeg_quality
            ));
        }
        if !matches!(self.camera.rotation, 0 | 90 | 180 | 270) {
            return Err(anyhow!(
                "camera.rotation must be one of 0, 90, 180, 270, got {}",
                self.camera.rotation
            ));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        Ok(())
    }
}

impl ProxySettings {
    /// Load the `[proxy]` section from the same config file. The upstream
    /// credential is NOT part of the config; it comes from `GOOGLE_API_KEY`
    /// in the daemon environment only.
    pub fn load() -> Result<Self> {
        let file_cfg = read_env_config_file()?;
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CalcamConfigFile) -> Self {
        let proxy = file.proxy.unwrap_or_default();
        Self {
            addr: proxy.addr.unwrap_or_else(|| DEFAULT_PROXY_ADDR.to_string()),
            upstream_url: proxy
                .upstream_url
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            vision_model: proxy
                .vision_model
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            generation_model: proxy
                .generation_model
                .unwrap_or_else(|| DEFAULT_GENERATION_MODEL.to_string()),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("CALCAM_PROXY_ADDR") {
            if !addr.trim().is_empty() {
                self.addr = addr;
            }
        }
        if let Ok(url) = std::env::var("CALCAM_UPSTREAM_URL") {
            if !url.trim().is_empty() {
                self.upstream_url = url;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.upstream_url.starts_with("http://") && !self.upstream_url.starts_with("https://") {
            return Err(anyhow!(
                "proxy.upstream_url must be an http(s) URL, got '{}'",
                self.upstream_url
            ));
        }
        if self.vision_model.trim().is_empty() || self.generation_model.trim().is_empty() {
            return Err(anyhow!("proxy model names must be non-empty"));
        }
        Ok(())
    }
}

fn read_env_config_file() -> Result<Option<CalcamConfigFile>> {
    match std::env::var("CALCAM_CONFIG").ok() {
        Some(path) => read_config_file(Path::new(&path)).map(Some),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<CalcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = CalcamConfig::from_file(CalcamConfigFile::default());
        assert_eq!(cfg.proxy_url, DEFAULT_PROXY_URL);
        assert_eq!(cfg.camera.source, DEFAULT_CAMERA_SOURCE);
        assert_eq!(cfg.camera.jpeg_quality, DEFAULT_JPEG_QUALITY);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_quality() {
        let mut cfg = CalcamConfig::from_file(CalcamConfigFile::default());
        cfg.camera.jpeg_quality = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_rotation() {
        let mut cfg = CalcamConfig::from_file(CalcamConfigFile::default());
        cfg.camera.rotation = 45;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn proxy_section_parses() {
        let file: CalcamConfigFile = toml::from_str(
            r#"
            proxy_url = "http://127.0.0.1:9000"

            [proxy]
            addr = "127.0.0.1:9000"
            vision_model = "gemini-test"
            "#,
        )
        .unwrap();
        let proxy = ProxySettings::from_file(file);
        assert_eq!(proxy.addr, "127.0.0.1:9000");
        assert_eq!(proxy.vision_model, "gemini-test");
        assert_eq!(proxy.generation_model, DEFAULT_GENERATION_MODEL);
    }
}
