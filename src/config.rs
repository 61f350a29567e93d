use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the assistant endpoint, without a trailing slash.
    pub base_url: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub recordings_path: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Maximum active duration of a single chunk before rotating files.
    pub chunk_duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Retry ceiling for automatic (startup/drain) retries.
    pub automatic_max_retries: u32,
    /// Retry ceiling for the periodic background sweeper.
    pub sweeper_max_retries: u32,
    /// Minimum delay between sweeps; the delay grows linearly while
    /// failures persist and resets on a clean sweep.
    pub sweep_interval_secs: u64,
    pub max_sweep_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "loqa-recorder".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            recordings_path: "recordings".to_string(),
            sample_rate: 16000,
            channels: 1,
            chunk_duration_secs: 300, // 5 minutes
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "recordings/upload-queue.db".to_string(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            automatic_max_retries: 10_000,
            sweeper_max_retries: 10,
            sweep_interval_secs: 60,
            max_sweep_interval_secs: 900,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_present() {
        let cfg = Config::load("config/does-not-exist").unwrap();
        assert_eq!(cfg.audio.sample_rate, 16000);
        assert_eq!(cfg.audio.chunk_duration_secs, 300);
        assert_eq!(cfg.upload.automatic_max_retries, 10_000);
    }
}
