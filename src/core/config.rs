use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::security::{validate_stream_name, MAX_PRESIGN_EXPIRY_SECS};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub transcode: TranscodeConfig,
    pub delivery: DeliveryConfig,
    pub catalog: CatalogConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where packaged streams are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageBackend {
    Local,
    S3,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub package_backend: PackageBackend,
    pub local: LocalStorageConfig,
    /// Remote object store. Absent means the remote routes answer 503.
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    pub root_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_presign_expiry_secs")]
    pub max_presign_expiry_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_presign_expiry_secs() -> u64 {
    MAX_PRESIGN_EXPIRY_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub ffmpeg_path: String,
    /// Staging area for in-progress packaging and downloaded sources.
    pub work_dir: PathBuf,
    pub segment_duration_secs: u32,
    pub rendition_ladder: Vec<RenditionProfile>,
    pub encode_timeout_secs: u64,
    pub max_concurrent_jobs: usize,
    pub staging_max_age_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long finished jobs stay visible in the job API.
    pub job_retention_secs: u64,
    /// Finished jobs kept at most; the oldest are dropped first.
    pub max_retained_jobs: usize,
}

/// One entry of the rendition ladder, bitrates in kbps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenditionProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub cache_control_playlist: String,
    pub cache_control_segment: String,
    pub cache_control_video: String,
    pub cors_allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
    pub allowed_upload_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Zero disables the cache.
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl AppConfig {
    /// Load configuration with layered overrides:
    /// 1. config/default.toml (built-in defaults when absent)
    /// 2. config/{env}.toml (based on HLSVAULT_ENV)
    /// 3. Environment variables (HLSVAULT_* prefix)
    pub fn load() -> anyhow::Result<Self> {
        let default_path = Path::new("config/default.toml");
        let mut config = match std::fs::read_to_string(default_path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                anyhow::anyhow!("failed to parse {}: {}", default_path.display(), e)
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read {}: {}",
                    default_path.display(),
                    e
                ))
            }
        };

        // Layer 2: environment-specific overrides
        let env_name = std::env::var("HLSVAULT_ENV").unwrap_or_else(|_| "development".to_string());
        let env_path = format!("config/{}.toml", env_name);
        if let Ok(env_content) = std::fs::read_to_string(&env_path) {
            let env_config: AppConfig = toml::from_str(&env_content)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", env_path, e))?;
            config = env_config;
        }

        // Layer 3: environment variable overrides (selected keys)
        Self::apply_env_overrides(&mut config);

        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(v) = std::env::var("HLSVAULT_SERVER_HOST") {
            config.server.host = v;
        }
        if let Ok(v) = std::env::var("HLSVAULT_SERVER_PORT") {
            if let Ok(port) = v.parse() {
                config.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("HLSVAULT_STORAGE_PACKAGE_BACKEND") {
            match v.as_str() {
                "local" => config.storage.package_backend = PackageBackend::Local,
                "s3" => config.storage.package_backend = PackageBackend::S3,
                "memory" => config.storage.package_backend = PackageBackend::Memory,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("HLSVAULT_STORAGE_LOCAL_ROOT_DIR") {
            config.storage.local.root_dir = PathBuf::from(v);
        }
        if let Ok(endpoint) = std::env::var("HLSVAULT_STORAGE_S3_ENDPOINT") {
            let bucket = std::env::var("HLSVAULT_STORAGE_S3_BUCKET").unwrap_or_default();
            let s3 = config.storage.s3.get_or_insert_with(|| S3Config {
                endpoint: String::new(),
                bucket: String::new(),
                region: default_region(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                path_style: true,
                request_timeout_secs: default_request_timeout_secs(),
                max_presign_expiry_secs: default_max_presign_expiry_secs(),
            });
            s3.endpoint = endpoint;
            if !bucket.is_empty() {
                s3.bucket = bucket;
            }
        }
        if let Some(s3) = config.storage.s3.as_mut() {
            if let Ok(v) = std::env::var("HLSVAULT_STORAGE_S3_REGION") {
                s3.region = v;
            }
            if let Ok(v) = std::env::var("HLSVAULT_STORAGE_S3_ACCESS_KEY_ID") {
                s3.access_key_id = v;
            }
            if let Ok(v) = std::env::var("HLSVAULT_STORAGE_S3_SECRET_ACCESS_KEY") {
                s3.secret_access_key = v;
            }
        }
        if let Ok(v) = std::env::var("HLSVAULT_TRANSCODE_FFMPEG_PATH") {
            config.transcode.ffmpeg_path = v;
        }
        if let Ok(v) = std::env::var("HLSVAULT_TRANSCODE_SEGMENT_DURATION_SECS") {
            if let Ok(secs) = v.parse() {
                config.transcode.segment_duration_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("HLSVAULT_OBSERVABILITY_LOG_LEVEL") {
            config.observability.log_level = v;
        }
        if let Ok(v) = std::env::var("HLSVAULT_OBSERVABILITY_LOG_FORMAT") {
            config.observability.log_format = v;
        }
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let transcode = &self.transcode;
        if transcode.segment_duration_secs == 0 {
            return Err("transcode.segment_duration_secs must be greater than zero".to_string());
        }
        if transcode.max_concurrent_jobs == 0 {
            return Err("transcode.max_concurrent_jobs must be greater than zero".to_string());
        }
        if transcode.max_retained_jobs == 0 {
            return Err("transcode.max_retained_jobs must be greater than zero".to_string());
        }
        if transcode.staging_max_age_secs <= transcode.encode_timeout_secs {
            return Err(
                "transcode.staging_max_age_secs must exceed transcode.encode_timeout_secs"
                    .to_string(),
            );
        }
        validate_ladder(&transcode.rendition_ladder)?;

        match (&self.storage.package_backend, &self.storage.s3) {
            (PackageBackend::S3, None) => {
                return Err("storage.package_backend = \"s3\" requires a [storage.s3] section"
                    .to_string())
            }
            (_, Some(s3)) => {
                if s3.bucket.is_empty() {
                    return Err("storage.s3.bucket must not be empty".to_string());
                }
                if s3.max_presign_expiry_secs > MAX_PRESIGN_EXPIRY_SECS {
                    return Err(format!(
                        "storage.s3.max_presign_expiry_secs exceeds {}s",
                        MAX_PRESIGN_EXPIRY_SECS
                    ));
                }
            }
            _ => {}
        }

        if !matches!(self.observability.log_format.as_str(), "json" | "pretty") {
            return Err(format!(
                "observability.log_format must be \"json\" or \"pretty\", got {:?}",
                self.observability.log_format
            ));
        }
        Ok(())
    }
}

/// Check a rendition ladder: non-empty, unique valid names, non-zero dimensions and bitrates.
pub fn validate_ladder(ladder: &[RenditionProfile]) -> Result<(), String> {
    if ladder.is_empty() {
        return Err("rendition ladder must not be empty".to_string());
    }
    let mut seen = HashSet::new();
    for profile in ladder {
        validate_stream_name(&profile.name)
            .map_err(|e| format!("rendition {:?}: {}", profile.name, e))?;
        if !seen.insert(profile.name.as_str()) {
            return Err(format!("duplicate rendition name {:?}", profile.name));
        }
        if profile.width == 0 || profile.height == 0 {
            return Err(format!("rendition {:?} has a zero dimension", profile.name));
        }
        if profile.video_bitrate_kbps == 0 || profile.audio_bitrate_kbps == 0 {
            return Err(format!("rendition {:?} has a zero bitrate", profile.name));
        }
    }
    Ok(())
}

/// The default three-tier ladder.
pub fn default_ladder() -> Vec<RenditionProfile> {
    vec![
        RenditionProfile {
            name: "720p".to_string(),
            width: 1280,
            height: 720,
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
        },
        RenditionProfile {
            name: "480p".to_string(),
            width: 854,
            height: 480,
            video_bitrate_kbps: 1000,
            audio_bitrate_kbps: 96,
        },
        RenditionProfile {
            name: "360p".to_string(),
            width: 640,
            height: 360,
            video_bitrate_kbps: 600,
            audio_bitrate_kbps: 64,
        },
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            package_backend: PackageBackend::Local,
            local: LocalStorageConfig::default(),
            s3: None,
        }
    }
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data/videos"),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            work_dir: PathBuf::from("data/work"),
            segment_duration_secs: 10,
            rendition_ladder: default_ladder(),
            encode_timeout_secs: 3600,
            max_concurrent_jobs: 2,
            staging_max_age_secs: 6 * 3600,
            sweep_interval_secs: 600,
            job_retention_secs: 24 * 3600,
            max_retained_jobs: 1000,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            cache_control_playlist: "public, max-age=60".to_string(),
            cache_control_segment: "public, max-age=86400, immutable".to_string(),
            cache_control_video: "public, max-age=3600".to_string(),
            cors_allowed_origins: vec!["*".to_string()],
            max_upload_bytes: 2 * 1024 * 1024 * 1024,
            allowed_upload_extensions: ["mp4", "mov", "mkv", "webm", "m4v"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 5,
            cache_capacity: 256,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transcode.segment_duration_secs, 10);
        assert_eq!(config.transcode.rendition_ladder.len(), 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9090

            [storage]
            package_backend = "s3"

            [storage.s3]
            endpoint = "http://localhost:9000"
            bucket = "videos"
            path_style = true
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.package_backend, PackageBackend::S3);
        let s3 = config.storage.s3.as_ref().unwrap();
        assert_eq!(s3.region, "us-east-1");
        assert_eq!(s3.max_presign_expiry_secs, MAX_PRESIGN_EXPIRY_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn s3_package_backend_requires_s3_section() {
        let mut config = AppConfig::default();
        config.storage.package_backend = PackageBackend::S3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_segment_duration_rejected() {
        let mut config = AppConfig::default();
        config.transcode.segment_duration_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retained_jobs_rejected() {
        let mut config = AppConfig::default();
        assert_eq!(config.transcode.max_retained_jobs, 1000);
        config.transcode.max_retained_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ladder_rules() {
        assert!(validate_ladder(&[]).is_err());

        let mut dup = default_ladder();
        dup[1].name = "720p".to_string();
        assert!(validate_ladder(&dup).is_err());

        let mut zero = default_ladder();
        zero[2].height = 0;
        assert!(validate_ladder(&zero).is_err());

        let mut bad_name = default_ladder();
        bad_name[0].name = "../x".to_string();
        assert!(validate_ladder(&bad_name).is_err());
    }

    #[test]
    fn presign_cap_above_seven_days_rejected() {
        let mut config = AppConfig::default();
        config.storage.s3 = Some(S3Config {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "b".to_string(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            path_style: true,
            request_timeout_secs: 30,
            max_presign_expiry_secs: MAX_PRESIGN_EXPIRY_SECS + 1,
        });
        assert!(config.validate().is_err());
    }
}
