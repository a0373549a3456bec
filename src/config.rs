//! The peripheral CLI / configuration surface (spec §6): flag parsing is
//! explicitly out of scope for the cache engine itself, but the binary
//! still needs one. `clap`'s derive + `env` features give every flag an
//! environment-variable fallback for free, so every option is also
//! accepted via an environment variable.

use crate::cache::combined::RemoteIdentity;
use crate::remote::provider::{CiProviderClient, ProviderError, RemoteProvider, S3Config, S3LikeClient};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Silent => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum RemoteMode {
    None,
    S3Like,
    CiProvider,
}

/// The daemon's full configuration surface (spec §6), resolved from
/// flags with environment-variable fallbacks and a default cache
/// directory under the OS user-cache dir.
#[derive(Debug, Parser)]
#[command(name = "gocica", version, about = "A two-tier content-addressed build cache daemon")]
pub struct Config {
    /// Directory backing the local content-addressed store.
    #[arg(long, env = "GOCICA_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, env = "GOCICA_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "GOCICA_REMOTE", value_enum, default_value_t = RemoteMode::None)]
    pub remote: RemoteMode,

    /// CI-provider mode: base URL of the signed-URL catalog API.
    #[arg(long, env = "GOCICA_CI_API_URL")]
    pub ci_api_url: Option<Url>,
    /// CI-provider mode: bearer token. Absence silently degrades to
    /// local-only (spec §6, §7), regardless of `--remote`.
    #[arg(long, env = "GOCICA_CI_TOKEN")]
    pub ci_token: Option<String>,
    #[arg(long, env = "GOCICA_CI_OS")]
    pub ci_os: Option<String>,
    #[arg(long, env = "GOCICA_CI_REF")]
    pub ci_ref: Option<String>,
    #[arg(long, env = "GOCICA_CI_SHA")]
    pub ci_sha: Option<String>,

    /// S3-like mode: bucket region.
    #[arg(long, env = "GOCICA_S3_REGION")]
    pub s3_region: Option<String>,
    #[arg(long, env = "GOCICA_S3_BUCKET")]
    pub s3_bucket: Option<String>,
    #[arg(long, env = "GOCICA_S3_ACCESS_KEY")]
    pub s3_access_key: Option<String>,
    #[arg(long, env = "GOCICA_S3_SECRET_KEY")]
    pub s3_secret_key: Option<String>,
    #[arg(long, env = "GOCICA_S3_ENDPOINT")]
    pub s3_endpoint: Option<Url>,
    #[arg(long, env = "GOCICA_S3_PATH_STYLE")]
    pub s3_path_style: bool,
}

impl Config {
    /// The local store directory: the configured path, or the OS
    /// user-cache dir joined with `gocica` (spec §6 default).
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("", "", "gocica")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".gocica-cache"))
        })
    }

    /// Builds the remote provider and cache-key identity this run should
    /// use, or `None` for local-only operation. A selected remote mode
    /// missing its required credentials (no CI token, no S3 access key)
    /// silently falls back to local-only rather than erroring (spec §6,
    /// §7).
    pub fn remote_provider(&self) -> Result<Option<(Arc<dyn RemoteProvider>, RemoteIdentity)>, ProviderError> {
        match self.remote {
            RemoteMode::None => Ok(None),
            RemoteMode::CiProvider => {
                let (Some(base_url), Some(token)) = (self.ci_api_url.clone(), self.ci_token.clone()) else {
                    log::info!("remote mode is ci-provider but no token was configured; running local-only");
                    return Ok(None);
                };
                let client = CiProviderClient::new(base_url, token)?;
                let identity = RemoteIdentity {
                    prefix: "gocica-".to_string(),
                    os: self.ci_os.clone().unwrap_or_else(|| std::env::consts::OS.to_string()),
                    git_ref: self.ci_ref.clone(),
                    sha: self.ci_sha.clone(),
                };
                Ok(Some((Arc::new(client), identity)))
            }
            RemoteMode::S3Like => {
                let (Some(endpoint), Some(bucket), Some(access_key), Some(secret_key)) = (
                    self.s3_endpoint.clone(),
                    self.s3_bucket.clone(),
                    self.s3_access_key.clone(),
                    self.s3_secret_key.clone(),
                ) else {
                    log::info!("remote mode is s3-like but credentials were incomplete; running local-only");
                    return Ok(None);
                };
                let client = S3LikeClient::new(S3Config {
                    endpoint,
                    bucket,
                    region: self.s3_region.clone().unwrap_or_else(|| "us-east-1".to_string()),
                    access_key,
                    secret_key,
                    path_style: self.s3_path_style,
                })?;
                let identity = RemoteIdentity {
                    prefix: "gocica-".to_string(),
                    os: self.ci_os.clone().unwrap_or_else(|| std::env::consts::OS.to_string()),
                    git_ref: self.ci_ref.clone(),
                    sha: self.ci_sha.clone(),
                };
                Ok(Some((Arc::new(client), identity)))
            }
        }
    }
}
