use crate::services::{object_store::S3Settings, transfer::MIN_PART_SIZE};
use base64::{Engine as _, engine::general_purpose};
use clap::Parser;
use std::{env, fmt, path::PathBuf, time::Duration};
use thiserror::Error;

/// Startup configuration problems. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("cache TTL ({ttl_secs}s) must not exceed the URL validity window ({validity_secs}s)")]
    CacheTtlExceedsUrlValidity { ttl_secs: u64, validity_secs: u64 },
}

/// Wrapper that keeps credentials out of `Debug` output and logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub staging_dir: PathBuf,
    /// Base used when building shareable `/share/{token}` links.
    pub public_base_url: String,
    pub s3: S3Settings,
    /// 32-byte AES-256-GCM key.
    pub encryption_key: Secret<Vec<u8>>,
    pub transfer: TransferSettings,
    pub url_validity: Duration,
    pub cache_ttl: Duration,
    pub share_ttl: Duration,
    pub link_sweep_interval: Duration,
    pub hard_delete_interval: Duration,
    pub hard_delete_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    /// Single-shot threshold and multipart chunk size, in bytes.
    pub part_size: usize,
    /// Maximum part uploads in flight for one object.
    pub upload_concurrency: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Encrypted file upload and sharing service")]
pub struct Args {
    /// Host to bind to (overrides FILEDROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILEDROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for locally staged uploads (overrides FILEDROP_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Database URL (overrides FILEDROP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Remote bucket name (overrides FILEDROP_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_URL_VALIDITY_SECS: u64 = 15 * 60;
const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool), ConfigError> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI `args` over variables looked up through `env`.
    pub fn resolve(
        args: Args,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| env(name).filter(|value| !value.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let port = match args.port {
            Some(port) => port,
            None => parse_or("FILEDROP_PORT", var("FILEDROP_PORT"), 3000)?,
        };
        let bucket = match args.bucket {
            Some(bucket) => bucket,
            None => required("FILEDROP_BUCKET")?,
        };

        let encryption_key = general_purpose::STANDARD
            .decode(required("FILEDROP_ENCRYPTION_KEY")?.trim())
            .map_err(|err| ConfigError::Invalid {
                name: "FILEDROP_ENCRYPTION_KEY",
                reason: format!("not base64: {err}"),
            })?;
        if encryption_key.len() != crate::services::crypto::KEY_LEN {
            return Err(ConfigError::Invalid {
                name: "FILEDROP_ENCRYPTION_KEY",
                reason: format!(
                    "must decode to {} bytes, got {}",
                    crate::services::crypto::KEY_LEN,
                    encryption_key.len()
                ),
            });
        }

        let part_size = parse_or("FILEDROP_PART_SIZE", var("FILEDROP_PART_SIZE"), MIN_PART_SIZE)?;
        if part_size < MIN_PART_SIZE {
            return Err(ConfigError::Invalid {
                name: "FILEDROP_PART_SIZE",
                reason: format!("must be at least {MIN_PART_SIZE} bytes"),
            });
        }
        let upload_concurrency = parse_or(
            "FILEDROP_UPLOAD_CONCURRENCY",
            var("FILEDROP_UPLOAD_CONCURRENCY"),
            DEFAULT_UPLOAD_CONCURRENCY,
        )?;
        if upload_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "FILEDROP_UPLOAD_CONCURRENCY",
                reason: "must be at least 1".into(),
            });
        }

        let url_validity = secs_or(
            "FILEDROP_URL_VALIDITY_SECS",
            var("FILEDROP_URL_VALIDITY_SECS"),
            DEFAULT_URL_VALIDITY_SECS,
        )?;
        let cache_ttl = secs_or(
            "FILEDROP_CACHE_TTL_SECS",
            var("FILEDROP_CACHE_TTL_SECS"),
            url_validity.as_secs(),
        )?;
        if cache_ttl > url_validity {
            return Err(ConfigError::CacheTtlExceedsUrlValidity {
                ttl_secs: cache_ttl.as_secs(),
                validity_secs: url_validity.as_secs(),
            });
        }

        let host = args
            .host
            .or_else(|| var("FILEDROP_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let public_base_url = var("FILEDROP_PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            host,
            port,
            database_url: args
                .database_url
                .or_else(|| var("FILEDROP_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/filedrop.db".into()),
            staging_dir: args
                .staging_dir
                .or_else(|| var("FILEDROP_STAGING_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("./data/staging")),
            public_base_url,
            s3: S3Settings {
                region: required("AWS_REGION")?,
                access_key_id: required("AWS_ACCESS_KEY_ID")?,
                secret_access_key: Secret::new(required("AWS_SECRET_ACCESS_KEY")?),
                bucket,
                endpoint: var("FILEDROP_S3_ENDPOINT"),
            },
            encryption_key: Secret::new(encryption_key),
            transfer: TransferSettings {
                part_size,
                upload_concurrency,
            },
            url_validity,
            cache_ttl,
            share_ttl: secs_or("FILEDROP_SHARE_TTL_SECS", var("FILEDROP_SHARE_TTL_SECS"), 15 * 60)?,
            link_sweep_interval: secs_or(
                "FILEDROP_LINK_SWEEP_SECS",
                var("FILEDROP_LINK_SWEEP_SECS"),
                5 * 60,
            )?,
            hard_delete_interval: secs_or(
                "FILEDROP_HARD_DELETE_SECS",
                var("FILEDROP_HARD_DELETE_SECS"),
                5 * 60,
            )?,
            hard_delete_grace: secs_or(
                "FILEDROP_HARD_DELETE_GRACE_SECS",
                var("FILEDROP_HARD_DELETE_GRACE_SECS"),
                2 * 60,
            )?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(value) => value.trim().parse().map_err(|err| ConfigError::Invalid {
            name,
            reason: format!("parsing `{value}`: {err}"),
        }),
        None => Ok(default),
    }
}

fn secs_or(name: &'static str, raw: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_or(name, raw, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}
