use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_region: String,
    /// Custom endpoint for MinIO or other S3-compatible stores.
    pub s3_endpoint: Option<String>,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    pub customization_endpoint: String,
    pub queue_name: String,
    pub customization_timeout: Duration,
    pub max_retries: u32,
    pub worker_pool_size: usize,
    pub lease_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    pub render_command: String,
    pub render_timeout: Duration,
    pub shutdown_grace: Duration,
    pub presign_expiry: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        let config = Config {
            database_url: env.require("DATABASE_URL")?,
            redis_url: env.require("REDIS_URL")?,
            s3_bucket: env.require("S3_BUCKET")?,
            s3_region: env.or("S3_REGION", "us-east-1"),
            s3_endpoint: env.optional("S3_ENDPOINT"),
            aws_access_key_id: env.require("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: env.require("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: env.require("ANTHROPIC_API_KEY")?,
            customization_endpoint: env.or(
                "CUSTOMIZATION_ENDPOINT",
                crate::llm_client::DEFAULT_API_URL,
            ),
            queue_name: env.or("QUEUE_NAME", "resume-customization"),
            customization_timeout: env.millis("CUSTOMIZATION_TIMEOUT_MS", 60_000)?,
            max_retries: env.parse("MAX_RETRIES", 2)?,
            worker_pool_size: env.parse("WORKER_POOL_SIZE", 4)?,
            lease_timeout: env.millis("LEASE_TIMEOUT_MS", 120_000)?,
            retry_backoff_base: env.millis("RETRY_BACKOFF_BASE_MS", 2_000)?,
            retry_backoff_max: env.millis("RETRY_BACKOFF_MAX_MS", 60_000)?,
            render_command: env.or("RENDER_COMMAND", "wkhtmltopdf --quiet {input} {output}"),
            render_timeout: env.millis("RENDER_TIMEOUT_MS", 30_000)?,
            shutdown_grace: env.millis("SHUTDOWN_GRACE_MS", 30_000)?,
            presign_expiry: Duration::from_secs(env.parse("PRESIGN_EXPIRY_SECS", 900)?),
            port: env.parse("PORT", 8080)?,
            rust_log: env.or("RUST_LOG", "info"),
        };

        if config.worker_pool_size == 0 {
            anyhow::bail!("WORKER_POOL_SIZE must be at least 1");
        }
        // A zero lease expires on dequeue and every job is redelivered at once.
        if config.lease_timeout.is_zero() {
            anyhow::bail!("LEASE_TIMEOUT_MS must be greater than 0");
        }

        Ok(config)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("Required environment variable '{key}' is not set"))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{key} has an invalid value '{raw}'")),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: u64) -> Result<Duration> {
        self.parse(key, default).map(Duration::from_millis)
    }
}
