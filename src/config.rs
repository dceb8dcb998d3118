use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Default number of concurrent file uploads within one directory
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Largest primitive output file that will be read (4KB)
pub const DEFAULT_MAX_PRIMITIVE_SIZE: u64 = 4 * 1024;

/// Largest task error file that will be read (1MB)
pub const MAX_ERROR_FILE_SIZE: u64 = 1024 * 1024;

/// Connection settings for the S3 backend
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub profile: Option<String>,
}

impl S3Config {
    /// Load configuration from environment variables and .env file
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if it exists

        let region = env::var("AWS_REGION")
            .context("AWS_REGION not found in environment. Please set it in .env file")?;
        Self::validate_region(&region)?;

        let profile = env::var("AWS_PROFILE").ok();

        Ok(Self { region, profile })
    }

    /// Validate AWS region format
    fn validate_region(region: &str) -> Result<()> {
        if region.is_empty() {
            anyhow::bail!("AWS_REGION cannot be empty");
        }

        // Basic validation - ensure it looks like a region (contains a dash)
        if !region.contains('-') {
            anyhow::bail!(
                "AWS_REGION '{}' doesn't look like a valid region (e.g., us-west-2, eu-west-1)",
                region
            );
        }

        Ok(())
    }
}

/// What to do when a declared output never appeared on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingOutputPolicy {
    #[default]
    Fail,
    Skip,
}

impl FromStr for MissingOutputPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            other => anyhow::bail!("unknown missing-output policy '{}' (use fail or skip)", other),
        }
    }
}

/// What to do with objects already uploaded when a directory upload fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    #[default]
    Keep,
    BestEffort,
}

impl FromStr for CleanupPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "best-effort" | "best_effort" => Ok(Self::BestEffort),
            other => anyhow::bail!(
                "unknown cleanup policy '{}' (use keep or best-effort)",
                other
            ),
        }
    }
}

/// Tunables for one uploader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub max_concurrent: usize,
    pub missing_output: MissingOutputPolicy,
    pub cleanup: CleanupPolicy,
    pub max_primitive_size: u64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            missing_output: MissingOutputPolicy::default(),
            cleanup: CleanupPolicy::default(),
            max_primitive_size: DEFAULT_MAX_PRIMITIVE_SIZE,
        }
    }
}

impl UploadOptions {
    /// Load overrides from `UPLOAD_MAX_CONCURRENT`, `UPLOAD_ON_MISSING` and
    /// `UPLOAD_CLEANUP`, falling back to defaults
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut options = Self::default();

        if let Ok(value) = env::var("UPLOAD_MAX_CONCURRENT") {
            let max = value
                .parse::<usize>()
                .with_context(|| format!("UPLOAD_MAX_CONCURRENT '{}' is not a number", value))?;
            options = options.with_max_concurrent(max)?;
        }
        if let Ok(value) = env::var("UPLOAD_ON_MISSING") {
            options.missing_output = value.parse()?;
        }
        if let Ok(value) = env::var("UPLOAD_CLEANUP") {
            options.cleanup = value.parse()?;
        }

        Ok(options)
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 {
            anyhow::bail!("max concurrent uploads must be at least 1");
        }
        self.max_concurrent = max_concurrent;
        Ok(self)
    }

    pub fn with_missing_output(mut self, policy: MissingOutputPolicy) -> Self {
        self.missing_output = policy;
        self
    }

    pub fn with_cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = policy;
        self
    }

    pub fn with_max_primitive_size(mut self, size: u64) -> Self {
        self.max_primitive_size = size;
        self
    }
}
