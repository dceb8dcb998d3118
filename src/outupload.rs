use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskout::config::{CleanupPolicy, MissingOutputPolicy, S3Config, UploadOptions};
use taskout::literal::{DataLoadingFormat, IoStrategy, LiteralMap, Scalar, VariableMap};
use taskout::store::s3::S3Client;
use taskout::store::{DataReference, DataStore, LocalStore, RawStore, S3Store, StructuredFormat};
use taskout::{UploadError, Uploader};

#[derive(Parser, Debug)]
#[command(
    name = "outupload",
    version = env!("CARGO_PKG_VERSION"),
    about = "Upload task outputs and write a typed output record",
    long_about = "Reads an output schema, uploads every declared output found under the local \
                  directory to the raw data reference, and writes the resulting record to the \
                  output reference. References starting with s3:// use Amazon S3, anything else \
                  is treated as a local path.",
    after_help = "Examples:\n  \
                  outupload ./outputs -s schema.json --output-ref s3://bucket/meta/outputs.json --raw-ref s3://bucket/raw\n  \
                  outupload ./outputs -s schema.yaml --output-ref out/record.json --raw-ref out/raw --skip-missing\n\n\
                  Configuration (.env):\n  \
                  AWS_REGION=us-west-2          # required for s3:// references\n  \
                  AWS_PROFILE=default\n  \
                  UPLOAD_MAX_CONCURRENT=4\n  \
                  UPLOAD_ON_MISSING=fail        # or skip\n  \
                  UPLOAD_CLEANUP=keep           # or best-effort"
)]
struct Cli {
    /// Local directory the task wrote its outputs to
    path: PathBuf,

    /// Output schema file (JSON, or YAML with a .yaml/.yml extension)
    #[arg(long, short = 's')]
    schema: PathBuf,

    /// Where the output record is written
    #[arg(long)]
    output_ref: String,

    /// Base reference blob outputs are uploaded below
    #[arg(long)]
    raw_ref: String,

    /// Data loading format recorded on every output
    #[arg(long, value_enum, default_value_t = FormatArg::Json)]
    format: FormatArg,

    /// When uploads are triggered relative to task exit
    #[arg(long, value_enum, default_value_t = StrategyArg::UploadOnExit)]
    io_strategy: StrategyArg,

    /// Encoding of the output record
    #[arg(long, value_enum, default_value_t = RecordFormatArg::Json)]
    record_format: RecordFormatArg,

    /// File name (inside PATH) used to report task failure
    #[arg(long, default_value = "error.txt")]
    error_file: String,

    /// Maximum number of concurrent file uploads per directory
    #[arg(long, short = 'c')]
    max_concurrent: Option<usize>,

    /// Leave missing outputs out of the record instead of failing
    #[arg(long)]
    skip_missing: bool,

    /// Delete already uploaded files when a directory upload fails
    #[arg(long)]
    cleanup_on_failure: bool,

    /// Root for relative references when using the local store
    #[arg(long, default_value = ".")]
    store_root: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Yaml,
    Proto,
}

impl From<FormatArg> for DataLoadingFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => Self::Json,
            FormatArg::Yaml => Self::Yaml,
            FormatArg::Proto => Self::Proto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    UploadOnExit,
    UploadEager,
    DoNotUpload,
}

impl From<StrategyArg> for IoStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::UploadOnExit => Self::UploadOnExit,
            StrategyArg::UploadEager => Self::UploadEager,
            StrategyArg::DoNotUpload => Self::DoNotUpload,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RecordFormatArg {
    Json,
    Yaml,
}

impl From<RecordFormatArg> for StructuredFormat {
    fn from(value: RecordFormatArg) -> Self {
        match value {
            RecordFormatArg::Json => Self::Json,
            RecordFormatArg::Yaml => Self::Yaml,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    // Initialize tracing/logging with support for LOG_LEVEL from .env
    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    info!("Output Upload Tool v{}", env!("CARGO_PKG_VERSION"));

    let vars = load_schema(&cli.schema)?;
    let options = build_options(&cli)?;
    let raw = build_store(&cli).await?;
    let store = DataStore::new(raw).with_format(cli.record_format.into());

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight uploads");
            signal_token.cancel();
        }
    });

    let uploader = Uploader::new(
        store,
        cli.format.into(),
        cli.io_strategy.into(),
        cli.error_file.clone(),
    )
    .with_options(options)
    .with_cancellation(cancel);

    println!(
        "{}",
        style(format!("📦 Target: {} (record: {})", cli.raw_ref, cli.output_ref))
            .cyan()
            .bold()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message(format!(
        "Uploading {} output(s) from {}",
        vars.variables.len(),
        cli.path.display()
    ));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = uploader
        .recursive_upload(
            &vars,
            &cli.path,
            &DataReference::new(cli.output_ref.clone()),
            &DataReference::new(cli.raw_ref.clone()),
        )
        .await;
    spinner.finish_and_clear();

    match result {
        Ok(outputs) => {
            print_summary(&outputs);
            Ok(())
        }
        Err(e) => {
            error!("Upload failed: {}", e);
            report_failure(&cli.path, uploader.error_file_name(), &e).await;
            eprintln!("{} {}", style("✗").red(), style(e.user_message()).red());
            std::process::exit(1);
        }
    }
}

fn load_schema(path: &Path) -> Result<VariableMap> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let vars = if is_yaml {
        serde_yaml::from_str(&content).context("Failed to parse YAML schema")?
    } else {
        serde_json::from_str(&content).context("Failed to parse JSON schema")?
    };

    Ok(vars)
}

/// Environment first, command line flags win
fn build_options(cli: &Cli) -> Result<UploadOptions> {
    let mut options = UploadOptions::from_env()?;

    if let Some(max) = cli.max_concurrent {
        options = options.with_max_concurrent(max)?;
    }
    if cli.skip_missing {
        options = options.with_missing_output(MissingOutputPolicy::Skip);
    }
    if cli.cleanup_on_failure {
        options = options.with_cleanup(CleanupPolicy::BestEffort);
    }

    info!("Concurrent uploads per directory: {}", options.max_concurrent);
    Ok(options)
}

/// Pick the backend from the reference scheme; both references must agree
async fn build_store(cli: &Cli) -> Result<Arc<dyn RawStore>> {
    let output_s3 = cli.output_ref.starts_with("s3://");
    let raw_s3 = cli.raw_ref.starts_with("s3://");

    match (output_s3, raw_s3) {
        (true, true) => {
            let config = S3Config::from_env()?;
            info!("Using S3 store in region {}", config.region);
            let client = S3Client::new(config).await;
            let store: Arc<dyn RawStore> = Arc::new(S3Store::new(client));
            Ok(store)
        }
        (false, false) => {
            info!("Using local store rooted at {}", cli.store_root.display());
            let store: Arc<dyn RawStore> = Arc::new(LocalStore::new(cli.store_root.clone()));
            Ok(store)
        }
        _ => anyhow::bail!(
            "--output-ref '{}' and --raw-ref '{}' must use the same store",
            cli.output_ref,
            cli.raw_ref
        ),
    }
}

/// Leave a human-readable failure next to the outputs, unless the task
/// already reported its own
async fn report_failure(root: &Path, error_file: &str, err: &UploadError) {
    if matches!(err, UploadError::TaskFailed { .. }) {
        return;
    }

    let path = root.join(error_file);
    if !root.is_dir() || path.exists() {
        return;
    }
    if let Err(write_err) = tokio::fs::write(&path, err.user_message()).await {
        warn!(
            "Failed to write error file {}: {}",
            path.display(),
            write_err
        );
    }
}

fn print_summary(outputs: &LiteralMap) {
    println!();
    for (name, literal) in &outputs.literals {
        match &literal.scalar {
            Scalar::Blob(blob) => {
                println!(
                    "{} {} ({})",
                    style("✓").green(),
                    style(name).green(),
                    style(blob.dimensionality()).dim()
                );
                println!("  {} {}", style("🔗").blue(), style(&blob.uri).dim());
            }
            Scalar::Primitive(value) => {
                println!(
                    "{} {} = {}",
                    style("✓").green(),
                    style(name).green(),
                    style(format!("{:?}", value)).dim()
                );
            }
        }
    }

    println!();
    println!(
        "{}",
        style(format!("Summary: {} output(s) recorded", outputs.len())).bold()
    );
}
