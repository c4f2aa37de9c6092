use anyhow::{Context, Result};
use clap::Parser;
use session_core::{
    Config, HttpExecutor, MatrixWarning, RequestExecutor, SessionContext, TransitionMatrix,
    DEFAULT_TOLERANCE,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "matrix-check")]
#[command(about = "Preflight checks for a transition matrix and the target application")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Check this matrix file instead of the configured one
    #[arg(long)]
    matrix: Option<PathBuf>,

    /// Entry operation (overrides config)
    #[arg(long)]
    entry: Option<String>,

    /// Also request the entry operation once from the configured target
    #[arg(long)]
    probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // A standalone matrix check does not need a config file.
    let config = match (&args.matrix, args.probe) {
        (Some(_), false) => Config::from_file(&args.config).ok(),
        _ => Some(
            Config::from_file(&args.config)
                .with_context(|| format!("Failed to load config from {:?}", args.config))?,
        ),
    };

    let (path, tolerance) = match (&args.matrix, &config) {
        (Some(path), cfg) => (
            path.clone(),
            cfg.as_ref().map(|c| c.matrix.tolerance).unwrap_or(DEFAULT_TOLERANCE),
        ),
        (None, Some(cfg)) => (cfg.matrix.path.clone(), cfg.matrix.tolerance),
        (None, None) => anyhow::bail!("No matrix given and no config loaded"),
    };

    info!("Loading transition matrix from {:?}", path);
    let matrix = TransitionMatrix::load_with_tolerance(&path, tolerance)
        .with_context(|| format!("Invalid transition matrix {:?}", path))?;

    let entry_name = args
        .entry
        .clone()
        .or_else(|| config.as_ref().map(|c| c.matrix.entry_operation.clone()));
    let entry = match &entry_name {
        Some(name) => matrix
            .operation_id(name)
            .with_context(|| format!("Entry operation {name:?} is not in the matrix"))?,
        None => 0,
    };

    println!();
    println!("=== Transition Matrix ({} operations) ===", matrix.len());
    print!("{matrix}");
    println!();
    println!("Entry operation: {}", matrix.operation_name(entry));

    let warnings = matrix.validate_from(entry);
    print_warnings(&warnings);

    if args.probe {
        let cfg = config
            .as_ref()
            .context("--probe needs a config with a [target] section")?;
        let base = validate_base_url(&cfg.target.base_url)
            .with_context(|| format!("Invalid target.base_url: {}", cfg.target.base_url))?;
        let executor = HttpExecutor::new(base.as_str(), cfg.target.flavor, cfg.target.timeout_ms)?;

        let operation = matrix.operation_name(entry);
        let url = executor.url_for(operation)?;
        let context = SessionContext {
            session_id: 0,
            session_round: 0,
            transition: 0,
        };

        let start = Instant::now();
        match executor.execute(operation, &context).await {
            Ok(outcome) => {
                println!("GET {} -> OK ({}ms)", url, outcome.latency_ms);
            }
            Err(e) => {
                println!("GET {} -> ERROR ({}ms)", url, start.elapsed().as_millis());
                anyhow::bail!("Probe of entry operation failed: {e}");
            }
        }
    }

    println!();
    println!("Matrix OK.");
    Ok(())
}

fn print_warnings(warnings: &[MatrixWarning]) {
    println!();
    if warnings.is_empty() {
        println!("No diagnostics.");
        return;
    }

    println!("=== Diagnostics ({}) ===", warnings.len());
    for warning in warnings {
        println!("  {warning}");
        warn!("Matrix: {}", warning);
    }
}

fn validate_base_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("Target URL must be http:// or https:// (got {raw})");
    }
    if !url.username().is_empty() || url.password().is_some() {
        anyhow::bail!("Target URL must not include credentials (got {raw})");
    }
    url.host_str().context("Target URL must include a hostname")?;
    if url.query().is_some() || url.fragment().is_some() {
        anyhow::bail!("Target URL must not include query/fragment (got {raw})");
    }

    Ok(url)
}
