use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use session_core::{
    Config, HttpExecutor, LoadScheduler, MockExecutor, PhaseKind, RampReport, RequestExecutor,
    Schedule, StatsSummary, StopReasonCounts, TransitionMatrix, WaveReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "generator")]
#[command(about = "Web workload generator - plays emulated browser sessions in waves")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Schedule file: whitespace separated session counts, one per wave
    #[arg(long)]
    schedule: Option<PathBuf>,

    /// Request mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Wave duration in milliseconds (overrides config)
    #[arg(long)]
    wave_duration_ms: Option<u64>,

    /// Seed (overrides config)
    #[arg(long)]
    seed: Option<u64>,

    /// Run the configured up-ramp / session / down-ramp instead of waves
    #[arg(long)]
    ramp: bool,

    /// Print the matrix and the plan without running
    #[arg(long)]
    dry_run: bool,

    /// Directory for JSON results
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct WaveResult {
    index: usize,
    sessions: u32,
    first_session_id: u64,
    completed: usize,
    stragglers: usize,
    interrupted: usize,
    stop_reasons: StopReasonCounts,
    elapsed_ms: u64,
    stats: StatsSummary,
}

#[derive(Debug, Serialize, Deserialize)]
struct PhaseResult {
    kind: PhaseKind,
    slowdown: f64,
    duration_ms: u64,
    stats: StatsSummary,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunResult {
    run_id: String,
    timestamp: String,
    mode: String,
    seed: u64,
    duration_ms: u64,
    waves: Vec<WaveResult>,
    phases: Vec<PhaseResult>,
    aggregate: StatsSummary,
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

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(seed) = args.seed {
        config.session.seed = seed;
    }
    if let Some(ms) = args.wave_duration_ms {
        config.scheduler.wave_duration_ms = ms;
    }

    let matrix = config
        .load_matrix()
        .with_context(|| format!("Failed to load transition matrix {:?}", config.matrix.path))?;
    for warning in matrix.validate_from(matrix.operation_id(&config.matrix.entry_operation).unwrap_or(0)) {
        warn!("Matrix: {}", warning);
    }
    print_matrix(&matrix);

    let settings = config.scheduler_settings(&matrix)?;

    let executor: Arc<dyn RequestExecutor> = match args.mode.as_str() {
        "mock" => Arc::new(MockExecutor::new(5)),
        "http" => Arc::new(
            HttpExecutor::new(&config.target.base_url, config.target.flavor, config.target.timeout_ms)
                .context("Failed to create HTTP executor")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    info!("Using executor: {}", executor.name());

    let run_id = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let start = Instant::now();
    let mut scheduler = LoadScheduler::new(Arc::new(matrix), executor, settings);
    let names = scheduler.matrix().operations().to_vec();

    let mut waves = Vec::new();
    let mut phases = Vec::new();
    let mut schedule_error = None;

    if args.ramp {
        let ramp = config
            .ramp
            .as_ref()
            .context("--ramp requires a [ramp] section in the config")?;
        let plan = ramp.plan();
        print_ramp_plan(ramp.sessions, &plan);
        if args.dry_run {
            return Ok(());
        }

        let report = scheduler.run_ramp(ramp.sessions, &plan).await?;
        log_ramp(&report);
        phases = report
            .phases
            .iter()
            .map(|p| PhaseResult {
                kind: p.phase.kind,
                slowdown: p.phase.slowdown,
                duration_ms: p.phase.duration_ms,
                stats: p.stats.summary(&names),
            })
            .collect();
    } else {
        let path = args
            .schedule
            .as_ref()
            .context("--schedule is required unless --ramp is given")?;
        let schedule = Schedule::read(path)
            .with_context(|| format!("Failed to read schedule {:?}", path))?;
        print_schedule(&schedule, config.wave_duration().as_millis() as u64);
        if args.dry_run {
            return Ok(());
        }

        let reports = scheduler
            .run(schedule.waves(), config.wave_duration())
            .await;
        waves = reports.iter().map(|r| wave_result(r, &names)).collect();
        schedule_error = schedule.check().err();
    }

    let result = RunResult {
        run_id: run_id.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: args.mode.clone(),
        seed: config.session.seed,
        duration_ms: start.elapsed().as_millis() as u64,
        waves,
        phases,
        aggregate: scheduler.aggregate().summary(&names),
    };

    std::fs::create_dir_all(&args.output_dir).ok();
    let output_path = args.output_dir.join(format!("run_{run_id}.json"));
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)
        .with_context(|| format!("Failed to write {:?}", output_path))?;
    info!("Results written to {:?}", output_path);

    print_summary(&result);

    if let Some(err) = schedule_error {
        return Err(err).context("Run stopped early");
    }
    Ok(())
}

fn wave_result(report: &WaveReport, names: &[String]) -> WaveResult {
    WaveResult {
        index: report.index,
        sessions: report.sessions,
        first_session_id: report.session_ids.start,
        completed: report.completed,
        stragglers: report.stragglers,
        interrupted: report.interrupted,
        stop_reasons: report.stop_reasons,
        elapsed_ms: report.elapsed.as_millis() as u64,
        stats: report.stats.summary(names),
    }
}

fn log_ramp(report: &RampReport) {
    if report.stragglers > 0 || report.interrupted > 0 {
        warn!(
            "{} stragglers and {} interrupted workers out of {}",
            report.stragglers, report.interrupted, report.sessions
        );
    }
    info!(
        "Ramp finished in {}ms, {} workers reported",
        report.elapsed.as_millis(),
        report.completed
    );
}

fn print_matrix(matrix: &TransitionMatrix) {
    println!("\n=== Transition Matrix ({} operations) ===", matrix.len());
    print!("{matrix}");
    println!();
}

fn print_schedule(schedule: &Schedule, wave_duration_ms: u64) {
    println!("\n=== Wave Schedule ===");
    println!("Waves: {}", schedule.waves().len());
    println!("Wave duration: {}ms", wave_duration_ms);
    println!("Total sessions: {}", schedule.total_sessions());
    println!();

    for (idx, sessions) in schedule.waves().iter().enumerate() {
        println!("Wave {}: {} sessions", idx, sessions);
    }
    println!();
}

fn print_ramp_plan(sessions: u32, plan: &session_core::RampPlan) {
    println!("\n=== Ramp Plan ({} sessions) ===", sessions);
    println!("Total duration: {}ms", plan.total_duration_ms());
    println!();

    for (idx, phase) in plan.phases().iter().enumerate() {
        println!(
            "Phase {}: {:?} for {}ms, slowdown {}",
            idx, phase.kind, phase.duration_ms, phase.slowdown
        );
    }
    println!();
}

fn print_stats(stats: &StatsSummary) {
    println!("Operations: {}", stats.total);
    println!("Failures: {}", stats.failures);
    println!("Latency p50: {}ms", stats.latency_p50_ms);
    println!("Latency p95: {}ms", stats.latency_p95_ms);
    println!("Latency p99: {}ms", stats.latency_p99_ms);
    for op in &stats.operations {
        println!(
            "  {:<24} count={:<8} failures={:<6} avg={}ms max={}ms",
            op.operation, op.count, op.failures, op.avg_latency_ms, op.max_latency_ms
        );
    }
}

fn print_summary(result: &RunResult) {
    for wave in &result.waves {
        println!(
            "\n=== Wave {} ({} sessions, {}ms) ===",
            wave.index, wave.sessions, wave.elapsed_ms
        );
        if wave.stragglers > 0 || wave.interrupted > 0 {
            println!(
                "Stragglers: {}  Interrupted: {}",
                wave.stragglers, wave.interrupted
            );
        }
        print_stats(&wave.stats);
    }

    for phase in &result.phases {
        println!(
            "\n=== Phase {:?} (slowdown {}, {}ms) ===",
            phase.kind, phase.slowdown, phase.duration_ms
        );
        print_stats(&phase.stats);
    }

    println!("\n=== Run {} Summary ===", result.run_id);
    println!("Mode: {}", result.mode);
    println!("Seed: {}", result.seed);
    println!("Duration: {}ms", result.duration_ms);
    print_stats(&result.aggregate);
    println!();
}
