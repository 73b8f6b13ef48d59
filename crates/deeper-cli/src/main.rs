use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use deeper_core::breaker::BreakerRegistry;
use deeper_core::config::{AppConfig, parse_duration};
use deeper_core::dedup::DedupCache;
use deeper_core::engine::{EngineConfig, ExpansionEngine, ExpansionReport, RunOutcome};
use deeper_core::plugin::{Plugin, Registry};
use deeper_core::pool::WorkerPool;
use deeper_core::rate_limit::{DomainRateConfig, DomainRateLimiter};
use deeper_core::trace::{Trace, TraceKind};
use deeper_db::{DatabaseConfig, SqliteStore};
use deeper_plugins::register_builtins;

const EXIT_INVALID_INPUT: u8 = 1;
const EXIT_CANCELLED: u8 = 2;
const EXIT_ALL_PLUGINS_FAILED: u8 = 3;

#[derive(Parser)]
#[command(name = "deeper", version, about = "OSINT trace-expansion engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a seed and print every discovered trace
    Scan {
        /// Seed value: email, username, domain, IP, or URL
        input: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// Worker count (overrides DEEPER_MAX_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Default requests/sec per domain (overrides DEEPER_RATE_LIMIT)
        #[arg(long)]
        rate_limit: Option<f64>,

        /// Total run time budget (e.g. 30s, 5m)
        #[arg(long)]
        timeout: Option<String>,

        /// Maximum expansion depth (traces beyond it are reported, not expanded)
        #[arg(long)]
        depth: Option<u32>,

        /// Only print traces of these kinds (comma-separated)
        #[arg(long, value_delimiter = ',')]
        filter: Vec<String>,

        /// Save results as JSON to this path
        #[arg(long)]
        save: Option<PathBuf>,

        /// Print run statistics and metrics after the results
        #[arg(short, long)]
        verbose: bool,
    },

    /// Inspect registered plugins
    Plugins {
        #[command(subcommand)]
        action: PluginCommands,
    },

    /// Run configuration checks and plugin smoke tests
    Health,

    /// Validate a per-domain rate limit and print the matching environment
    /// variables to apply it at startup
    RateLimit {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        rate: f64,
        #[arg(long)]
        burst: u32,
        #[arg(long, default_value = "1s")]
        backoff_base: String,
        #[arg(long, default_value = "60s")]
        backoff_max: String,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List all registered plugins
    List,
    /// Show details for one plugin
    Info {
        #[arg(value_name = "PLUGIN_NAME")]
        name: String,
    },
    /// List all trace kinds and their plugin counts
    Types,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    setup_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_INVALID_INPUT)
        }
    }
}

fn setup_logging() {
    let level = std::env::var("DEEPER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("deeper={level},deeper_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Scan {
            input,
            output,
            concurrency,
            rate_limit,
            timeout,
            depth,
            filter,
            save,
            verbose,
        } => {
            cmd_scan(ScanArgs {
                input,
                output,
                concurrency,
                rate_limit,
                timeout,
                depth,
                filter,
                save,
                verbose,
            })
            .await
        }
        Commands::Plugins { action } => cmd_plugins(action),
        Commands::Health => cmd_health().await,
        Commands::RateLimit {
            domain,
            rate,
            burst,
            backoff_base,
            backoff_max,
            max_retries,
        } => cmd_rate_limit(domain, rate, burst, &backoff_base, &backoff_max, max_retries),
    }
}

struct ScanArgs {
    input: String,
    output: OutputFormat,
    concurrency: Option<usize>,
    rate_limit: Option<f64>,
    timeout: Option<String>,
    depth: Option<u32>,
    filter: Vec<String>,
    save: Option<PathBuf>,
    verbose: bool,
}

fn builtin_registry() -> Result<Arc<Registry>> {
    let mut registry = Registry::new();
    register_builtins(&mut registry).context("Failed to register built-in plugins")?;
    Ok(Arc::new(registry))
}

async fn cmd_scan(args: ScanArgs) -> Result<ExitCode> {
    let mut config = AppConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    if let Some(concurrency) = args.concurrency {
        config.max_concurrency = concurrency;
    }
    if let Some(rate) = args.rate_limit {
        config.rate_limit = rate;
    }

    let max_duration = args
        .timeout
        .as_deref()
        .map(|raw| {
            parse_duration(raw)
                .ok_or_else(|| anyhow::anyhow!("invalid --timeout '{raw}': expected e.g. 30s, 5m"))
        })
        .transpose()?;

    let filter_kinds = parse_filter_kinds(&args.filter)?;

    let registry = builtin_registry()?;
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let cancel = CancellationToken::new();

    {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            token.cancel();
        });
    }

    let pool = Arc::new(WorkerPool::new(
        config.pool_config(),
        breakers.clone(),
        cancel.clone(),
    ));

    let limiter = Arc::new(
        DomainRateLimiter::new(config.default_domain_rate()).map_err(|e| anyhow::anyhow!(e))?,
    );
    for rate in &config.domain_rates {
        limiter
            .add_domain_config(rate.clone())
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    let store = match DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))? {
        Some(db_config) => match SqliteStore::connect(&db_config).await {
            Ok(store) => {
                match store.prune_expired().await {
                    Ok(pruned) if pruned > 0 => {
                        tracing::debug!(pruned, "Pruned expired cache entries");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Cache pruning failed"),
                }
                Some(store)
            }
            Err(e) => {
                // Persistence is best-effort; a broken database only costs
                // cross-run dedup and history.
                tracing::warn!(error = %e, "Persistent store unavailable, continuing without it");
                None
            }
        },
        None => None,
    };

    let dedup = config
        .enable_dedup
        .then(|| Arc::new(DedupCache::with_store(config.dedup_config(), store.clone())));

    let engine_config = EngineConfig {
        max_duration,
        max_depth: args.depth,
        ..config.engine_config()
    };

    let engine = ExpansionEngine::new(
        registry,
        pool.clone(),
        limiter.clone(),
        breakers.clone(),
        dedup,
        engine_config,
    );

    let report = match engine.run(&args.input, cancel.clone()).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ExitCode::from(EXIT_INVALID_INPUT));
        }
    };

    if let Some(store) = &store
        && let Err(e) = store.persist_run(&report).await
    {
        tracing::warn!(error = %e, "Failed to persist scan session");
    }

    let traces = filtered_traces(&report, &filter_kinds);

    if traces.is_empty() {
        println!("No traces found");
    } else {
        match args.output {
            OutputFormat::Table => print_table(&traces),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&traces)?),
            OutputFormat::Csv => print_csv(&traces),
        }
    }

    if let Some(path) = &args.save {
        std::fs::write(path, serde_json::to_string_pretty(&traces)?)
            .with_context(|| format!("Failed to save results to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Results saved");
    }

    if args.verbose {
        eprintln!("\nRun statistics:");
        eprintln!("{}", serde_json::to_string_pretty(&report.stats)?);
        eprintln!("\nPool metrics:");
        eprintln!("{}", serde_json::to_string_pretty(&pool.metrics_snapshot())?);
        eprintln!("\nDomain limiter:");
        eprintln!("{}", serde_json::to_string_pretty(&limiter.metrics())?);
        eprintln!("\nCircuit breakers:");
        eprintln!("{}", serde_json::to_string_pretty(&breakers.stats())?);
    }

    let _ = pool.shutdown(Duration::from_secs(5)).await;

    Ok(exit_code_for(&report))
}

fn exit_code_for(report: &ExpansionReport) -> ExitCode {
    if report.outcome == RunOutcome::Cancelled {
        return ExitCode::from(EXIT_CANCELLED);
    }
    if report.stats.submitted > 0 && report.stats.succeeded == 0 {
        return ExitCode::from(EXIT_ALL_PLUGINS_FAILED);
    }
    ExitCode::SUCCESS
}

fn parse_filter_kinds(raw: &[String]) -> Result<HashSet<TraceKind>> {
    raw.iter()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<TraceKind>()
                .map_err(|e| anyhow::anyhow!("invalid --filter value: {e}"))
        })
        .collect()
}

fn filtered_traces(report: &ExpansionReport, kinds: &HashSet<TraceKind>) -> Vec<Trace> {
    let mut traces: Vec<Trace> = report
        .traces
        .iter()
        .filter(|t| kinds.is_empty() || kinds.contains(&t.kind))
        .cloned()
        .collect();
    // Sort by kind for stable human-readable output; JSON/CSV share it.
    traces.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.value.cmp(&b.value)));
    traces
}

fn print_table(traces: &[Trace]) {
    let width = traces
        .iter()
        .map(|t| t.value.len())
        .max()
        .unwrap_or(0)
        .clamp(5, 60);

    println!("{:<width$}  {}", "VALUE", "KIND");
    println!("{}", "-".repeat(width + 18));
    for trace in traces {
        let value = if trace.value.len() > width {
            format!("{}...", &trace.value[..width - 3])
        } else {
            trace.value.clone()
        };
        println!("{value:<width$}  {}", trace.kind);
    }
    println!("\nTotal: {} traces", traces.len());
}

fn print_csv(traces: &[Trace]) {
    println!("value,kind");
    for trace in traces {
        println!("{},{}", csv_escape(&trace.value), trace.kind);
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn cmd_plugins(action: PluginCommands) -> Result<ExitCode> {
    let registry = builtin_registry()?;

    match action {
        PluginCommands::List => {
            println!("{:<24} {}", "NAME", "INPUT KIND");
            println!("{}", "-".repeat(40));
            for plugin in registry.all() {
                println!("{:<24} {}", plugin.name(), plugin.input_kind());
            }
            println!("\nTotal: {} plugins", registry.len());
        }
        PluginCommands::Info { name } => {
            let Some(plugin) = registry.find(&name) else {
                eprintln!("Plugin not found: {name}");
                return Ok(ExitCode::from(EXIT_INVALID_INPUT));
            };
            println!("Plugin: {}", plugin.name());
            println!("  Input kind:  {}", plugin.input_kind());
            let order = registry
                .names_for(plugin.input_kind())
                .iter()
                .position(|n| n == plugin.name())
                .map(|i| i + 1)
                .unwrap_or(0);
            println!("  Order:       {order} (for its kind)");
        }
        PluginCommands::Types => {
            println!("{:<18} {}", "KIND", "PLUGINS");
            println!("{}", "-".repeat(28));
            for kind in TraceKind::all() {
                let count = registry.lookup(*kind).len();
                if count > 0 {
                    println!("{:<18} {count}", kind.as_str());
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Fixed sample inputs used by the health smoke tests.
fn sample_input(kind: TraceKind) -> &'static str {
    match kind {
        TraceKind::Email => "test@example.com",
        TraceKind::Url => "https://example.com/page",
        TraceKind::Domain => "example.com",
        TraceKind::Username => "testuser",
        TraceKind::Ip => "192.0.2.1",
        _ => "sample",
    }
}

async fn cmd_health() -> Result<ExitCode> {
    println!("deeper system health check");
    println!("==========================");

    let mut failed = 0;

    match AppConfig::from_env() {
        Ok(_) => println!("[PASS] configuration"),
        Err(e) => {
            println!("[FAIL] configuration: {e}");
            failed += 1;
        }
    }

    let registry = builtin_registry()?;
    if registry.is_empty() {
        println!("[FAIL] plugin registration: no plugins registered");
        failed += 1;
    } else {
        println!(
            "[PASS] plugin registration: {} plugins for {} kinds",
            registry.len(),
            registry.kinds().len()
        );
    }

    for kind in [TraceKind::Email, TraceKind::Url, TraceKind::Domain] {
        if registry.lookup(kind).is_empty() {
            println!("[WARN] no plugins for core kind '{kind}'");
        }
    }

    for plugin in registry.all() {
        let kind = plugin.input_kind();
        let trace = Trace::new(sample_input(kind), kind);
        let outcome =
            tokio::time::timeout(Duration::from_secs(5), plugin.expand(&trace)).await;
        match outcome {
            Ok(Ok(emitted)) => {
                println!("[PASS] plugin {}: {} traces", plugin.name(), emitted.len());
            }
            Ok(Err(e)) => {
                println!("[FAIL] plugin {}: {e}", plugin.name());
                failed += 1;
            }
            Err(_) => {
                println!("[FAIL] plugin {}: smoke test timed out", plugin.name());
                failed += 1;
            }
        }
    }

    if failed > 0 {
        println!("\nHealth check completed with {failed} failures");
        Ok(ExitCode::from(EXIT_INVALID_INPUT))
    } else {
        println!("\nAll health checks passed");
        Ok(ExitCode::SUCCESS)
    }
}

fn cmd_rate_limit(
    domain: String,
    rate: f64,
    burst: u32,
    backoff_base: &str,
    backoff_max: &str,
    max_retries: u32,
) -> Result<ExitCode> {
    let backoff_base = parse_duration(backoff_base)
        .ok_or_else(|| anyhow::anyhow!("invalid --backoff-base"))?;
    let backoff_max =
        parse_duration(backoff_max).ok_or_else(|| anyhow::anyhow!("invalid --backoff-max"))?;

    let config = DomainRateConfig {
        domain,
        rate_per_sec: rate,
        burst,
        backoff_base,
        backoff_max,
        max_retries,
    };
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        return Ok(ExitCode::from(EXIT_INVALID_INPUT));
    }

    let upper = config.domain.to_uppercase().replace('.', "_");
    println!("# Apply before starting a scan:");
    println!("export DEEPER_DOMAIN_RATE_{upper}_RATE_LIMIT={}", config.rate_per_sec);
    println!("export DEEPER_DOMAIN_RATE_{upper}_BURST={}", config.burst);
    println!(
        "export DEEPER_DOMAIN_RATE_{upper}_BACKOFF_BASE={}ms",
        config.backoff_base.as_millis()
    );
    println!(
        "export DEEPER_DOMAIN_RATE_{upper}_BACKOFF_MAX={}ms",
        config.backoff_max.as_millis()
    );
    println!(
        "export DEEPER_DOMAIN_RATE_{upper}_MAX_RETRIES={}",
        config.max_retries
    );

    Ok(ExitCode::SUCCESS)
}
