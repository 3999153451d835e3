//! PlanRunner CLI Entry Point
//!
//! Runs a plan file to completion with the built-in steps.
//!
//! # Usage
//!
//! ```bash
//! # Execute a plan
//! planrunner release.yaml
//!
//! # Four workers, loopback tasks finishing after 200 ms
//! planrunner release.yaml --workers 4 --delay-ms 200
//!
//! # Engine settings from a file, with an override
//! planrunner release.yaml --config engine.yaml --set default_wait_timeout_secs=60
//!
//! # A restraint for ResourceConstraint steps, and a snapshot afterwards
//! planrunner release.yaml --restraint deploy=1 --snapshot state.json
//! ```

use std::collections::BTreeMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};

use planrunner::dispatch::LoopbackDispatcher;
use planrunner::monitoring::ExecutionTimeline;
use planrunner::restraint::{ResourceRestraintService, RestraintReleaser};
use planrunner::steps::{builtin_registry, with_restraints};
use planrunner::waiting::WaitNotifyService;
use planrunner::{load_plan, EngineConfig, MemoryStore, NodeExecution, OrchestrationEngine, Status};
use planrunner::{APP_NAME, VERSION};

/// Default loopback task duration.
const DEFAULT_DELAY_MS: u64 = 100;

/// How long to wait for the plan before giving up.
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Args {
    plan_path: Option<String>,
    config_path: Option<String>,
    workers: Option<usize>,
    overrides: Vec<String>,
    setup: BTreeMap<String, String>,
    restraints: Vec<(String, u32)>,
    delay_ms: Option<u64>,
    timeout_secs: Option<u64>,
    snapshot: Option<String>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: planrunner [OPTIONS] <PLAN_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAN_FILE>           Path to plan YAML file");
    println!();
    println!("Options:");
    println!("  --workers N           Worker threads (default: CPU count)");
    println!("  --config PATH         Engine config YAML");
    println!("  --set KEY=VALUE       Override an engine config key");
    println!("  --setup KEY=VALUE     Add a setup abstraction");
    println!("  --restraint NAME=CAP  Register a resource restraint");
    println!("  --delay-ms N          Loopback task duration (default: {})", DEFAULT_DELAY_MS);
    println!("  --timeout SECS        Give up waiting after SECS (default: {})", DEFAULT_TIMEOUT_SECS);
    println!("  --snapshot PATH       Save the execution store when done");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  planrunner release.yaml");
    println!("  planrunner release.yaml --workers 8 --set watch_interval_ms=100");
    println!("  planrunner release.yaml --restraint deploy=1 --snapshot state.json");
}

fn key_value(arg: &str, flag: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("{} expects KEY=VALUE, got '{}'", flag, arg))
}

/// Parses command-line arguments.
fn parse_arguments(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        let mut value = |name: &str| -> Result<String, String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{} requires an argument", name))
        };

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => parsed.verbose = true,
            "--workers" => {
                let v = value("--workers")?;
                parsed.workers = Some(v.parse().map_err(|_| format!("Invalid worker count: {}", v))?);
            }
            "--config" => parsed.config_path = Some(value("--config")?),
            "--set" => parsed.overrides.push(value("--set")?),
            "--setup" => {
                let (k, v) = key_value(&value("--setup")?, "--setup")?;
                parsed.setup.insert(k, v);
            }
            "--restraint" => {
                let (name, capacity) = key_value(&value("--restraint")?, "--restraint")?;
                let capacity = capacity
                    .parse()
                    .map_err(|_| format!("Invalid capacity for '{}': {}", name, capacity))?;
                parsed.restraints.push((name, capacity));
            }
            "--delay-ms" => {
                let v = value("--delay-ms")?;
                parsed.delay_ms = Some(v.parse().map_err(|_| format!("Invalid delay: {}", v))?);
            }
            "--timeout" => {
                let v = value("--timeout")?;
                parsed.timeout_secs = Some(v.parse().map_err(|_| format!("Invalid timeout: {}", v))?);
            }
            "--snapshot" => parsed.snapshot = Some(value("--snapshot")?),
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if parsed.plan_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                parsed.plan_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(parsed)
}

fn load_config(args: &Args) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    for assignment in &args.overrides {
        config.apply_override(assignment)?;
    }
    Ok(config)
}

fn colored_status(status: Status) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        Status::Succeeded => label.green(),
        Status::Skipped => label.cyan(),
        Status::Failed | Status::Expired => label.red(),
        Status::Aborted => label.yellow(),
        _ => label.normal(),
    }
}

fn print_nodes(nodes: &[NodeExecution]) {
    println!();
    println!("{}", "Nodes:".bold());
    for node in nodes {
        let depth = node.ambiance.depth().saturating_sub(1);
        let attempt = if node.old_retry { " (superseded)" } else { "" };
        println!(
            "  {}{:<24} {:<12} {}{}",
            "  ".repeat(depth),
            node.identifier,
            node.step_type,
            colored_status(node.status),
            attempt
        );
        if let Some(failure) = &node.failure_info {
            println!("  {}  {}", "  ".repeat(depth), failure.message.dimmed());
        }
    }
}

/// Main application entry point.
fn run() -> Result<Status, Box<dyn std::error::Error>> {
    let argv: Vec<String> = env::args().collect();

    // Parse arguments
    let args = parse_arguments(&argv).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(args.verbose);

    // Print banner
    print_banner();

    let plan_path = args.plan_path.clone().ok_or("No plan file given")?;
    let config = load_config(&args)?;

    // Load plan
    info!("Loading plan: {}", plan_path);
    let plan = load_plan(&plan_path).map_err(|e| {
        error!("Failed to load plan: {}", e);
        format!("Could not load plan from '{}': {}", plan_path, e)
    })?;
    info!("Plan '{}' loaded: {} nodes", plan.id, plan.len());

    // Wire collaborators
    let notify = Arc::new(WaitNotifyService::with_ttl(config.response_ttl()));
    let restraints = Arc::new(ResourceRestraintService::new());
    for (name, capacity) in &args.restraints {
        restraints.register_restraint(name.clone(), *capacity)?;
    }
    let registry = with_restraints(builtin_registry(), Arc::clone(&restraints), Arc::clone(&notify));

    let store = Arc::new(MemoryStore::new());
    let timeline = Arc::new(ExecutionTimeline::new());
    let delay = Duration::from_millis(args.delay_ms.unwrap_or(DEFAULT_DELAY_MS));

    let engine = OrchestrationEngine::builder()
        .config(config)
        .store(store.clone())
        .registry(registry)
        .notify(Arc::clone(&notify))
        .dispatcher(Arc::new(LoopbackDispatcher::new(Arc::clone(&notify), delay)))
        .observer(timeline.clone())
        .observer(Arc::new(RestraintReleaser::new(restraints)))
        .build()?;

    // Execute plan
    let execution = engine.start_execution(plan, args.setup.clone())?;
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let finished = engine.wait_for_plan(&execution.id, timeout)?;
    if !finished.status.is_terminal() {
        warn!("Plan still {} after {:?}", finished.status, timeout);
    }

    print_nodes(&engine.node_executions(&execution.id)?);
    println!("{}", timeline.gantt_chart());
    println!("Plan {}: {}", execution.id, colored_status(finished.status).bold());

    engine.shutdown();

    if let Some(path) = &args.snapshot {
        store.save_snapshot(path)?;
    }

    if engine.invariant_violations() > 0 {
        warn!("{} engine invariant violation(s) detected", engine.invariant_violations());
    }

    Ok(finished.status)
}

fn main() -> ExitCode {
    match run() {
        Ok(Status::Succeeded) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
