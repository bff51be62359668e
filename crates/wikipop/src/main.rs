use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::NaiveDateTime;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use wikipop_core::config::{WikipopConfig, load_config};
use wikipop_core::refresh_set::build_refresh_set;
use wikipop_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use wikipop_core::session::{CacheStatus, UpdateFlags, UpdateReport, cache_status, run_update};
use wikipop_core::store::CacheStore;
use wikipop_core::timestamp::{now_utc, parse_cache_timestamp};

#[derive(Debug, Parser)]
#[command(
    name = "wikipop",
    version,
    about = "Daily staleness-driven refresh of cached wiki page popularity"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Log verbosity (-v info, -vv debug, -vvv trace)")]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .wikipop/, a config template and the empty cache schema")]
    Init(InitArgs),
    #[command(about = "Refresh stale popularity rows if a run is due today")]
    Update(UpdateArgs),
    #[command(about = "Summarize cache freshness")]
    Status(StatusArgs),
    #[command(about = "List pages that the next refresh would request")]
    Stale(StaleArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .wikipop/config.toml")]
    no_config: bool,
    #[arg(long, help = "Skip creating the cache schema")]
    no_schema: bool,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long, help = "Ignore the time-of-day policy and the daily staleness gate")]
    force: bool,
    #[arg(long, help = "Compute the refresh set without fetching or writing")]
    dry_run: bool,
    #[arg(long, value_name = "CODE", help = "Language code sent to the statistics service")]
    lang: Option<String>,
    #[arg(long, value_name = "NAME", help = "Cache table to refresh")]
    table: Option<String>,
    #[arg(long, value_name = "YYYYMMDDHHMMSS", help = "Evaluate as if it were this UTC time")]
    now: Option<String>,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, value_name = "YYYYMMDDHHMMSS", help = "Evaluate as if it were this UTC time")]
    now: Option<String>,
    #[arg(long, help = "Print the status as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct StaleArgs {
    #[arg(long, value_name = "N", help = "Show at most N titles")]
    limit: Option<usize>,
    #[arg(long, value_name = "YYYYMMDDHHMMSS", help = "Evaluate as if it were this UTC time")]
    now: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Update(args)) => run_update_command(&runtime, args),
        Some(Commands::Status(args)) => run_status(&runtime, args),
        Some(Commands::Stale(args)) => run_stale(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wikipop={level},wikipop_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            create_schema: !args.no_schema,
            force: args.force,
        },
    )?;

    println!("Initialized wikipop runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("schema_ready: {}", report.schema_ready);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_update_command(runtime: &RuntimeOptions, args: UpdateArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let now = resolve_now(args.now.as_deref())?;
    let report = run_update(
        &paths.db_path,
        &config,
        &UpdateFlags {
            force: args.force,
            dry_run: args.dry_run,
            lang: args.lang,
            table: args.table,
        },
        &now,
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_update_report(&paths, &report);
    }
    print_diagnostics(runtime, &paths);

    if !report.success {
        bail!("popularity update failed for table `{}`", report.table);
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let now = resolve_now(args.now.as_deref())?;
    let runtime_status = inspect_runtime(&paths)?;
    let store = open_store(&paths, &config)?;
    let status = cache_status(&store, &now, config.min_run_hour()?)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("cache status");
        println!("db_path: {}", normalize_path(store.db_path()));
        println!(
            "db_size_bytes: {}",
            runtime_status
                .db_size_bytes
                .map(|size| size.to_string())
                .unwrap_or_else(|| "n/a".to_string())
        );
        print_cache_status(&status);
        if !runtime_status.warnings.is_empty() {
            println!("warnings:");
            for warning in &runtime_status.warnings {
                println!("  - {warning}");
            }
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_stale(runtime: &RuntimeOptions, args: StaleArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let now = resolve_now(args.now.as_deref())?;
    let store = open_store(&paths, &config)?;
    let refresh_set = build_refresh_set(&store, &now)?;

    println!("stale pages");
    println!("table: {}", store.tables().cache());
    println!("stale.count: {}", refresh_set.len());
    let limit = args.limit.unwrap_or(usize::MAX);
    if refresh_set.is_empty() {
        println!("stale: <none>");
    } else {
        for (title, page_id) in refresh_set.iter().take(limit) {
            println!("stale.page: {page_id}\t{title}");
        }
        if refresh_set.len() > limit {
            println!("stale.truncated: {}", refresh_set.len() - limit);
        }
    }
    for collision in refresh_set.collisions() {
        println!(
            "collision: {} (page {} replaced page {})",
            collision.title, collision.page_id, collision.replaced_page_id
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_update_report(paths: &ResolvedPaths, report: &UpdateReport) {
    println!("popularity update");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("table: {}", report.table);
    println!("lang: {}", report.lang);
    println!("evaluated_at: {}", report.evaluated_at);
    println!("status: {}", serde_label(&report.status));
    if let Some(reason) = report.skip_reason {
        println!("skip_reason: {}", reason.as_str());
    }
    println!("refresh_set: {}", report.refresh_set_size);
    println!("title_collisions: {}", report.title_collisions);
    println!("records_received: {}", report.records_received);
    println!("unmatched_records: {}", report.unmatched_records);
    println!("restamped_records: {}", report.restamped_records);
    println!("rows_updated: {}", report.rows_updated);
    println!("request_count: {}", report.request_count);
    println!("success: {}", format_flag(report.success));
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn print_cache_status(status: &CacheStatus) {
    println!("table: {}", status.table);
    println!("rows.total: {}", status.total_rows);
    println!("rows.never_refreshed: {}", status.never_refreshed);
    println!("rows.stale: {}", status.stale);
    println!("rows.fresh: {}", status.fresh);
    println!(
        "oldest_timestamp: {}",
        status.oldest_timestamp.as_deref().unwrap_or("<none>")
    );
    println!(
        "newest_timestamp: {}",
        status.newest_timestamp.as_deref().unwrap_or("<none>")
    );
    if status.by_tier.is_empty() {
        println!("tiers: <empty>");
    } else {
        for (tier, count) in &status.by_tier {
            println!("tier.{tier}: {count}");
        }
    }
    println!("gate: {}", status.gate.as_str());
    println!("past_minimum_hour: {}", format_flag(status.past_minimum_hour));
    println!("refresh_set: {}", status.refresh_set_size);
    println!("run_due: {}", format_flag(status.run_due()));
}

fn open_store(paths: &ResolvedPaths, config: &WikipopConfig) -> Result<CacheStore> {
    CacheStore::open(&paths.db_path, config.tables()?)
}

fn resolve_now(value: Option<&str>) -> Result<NaiveDateTime> {
    match value {
        Some(value) => parse_cache_timestamp(value),
        None => Ok(now_utc()),
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    debug!(
        project_root = %normalize_path(&paths.project_root),
        db_path = %normalize_path(&paths.db_path),
        "resolved runtime paths"
    );
    Ok(paths)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn serde_label<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| value.as_str().map(ToString::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
