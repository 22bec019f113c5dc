//! Command-line frontend for the extension shell.
//!
//! # Responsibility
//! - Reconcile manifests into a SQLite registry and inspect it.
//! - Print resolution plans and drive filesystem-backed loads.
//! - Keep output deterministic for scripting.

mod fs_fetcher;

use clap::{Parser, Subcommand};
use extshell_core::{
    default_log_level, init_logging, parse_manifest, resolve_order, EventBus, Loader,
    ManifestEntry, Registry, RemovalPolicy, ShellConfig,
};
use fs_fetcher::FsModuleFetcher;
use log::info;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "extshell", version, about = "Extension shell registry and loader")]
struct Cli {
    /// Directory for rolling log files; logging stays off when omitted
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    /// Log directive used with --log-dir, e.g. `info` or `info,loader=debug`
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// JSON shell configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the core library links
    Ping,
    /// Print the load order for a tag
    Resolve {
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,
        tag: String,
    },
    /// Reconcile a manifest into the registry database
    Sync {
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
        /// Delete entries missing from the manifest instead of marking them
        #[arg(long)]
        delete_removed: bool,
    },
    /// List registry entries
    List {
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Sync, then load tags whose unit files exist beside the manifest
    Load {
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(message) = run(cli).await {
        eprintln!("error: {message}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        // The logger only accepts absolute directories.
        let log_dir = std::env::current_dir()
            .map_err(|err| format!("cannot resolve current directory: {err}"))?
            .join(log_dir);
        init_logging(level, &log_dir.to_string_lossy())?;
    }
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Ping => {
            println!("extshell_core ping={}", extshell_core::ping());
            println!("extshell_core version={}", extshell_core::core_version());
            Ok(())
        }
        Command::Resolve { manifest, tag } => cmd_resolve(&manifest, &tag),
        Command::Sync {
            manifest,
            db,
            delete_removed,
        } => {
            let mut config = config;
            if delete_removed {
                config.registry.removal_policy = RemovalPolicy::Delete;
            }
            cmd_sync(&manifest, &db, &config)
        }
        Command::List { db, json } => cmd_list(&db, &config, json),
        Command::Load { manifest, db, tags } => cmd_load(&manifest, &db, &config, tags).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<ShellConfig, String> {
    let Some(path) = path else {
        return Ok(ShellConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot read config {}: {err}", path.display()))?;
    ShellConfig::from_json_str(&raw).map_err(|err| format!("{}: {err}", path.display()))
}

fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot read manifest {}: {err}", path.display()))?;
    parse_manifest(&raw).map_err(|err| format!("{}: {err}", path.display()))
}

fn open_registry(db: &Path, config: &ShellConfig) -> Registry {
    let registry = Registry::open_sqlite(
        db,
        config.registry.clone(),
        EventBus::new(config.event_capacity),
    );
    if !registry.is_persistent() {
        eprintln!(
            "warning: {} is unavailable, changes will not be saved",
            db.display()
        );
    }
    registry
}

fn cmd_resolve(manifest: &Path, tag: &str) -> Result<(), String> {
    let entries = read_manifest(manifest)?;
    let registry = Registry::in_memory(Default::default(), EventBus::default());
    registry.sync(&entries).map_err(|err| err.to_string())?;
    let order = resolve_order(&registry.snapshot(), tag).map_err(|err| err.to_string())?;
    for unit in order {
        println!("{unit}");
    }
    Ok(())
}

fn cmd_sync(manifest: &Path, db: &Path, config: &ShellConfig) -> Result<(), String> {
    let entries = read_manifest(manifest)?;
    let registry = open_registry(db, config);
    let report = registry.sync(&entries).map_err(|err| err.to_string())?;
    for tag in &report.added {
        println!("added {tag}");
    }
    for tag in &report.updated {
        println!("updated {tag}");
    }
    for tag in &report.removed {
        println!("removed {tag}");
    }
    println!(
        "added={} updated={} removed={} total={}",
        report.added.len(),
        report.updated.len(),
        report.removed.len(),
        registry.len()
    );
    Ok(())
}

fn cmd_list(db: &Path, config: &ShellConfig, json: bool) -> Result<(), String> {
    let registry = open_registry(db, config);
    let entries = registry.list();
    if json {
        let rows: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "descriptor": entry.descriptor,
                    "removed": entry.removed,
                })
            })
            .collect();
        let rendered = serde_json::to_string_pretty(&rows).map_err(|err| err.to_string())?;
        println!("{rendered}");
        return Ok(());
    }

    for entry in entries {
        let descriptor = &entry.descriptor;
        println!(
            "{}\t{}\tenabled={}\tinternal={}\tremoved={}\tdeps={}",
            descriptor.tag,
            descriptor.version,
            descriptor.enabled,
            descriptor.internal,
            entry.removed,
            descriptor.dependencies.join(",")
        );
    }
    Ok(())
}

async fn cmd_load(
    manifest: &Path,
    db: &Path,
    config: &ShellConfig,
    tags: Vec<String>,
) -> Result<(), String> {
    let entries = read_manifest(manifest)?;
    let registry = Arc::new(open_registry(db, config));
    registry.sync(&entries).map_err(|err| err.to_string())?;

    let fetcher = Arc::new(FsModuleFetcher::beside(manifest));
    let loader = Loader::new(Arc::clone(&registry), fetcher, &config.loader);
    let results = loader.load_all(tags).await;

    let mut failed = 0usize;
    for (tag, result) in &results {
        match result {
            Ok(outcome) => println!("loaded {tag} order={}", outcome.order.join(",")),
            Err(err) => {
                failed += 1;
                println!("failed {tag} code={} error={err}", err.code());
            }
        }
    }
    info!(
        "event=cli_load module=cli status={} total={} failed={failed}",
        if failed == 0 { "ok" } else { "partial" },
        results.len()
    );
    if failed > 0 {
        return Err(format!("{failed} of {} load(s) failed", results.len()));
    }
    Ok(())
}
