use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, Utc};
use clap::{Parser, Subcommand, ValueHint};
use tracing::{error, warn};

use ynotv_epg::epg::{current_entry, entries_in_range};
use ynotv_epg::{init_logging, Channel, EpgConfig, EpgService, ProgressSnapshot, SqliteStore};

/// How far ahead `show` looks unless `--all` is given
const SHOW_WINDOW_HOURS: i64 = 12;

#[derive(Parser, Debug)]
#[command(version, about = "Fetch and inspect ynotv EPG data")]
struct Args {
    /// Path to a JSON config file. Missing fields take defaults.
    #[arg(short, long, env = "YNOTV_EPG_CONFIG", value_hint(ValueHint::FilePath))]
    config: Option<PathBuf>,

    /// Path to the database file.
    ///
    /// Defaults to `ynotv/epg.db` under the platform data directory.
    #[arg(long, env = "YNOTV_EPG_DB", value_hint(ValueHint::FilePath))]
    db_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the schedule for one channel
    Show {
        key: String,
        /// Print every cached programme, not just the next few hours
        #[arg(long)]
        all: bool,
    },
    /// Fetch schedules for several channels in the background
    Prefetch {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Set the custom XMLTV source, or clear it when no URL is given
    SetSource { url: Option<String> },
    /// Drop every cached schedule
    ClearCache,
    /// Print cache statistics and stored namespaces as JSON
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match EpgConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e:#}");
                return ExitCode::FAILURE;
            }
        },
        None => EpgConfig::default(),
    };
    init_logging(args.debug || config.debug_logging);

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, config: EpgConfig) -> Result<()> {
    let db_path = match args.db_path {
        Some(path) => path,
        None => SqliteStore::default_path()?,
    };
    let epg = EpgService::open(&config, &db_path)?;

    match args.command {
        Command::Show { key, all } => show(&epg, &key, all).await,
        Command::Prefetch { keys } => prefetch(&epg, keys).await,
        Command::SetSource { url } => {
            epg.set_custom_source(url.as_deref());
            match epg.custom_source() {
                Some(url) => println!("Custom source: {}", url),
                None => println!("Custom source cleared, using public mirrors"),
            }
        }
        Command::ClearCache => {
            epg.clear_cache();
            println!("EPG cache cleared");
        }
        Command::Stats => {
            let stats = serde_json::json!({
                "cache": epg.cache_stats(),
                "namespaces": epg.stored_namespaces(),
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    epg.shutdown().await;
    Ok(())
}

async fn show(epg: &EpgService, key: &str, all: bool) {
    let channel = Channel::new(key, key);
    let Some(entries) = epg.get_schedule(&channel).await else {
        println!("{} has no schedule source", key);
        return;
    };

    let now = Utc::now();
    let airing = current_entry(&entries, now);
    let shown: Vec<_> = if all {
        entries.iter().collect()
    } else {
        entries_in_range(&entries, now, now + chrono::Duration::hours(SHOW_WINDOW_HOURS))
    };

    for entry in shown {
        let marker = if airing == Some(entry) { "*" } else { " " };
        println!(
            "{} {} - {}  {}",
            marker,
            entry.start.with_timezone(&Local).format("%a %H:%M"),
            entry.end.with_timezone(&Local).format("%H:%M"),
            entry.title
        );
    }
}

/// Ctrl-C stops after the current batch, a second Ctrl-C stops waiting
async fn prefetch(epg: &EpgService, keys: Vec<String>) {
    let channels = keys.iter().map(|key| Channel::new(key.as_str(), key.as_str())).collect();
    let handle = epg.prefetch_all(channels, None);

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut interrupted = false;
    while !handle.is_finished() {
        tokio::select! {
            _ = ticker.tick() => print_progress(&epg.progress_snapshot()),
            signal = tokio::signal::ctrl_c() => {
                if interrupted || signal.is_err() {
                    warn!("Interrupted again, not waiting for the prefetch");
                    return;
                }
                interrupted = true;
                warn!("Interrupted, stopping after the current batch (press Ctrl-C again to quit)");
                handle.cancel();
            }
        }
    }

    let outcome = handle.wait().await;
    print_progress(&epg.progress_snapshot());
    println!("Prefetch finished: {:?}", outcome);
}

fn print_progress(snapshot: &ProgressSnapshot) {
    println!(
        "[{:>3.0}%] {}/{} {} (eta {})",
        snapshot.fraction_complete * 100.0,
        snapshot.processed,
        snapshot.total,
        snapshot.message,
        snapshot.eta
    );
}
