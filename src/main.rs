pub mod models {
    pub mod dropbox;
}

pub mod aggregate;
pub mod cli;
pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod env_file;
pub mod filter;
pub mod report;
pub mod schema;
pub mod snapshot;
pub mod services {
    pub mod generate;
}

use crate::cli::{Cli, Command, DashboardArgs, GenerateArgs};
use crate::client::DropboxClient;
use crate::config::Config;
use crate::services::generate::{self, GenerateOptions};
use crate::snapshot::{LoadOutcome, SnapshotCache};
use chrono::Utc;
use log::{error, info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    exported: usize,
}

fn run_dashboard(args: &DashboardArgs) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env().map_err(|e| e.to_string())?;
    info!(
        "Config loaded (dropbox_path={}, cache_dir={}, http_timeout={}s)",
        cfg.dropbox_path,
        cfg.cache_dir.display(),
        cfg.http_timeout.as_secs()
    );

    // 2) Init Dropbox client (token fetched on first request)
    let client = DropboxClient::new(
        &cfg.dropbox_app_key,
        &cfg.dropbox_app_secret,
        &cfg.dropbox_refresh_token,
        cfg.http_timeout,
    );

    // 3) Snapshot cache
    let mut cache = SnapshotCache::new(client, cfg.dropbox_path.clone(), cfg.cache_file(), cfg.revision_file());

    // 4) Render once, or on a steady cadence
    let Some(interval) = args.watch else {
        return render(&mut cache, args);
    };

    info!("Starting watch loop: interval={}s", interval.as_secs());
    loop {
        let tick_start = Instant::now();

        cache.invalidate();
        match render(&mut cache, args) {
            Ok(()) => {
                if let Some(LoadOutcome::Downloaded { revision, bytes }) = cache.last_outcome() {
                    info!("Picked up snapshot revision {} ({} bytes)", revision, bytes);
                }
            }
            Err(e) => warn!("Refresh failed; retrying next tick: {}", e),
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

fn render(cache: &mut SnapshotCache<DropboxClient>, args: &DashboardArgs) -> Result<(), String> {
    let rows = cache.load_readings().map_err(|e| e.to_string())?;
    let selection = args.selection(rows)?;
    let dashboard = report::build(rows, &selection, args.month);

    if args.json {
        println!("{}", report::to_json(&dashboard)?);
    } else {
        println!("{}", report::to_text(&dashboard)?);
    }
    Ok(())
}

fn run_generate(args: &GenerateArgs) -> Result<(), String> {
    let opts = GenerateOptions {
        out: args.out.clone(),
        days: args.days,
        sensors: args.sensors,
        seed: args.seed,
        end: Utc::now().naive_utc(),
    };
    let rows = generate::run(&opts)?;
    info!("Wrote {} hourly reading(s) to {}", rows, opts.out.display());
    Ok(())
}

fn load_env(cli: &Cli) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = &cli.env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        let exported = env_file::load(path)?;
        return Ok(Some(LoadedEnvFile {
            path: path.clone(),
            explicit: true,
            exported,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    let exported = env_file::load(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
        exported,
    }))
}

fn main() {
    let cli = match cli::parse(std::env::args_os().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}\n{}", err, cli::usage());
            std::process::exit(2);
        }
    };
    let loaded_env = match load_env(&cli) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) set)",
            origin,
            info.path.display(),
            info.exported
        );
    }

    info!(
        "aqi-dashboard {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    let result = match &cli.command {
        Command::Dashboard(args) => run_dashboard(args),
        Command::Generate(args) => run_generate(args),
    };
    if let Err(e) = result {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
