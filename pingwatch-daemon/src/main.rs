//! `pingwatch-daemon`: thin process entrypoint over `pingwatch-core`.
//!
//! Owns everything `pingwatch-core` deliberately does not: CLI parsing,
//! config-file loading and reload, daemonization and the PID file, signal
//! flags, and driving `Engine::tick` in a loop until a termination signal
//! is observed (spec §6/§9).

mod cgi;
mod daemonize;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use pingwatch_core::timeseries::{FileTimeSeriesSink, TimeSeriesSink};
use pingwatch_core::{Config, Engine};
use std::path::PathBuf;

/// ICMP reachability monitor: periodically pings configured targets and
/// raises/clears alarms against loss and delay thresholds.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Opts {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "pingwatch.ron")]
    config: PathBuf,

    /// Parse the configuration and exit (0 if clean, 1 otherwise).
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,

    /// Enable debug-level logging.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Generate a time-series CGI script into this directory and exit.
    #[arg(short = 'g', long = "generate-cgi", value_name = "DIR")]
    generate_cgi: Option<PathBuf>,

    /// HTTP location paired with `-g`.
    #[arg(short = 'l', long = "location", default_value = "/pingwatch")]
    location: String,
}

fn main() {
    let opts = Opts::parse();
    let level = if opts.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).init();

    if let Err(e) = run(opts) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> Result<()> {
    let config_path = opts.config.to_string_lossy().to_string();
    let config = Config::from_filepath(&config_path)
        .with_context(|| format!("loading configuration from {:?}", config_path))?;

    if opts.test {
        println!("configuration OK: {} target(s)", config.targets.len());
        return Ok(());
    }

    if let Some(dir) = &opts.generate_cgi {
        cgi::generate(dir, &opts.location, &config)
            .with_context(|| format!("generating CGI script into {:?}", dir))?;
        return Ok(());
    }

    let pid_file = config.pid_file.clone();
    if opts.foreground {
        daemonize::write_pid_file(&pid_file, std::process::id())?;
    } else {
        daemonize::daemonize(&pid_file)?;
    }

    let result = run_engine(config, &config_path);
    if let Err(e) = daemonize::truncate_pid_file(&pid_file) {
        log::warn!("{:#}", e);
    }
    result
}

fn run_engine(config: Config, config_path: &str) -> Result<()> {
    // The ICMP echo identifier is 16 bits; truncating the PID demultiplexes
    // our own replies from another process's on a shared host (spec §4.2).
    let ident = (std::process::id() & 0xffff) as u16;

    let sink: Option<Box<dyn TimeSeriesSink>> = config
        .timeseries_file
        .clone()
        .map(|path| Box::new(FileTimeSeriesSink::new(path)) as Box<dyn TimeSeriesSink>);

    let mut engine = Engine::new(config, ident, sink)
        .map_err(|e| anyhow::anyhow!("startup failed: {}", e))?;
    log::info!("pingwatch-daemon started, monitoring {} target(s)", engine.target_count());

    let mut signals = signals::SignalFlags::new().context("installing signal handlers")?;

    loop {
        let observed = signals.poll();

        if observed.reload {
            log::info!("SIGHUP received, reloading configuration");
            match Config::from_filepath(config_path) {
                Ok(new_config) => engine.reload(new_config),
                Err(e) => log::warn!("reload failed, keeping previous configuration: {:#}", e),
            }
        }
        if observed.status {
            engine.request_status_dump();
        }
        if let Some(signum) = observed.shutdown {
            log::info!("received signal {}, shutting down", signum);
            break;
        }

        if let Err(e) = engine.tick() {
            log::warn!("main loop iteration failed: {}", e);
        }
    }

    engine.drain_on_shutdown();
    Ok(())
}
