//! # listmode_evb_cli
//!
//! Command line front end for the list-mode coincidence event builder.
//!
//! ```bash
//! listmode_evb_cli -s settings.json init   # write configuration templates
//! listmode_evb_cli -s settings.json time   # derive the time-offset table
//! listmode_evb_cli -s settings.json l1     # build coincidence events
//! listmode_evb_cli -s settings.json l2     # apply the selection rules
//! ```
//!
//! The stages expect to run in the working directory that holds (or will
//! hold) `timeSettings.json` and the `L1_<i>.dat` / `L2_<i>.dat` shards.
//! Ctrl-C stops the running stage at the next file, chunk or event boundary
//! and leaves partial shards behind; that is reported as success.

use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Instant;

use liblistmode_evb::cancel::CancelToken;
use liblistmode_evb::channel_settings::ChannelConfig;
use liblistmode_evb::config::Config;
use liblistmode_evb::l1_builder::L1Builder;
use liblistmode_evb::l2_filter::L2Filter;
use liblistmode_evb::l2_rules::RuleSet;
use liblistmode_evb::offset_table::OffsetTable;
use liblistmode_evb::time_aligner::{TimeAligner, TIME_SETTINGS_FILE};
use liblistmode_evb::worker_status::WorkerStatus;

const TEMPLATE_MODULES: usize = 11;
const TEMPLATE_CHANNELS: u32 = 32;

fn main() {
    let matches = Command::new("listmode_evb_cli")
        .about("Coincidence event builder for list-mode digitizer data")
        .arg_required_else_help(true)
        .arg(
            Arg::new("settings")
                .short('s')
                .long("settings")
                .default_value("settings.json")
                .help("Path to the settings file"),
        )
        .subcommand(Command::new("init").about("Write configuration templates"))
        .subcommand(Command::new("time").about("Derive the time-offset table"))
        .subcommand(Command::new("l1").about("Build L1 coincidence events"))
        .subcommand(Command::new("l2").about("Apply the L2 selection rules"))
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    let settings_path = PathBuf::from(
        matches
            .get_one::<String>("settings")
            .expect("settings has a default"),
    );

    let start = Instant::now();
    let exit_code = match matches.subcommand() {
        Some(("init", _)) => run_init(&settings_path),
        Some(("time", _)) => run_time(&settings_path, &progress),
        Some(("l1", _)) => run_l1(&settings_path, &progress),
        Some(("l2", _)) => run_l2(&settings_path, &progress),
        _ => {
            log::error!("No run mode given; use one of init, time, l1, l2");
            1
        }
    };
    if exit_code == 0 {
        log::info!("Time taken: {} seconds", start.elapsed().as_secs());
    }
    std::process::exit(exit_code);
}

fn run_init(settings_path: &Path) -> i32 {
    log::info!(
        "Writing configuration template to {}...",
        settings_path.display()
    );
    if let Err(e) = Config::write_template(settings_path) {
        log::error!("{e}");
        return 1;
    }
    let channel_path = Config::default().channel_settings_path;
    log::info!(
        "Writing channel settings template to {}...",
        channel_path.display()
    );
    let channels_per_module = vec![TEMPLATE_CHANNELS; TEMPLATE_MODULES];
    if let Err(e) = ChannelConfig::write_template(&channel_path, &channels_per_module) {
        log::error!("{e}");
        return 1;
    }
    log::info!("Initialization completed");
    0
}

fn run_time(settings_path: &Path, progress: &MultiProgress) -> i32 {
    let Some((config, channels, files)) = load_inputs(settings_path) else {
        return 1;
    };
    let n_threads = match config.resolve_threads(files.len()) {
        Ok(n) => n,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };

    let cancel = CancelToken::new();
    install_sigint(&cancel);
    let aligner = TimeAligner::new(channels, files, config.time_window, cancel);

    let (tx, rx) = mpsc::channel();
    let result = std::thread::scope(|scope| {
        let handle = scope.spawn(move || aligner.run(n_threads, tx));
        render_progress(progress, rx, n_threads);
        handle.join()
    });
    match result {
        Ok(Ok(_)) => {
            log::info!("Time alignment information generated");
            0
        }
        Ok(Err(e)) => {
            log::error!("Time alignment failed: {e}");
            1
        }
        Err(_) => {
            log::error!("The time alignment stage panicked");
            1
        }
    }
}

fn run_l1(settings_path: &Path, progress: &MultiProgress) -> i32 {
    let Some((config, channels, files)) = load_inputs(settings_path) else {
        return 1;
    };
    let offsets = match OffsetTable::load(Path::new(TIME_SETTINGS_FILE)) {
        Ok(table) => table,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };
    let n_threads = match config.resolve_threads(files.len()) {
        Ok(n) => n,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };

    let cancel = CancelToken::new();
    install_sigint(&cancel);
    let builder = L1Builder::new(
        channels,
        offsets,
        config.time_reference_mod,
        config.time_reference_ch,
        config.coincidence_window,
        files,
        cancel,
    );

    let (tx, rx) = mpsc::channel();
    let result = std::thread::scope(|scope| {
        let handle = scope.spawn(move || builder.run(n_threads, tx));
        render_progress(progress, rx, n_threads);
        handle.join()
    });
    match result {
        Ok(Ok(())) => {
            log::info!("L1 trigger event files generated");
            0
        }
        Ok(Err(e)) => {
            log::error!("L1 event building failed: {e}");
            1
        }
        Err(_) => {
            log::error!("The L1 stage panicked");
            1
        }
    }
}

fn run_l2(settings_path: &Path, progress: &MultiProgress) -> i32 {
    let config = match Config::read_config_file(settings_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };
    let channels = match ChannelConfig::load(&config.channel_settings_path) {
        Ok(channels) => channels,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };
    let rules = match RuleSet::load(&config.l2_settings_path, &channels) {
        Ok(rules) => rules,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };

    // One worker per L1 shard.
    let n_workers = L2Filter::discover_shards(Path::new(".")).len();

    let cancel = CancelToken::new();
    install_sigint(&cancel);
    let filter = L2Filter::new(rules, cancel);

    let (tx, rx) = mpsc::channel();
    let result = std::thread::scope(|scope| {
        let handle = scope.spawn(move || filter.run(tx));
        render_progress(progress, rx, n_workers);
        handle.join()
    });
    match result {
        Ok(Ok(())) => {
            log::info!("L2 trigger event files generated");
            0
        }
        Ok(Err(e)) => {
            log::error!("L2 filtering failed: {e}");
            1
        }
        Err(_) => {
            log::error!("The L2 stage panicked");
            1
        }
    }
}

/// Load the settings, the channel configuration and the input file list
/// shared by the time and l1 stages. Errors are logged and yield `None`.
fn load_inputs(settings_path: &Path) -> Option<(Config, ChannelConfig, Vec<PathBuf>)> {
    log::info!("Loading config from {}...", settings_path.display());
    let config = match Config::read_config_file(settings_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return None;
        }
    };
    log::info!("Directory: {}", config.directory.display());
    log::info!(
        "Run {}, versions {}..={}",
        config.run_number,
        config.start_version,
        config.end_version
    );

    let channels = match ChannelConfig::load(&config.channel_settings_path) {
        Ok(channels) => channels,
        Err(e) => {
            log::error!("{e}");
            return None;
        }
    };
    let files = match config.find_run_files() {
        Ok(files) => files,
        Err(e) => {
            log::error!("{e}");
            return None;
        }
    };
    log::info!("Total files: {}", files.len());
    Some((config, channels, files))
}

fn install_sigint(cancel: &CancelToken) {
    let token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Received Ctrl-C! Stopping workers gracefully...");
        token.cancel();
    }) {
        log::warn!("Could not install the Ctrl-C handler: {e}");
    }
}

/// Drive one progress bar per worker until every sender is gone.
fn render_progress(progress: &MultiProgress, rx: Receiver<WorkerStatus>, n_workers: usize) {
    let bars: Vec<ProgressBar> = (0..n_workers)
        .map(|_| progress.add(ProgressBar::new(100)))
        .collect();
    while let Ok(status) = rx.recv() {
        if let Some(bar) = bars.get(status.worker_id) {
            bar.set_position((status.progress * 100.0) as u64);
        }
    }
    for bar in &bars {
        bar.finish();
    }
}
