mod alerts;
mod cli;
mod config;
mod database;
mod drives;
mod error;
mod files;
mod hasher;
mod orchestrator;
mod progress;
mod scanner;
mod schema;
mod search;
mod settings;
mod thumb_cache;
mod thumbnails;
mod utils;
mod volumes;
mod watcher;

use std::time::Instant;

use chrono::Local;
use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, Naming};
use log::{error, info};

fn main() {
    let project_dirs =
        ProjectDirs::from("", "", "drivecat").expect("Could not determine project directories");

    let config = match Config::load(&project_dirs) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };
    CONFIG.set(config).expect("Config already set!");

    setup_logging(&project_dirs);

    // Mark the start time and log a timestamped message
    let start = Instant::now();
    let now = Local::now();
    info!("drivecat starting at {}", now.format("%Y-%m-%d %H:%M:%S"));
    cli::log_startup(config::get());

    let result = Cli::handle_command_line(&project_dirs);

    let duration = start.elapsed();

    match result {
        Ok(()) => {
            info!("drivecat completed successfully in {duration:.2?}");
        }
        Err(err) => {
            error!("drivecat exited with error in {duration:.2?}");
            error!("{err:?}");
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

pub fn setup_logging(project_dirs: &ProjectDirs) {
    let config = CONFIG.get().expect("Config not initialized");
    let log_spec = format!("drivecat={}", config.logging.level);

    let log_dir = Config::data_dir(project_dirs).join("logs");

    Logger::try_with_str(log_spec)
        .unwrap()
        .log_to_file(FileSpec::default().directory(log_dir))
        .rotate(
            Criterion::Size(10_000_000),
            Naming::TimestampsDirect,
            Cleanup::KeepLogFiles(20),
        )
        .start()
        .unwrap();
}
