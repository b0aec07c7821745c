use anyhow::Result;
use simplelog::*;
use std::{
    fs,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::config::LogConfig;

static BACKEND_CHATTER: AtomicBool = AtomicBool::new(true);

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

pub fn init(cfg: &LogConfig) -> Result<()> {
    let level = level_filter(&cfg.level);
    BACKEND_CHATTER.store(cfg.backend_debug, Ordering::Relaxed);

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        simplelog::Config::default(),
        // stdout carries the JSON replies read by the front-end.
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];

    if let Some(path) = &cfg.file {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let file_cfg = ConfigBuilder::new()
            .set_target_level(LevelFilter::Off)
            .set_thread_level(LevelFilter::Off)
            .set_location_level(LevelFilter::Off)
            .build();
        loggers.push(WriteLogger::new(level, file_cfg, file));
    }

    CombinedLogger::init(loggers)?;
    Ok(())
}

/// Routine backend progress ("Server started.", "refresh not due").
///
/// Logged at info while backend debugging is on, otherwise at debug.
pub fn backend(msg: &str) {
    if BACKEND_CHATTER.load(Ordering::Relaxed) {
        log::info!("{msg}");
    } else {
        log::debug!("{msg}");
    }
}
