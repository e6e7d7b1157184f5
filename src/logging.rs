//! Structured logging setup: a `tracing` registry with a level filter and a
//! selectable driver (`stdout` or `journald`).

use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*};

use crate::config::LogDriver;

pub fn init(log_level: &str, driver: LogDriver) -> Result<()> {
    let level = LevelFilter::from_str(log_level).context("parse log level")?;
    let registry = tracing_subscriber::registry();

    let stdout = if driver == LogDriver::Stdout {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_filter(level)
            .into()
    } else {
        None
    };

    let journald = if driver == LogDriver::Journald {
        tracing_journald::layer()
            .context("connect to journald")?
            .with_filter(level)
            .into()
    } else {
        None
    };

    registry.with(stdout).with(journald).try_init().context("init tracing registry")?;
    info!(log_level, driver = ?driver, "logging initialized");
    Ok(())
}
