//! Logging setup.
//!
//! The engine logs one line per abort (URL + reason), one line per retry
//! (URL + try-count), and one line per completed segment/piece through the
//! `log` facade; this module just wires up the backend from the CLI's
//! `--log-level` flag.

use std::str::FromStr;

pub fn init(level: &str) {
    let level = log::LevelFilter::from_str(level).unwrap_or(log::LevelFilter::Info);
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}
