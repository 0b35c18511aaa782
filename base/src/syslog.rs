// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide logging setup, initialized once from the CLI's verbosity
//! flags. Mirrors the shape of crosvm's `base::syslog::LogConfig` /
//! `base::syslog::init_with` without the syslog/eventlog backends this
//! daemon has no use for: everything goes to stderr via `env_logger`.

use log::LevelFilter;
use once_cell::sync::OnceCell;

static INITIALIZED: OnceCell<()> = OnceCell::new();

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub filter: LevelFilter,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: LevelFilter::Info,
        }
    }
}

/// Initializes the global logger. Safe to call more than once; only the
/// first call takes effect.
pub fn init(config: LogConfig) {
    INITIALIZED.get_or_init(|| {
        env_logger::Builder::new()
            .filter_level(config.filter)
            .format_timestamp_millis()
            .init();
    });
}

/// Derives a `LevelFilter` from a verbosity count (`-v` repeated) and a
/// quiet count (`-q` repeated), the way the CLI entry point calls this.
pub fn level_from_verbosity(verbose: u8, quiet: u8) -> LevelFilter {
    let base = LevelFilter::Info as i8;
    let level = base + verbose as i8 - quiet as i8;
    match level {
        i8::MIN..=0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_filter() {
        assert_eq!(level_from_verbosity(0, 0), LevelFilter::Info);
        assert_eq!(level_from_verbosity(2, 0), LevelFilter::Trace);
        assert_eq!(level_from_verbosity(0, 2), LevelFilter::Error);
    }
}
