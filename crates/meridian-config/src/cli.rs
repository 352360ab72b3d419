//! Command-line argument parsing for the Meridian server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Meridian server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "meridian", about = "Meridian region sync server")]
pub struct CliArgs {
    /// View distance in regions.
    #[arg(long)]
    pub view_distance: Option<u32>,

    /// Sessions whose visibility is recomputed per tick.
    #[arg(long)]
    pub sessions_per_tick: Option<u32>,

    /// Directory regions are saved under.
    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    /// Ticks per second.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Stop after this many ticks instead of running forever.
    #[arg(long)]
    pub ticks: Option<u64>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(distance) = args.view_distance {
            self.sync.view_distance = distance;
        }
        if let Some(budget) = args.sessions_per_tick {
            self.sync.sessions_per_tick = budget;
        }
        if let Some(ref dir) = args.save_dir {
            self.world.save_dir = dir.clone();
        }
        if let Some(rate) = args.tick_rate {
            self.server.tick_rate = rate;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            view_distance: Some(4),
            save_dir: Some(PathBuf::from("/tmp/regions")),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.sync.view_distance, 4);
        assert_eq!(config.world.save_dir, PathBuf::from("/tmp/regions"));
        // Non-overridden fields retain defaults
        assert_eq!(config.sync.sessions_per_tick, 8);
        assert_eq!(config.server.tick_rate, 20);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "meridian",
            "--tick-rate",
            "30",
            "--ticks",
            "10",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.tick_rate, Some(30));
        assert_eq!(args.ticks, Some(10));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
