//! Meridian server entry point.
//!
//! Loads `config.ron`, applies CLI overrides, initializes logging and runs the
//! sync tick loop at a fixed rate over a filesystem region store.
//!
//! Run with: `cargo run -p meridian-server -- --ticks 200`

use std::time::{Duration, Instant};

use clap::Parser;
use meridian_config::{CliArgs, Config, default_config_dir};
use meridian_sync::{SyncConfig, SyncServer, Transport};
use meridian_world::{ContentRegistry, FsStore, RegionRegistry, RegistryConfig, SessionId};
use tracing::{info, warn};

/// Transport that drops payloads after counting them. Stands in until a
/// network front end is attached.
#[derive(Debug, Default)]
struct CountingTransport {
    records: u64,
    bytes: u64,
}

impl Transport for CountingTransport {
    fn send(&mut self, session: SessionId, payload: Vec<u8>) {
        self.records += 1;
        self.bytes += payload.len() as u64;
        tracing::trace!(?session, len = payload.len(), "record sent");
    }
}

fn registry_config(config: &Config) -> RegistryConfig {
    RegistryConfig {
        unload_grace_ticks: config.world.unload_grace_ticks,
        save_interval_ticks: config.world.save_interval_ticks,
        loads_per_tick: config.world.loads_per_tick,
        load_retry_ticks: u64::from(config.world.load_retry_ticks),
        max_entities_per_region: u16::try_from(config.world.max_entities_per_region)
            .unwrap_or(0xfffe),
    }
}

fn sync_config(config: &Config) -> SyncConfig {
    SyncConfig {
        view_distance: config.sync.view_distance,
        bridge_depth: config.sync.bridge_depth,
        hop_penalty: i64::from(config.sync.hop_penalty),
        sessions_per_tick: config.sync.sessions_per_tick as usize,
        compact_id_limit: config.sync.compact_id_limit,
    }
}

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}; using defaults", config_dir.display());
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);

    meridian_log::init_logging(
        Some(config_dir.join("logs").as_path()),
        cfg!(debug_assertions),
        Some(&config),
    );

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }

    info!(
        "Meridian server: {} ticks/s, view distance {}, saves in {}",
        config.server.tick_rate,
        config.sync.view_distance,
        config.world.save_dir.display()
    );

    let mut store = FsStore::new(config.world.save_dir.clone());
    let mut transport = CountingTransport::default();
    let registry = RegionRegistry::new(registry_config(&config));
    let mut server = SyncServer::new(sync_config(&config), registry, Box::new(ContentRegistry::new()));

    let period = Duration::from_secs_f64(1.0 / f64::from(config.server.tick_rate));
    let mut next = Instant::now();
    let mut ticks = 0u64;
    while args.ticks.is_none_or(|limit| ticks < limit) {
        let report = server.tick(&mut store, &mut transport);
        if report.maintenance.failed > 0 {
            warn!(tick = report.tick, failed = report.maintenance.failed, "region maintenance failures");
        }
        tracing::debug!(?report, "tick finished");
        ticks += 1;

        next += period;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else if now - next > period * 4 {
            warn!(behind_ms = (now - next).as_millis() as u64, "tick loop falling behind");
            next = now;
        }
    }

    let report = server.shutdown(&mut store);
    info!(
        ticks,
        saved = report.saved,
        failed = report.failed,
        records = transport.records,
        bytes = transport.bytes,
        "Meridian server stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_maps_onto_runtime_settings() {
        let mut config = Config::default();
        config.sync.hop_penalty = 3;
        config.world.max_entities_per_region = 10;
        config.world.load_retry_ticks = 7;

        let sync = sync_config(&config);
        assert_eq!(sync.hop_penalty, 3);
        assert_eq!(sync.view_distance, config.sync.view_distance);

        let registry = registry_config(&config);
        assert_eq!(registry.max_entities_per_region, 10);
        assert_eq!(registry.load_retry_ticks, 7);
    }

    #[test]
    fn test_counting_transport_tallies_payloads() {
        let mut transport = CountingTransport::default();
        transport.send(SessionId(1), vec![0; 5]);
        transport.send(SessionId(2), vec![0; 3]);
        assert_eq!(transport.records, 2);
        assert_eq!(transport.bytes, 8);
    }
}
