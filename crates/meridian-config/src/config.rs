//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Visibility and per-session synchronization settings.
    pub sync: SyncSection,
    /// Region storage, persistence, and unloading settings.
    pub world: WorldSection,
    /// Main loop settings.
    pub server: ServerConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Visibility propagation and session scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSection {
    /// Radius of a session's anchor circle, in regions.
    pub view_distance: u32,
    /// Maximum number of bridge hops followed from the anchor circle.
    pub bridge_depth: u32,
    /// Extra squared range subtracted at every bridge hop.
    pub hop_penalty: u32,
    /// Number of sessions whose visibility is recomputed per tick.
    pub sessions_per_tick: u32,
    /// Highest number of compact ids a session may hold per category.
    pub compact_id_limit: u32,
}

/// Region storage and persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldSection {
    /// Directory regions are saved under.
    pub save_dir: PathBuf,
    /// Ticks a region must stay unobserved before it is unloaded.
    pub unload_grace_ticks: u32,
    /// Ticks between periodic saves of modified regions.
    pub save_interval_ticks: u32,
    /// Region loads allowed per tick.
    pub loads_per_tick: u32,
    /// Ticks a region stays unavailable after a failed load.
    pub load_retry_ticks: u32,
    /// Entity slots per region.
    pub max_entities_per_region: u32,
}

/// Main loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Ticks per second.
    pub tick_rate: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            view_distance: 2,
            bridge_depth: 2,
            hop_penalty: 1,
            sessions_per_tick: 8,
            compact_id_limit: 65_535,
        }
    }
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("saves"),
            unload_grace_ticks: 1200,
            save_interval_ticks: 300,
            loads_per_tick: 16,
            load_retry_ticks: 100,
            max_entities_per_region: 65_534,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { tick_rate: 20 }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Default directory holding `config.ron`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("meridian"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.tick_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "server.tick_rate",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sync.sessions_per_tick == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.sessions_per_tick",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sync.compact_id_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.compact_id_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.world.max_entities_per_region == 0 || self.world.max_entities_per_region > 0xfffe
        {
            return Err(ConfigError::Invalid {
                field: "world.max_entities_per_region",
                reason: format!(
                    "{} is outside 1..=65534",
                    self.world.max_entities_per_region
                ),
            });
        }
        Ok(())
    }
}
