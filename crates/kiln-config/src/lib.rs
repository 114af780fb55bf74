//! KDL configuration parsing for the Kiln control plane.
//!
//! This crate handles parsing of the system configuration file (`kiln.kdl`):
//! server, store, database, booking, hatchery and reaper settings.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    BookingConfig, DatabaseConfig, HatcheryConfig, LogFormat, ReaperConfig, ServerConfig,
    StoreBackend, SystemConfig, load_system_config, parse_system_config,
};
