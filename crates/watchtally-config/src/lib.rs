pub mod config;
pub mod paths;

pub use config::{ConfigError, InfluxSettings, Settings, SyncSettings, TraktSettings};
pub use paths::{container_base_path, PathManager};
