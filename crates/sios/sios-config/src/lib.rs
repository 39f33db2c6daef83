pub mod config;

pub use config::{ClassConfig, Config, ConfigError, ModuleConfig, OscConfig, DEFAULT_CONFIG_PATH};
