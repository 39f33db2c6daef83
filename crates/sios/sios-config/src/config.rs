use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sios.config";

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub strict_versioning: bool,
    #[serde(default)]
    pub dump_module_xml: bool,
    #[serde(default)]
    pub xml_dump_path: Option<String>,
    #[serde(default = "defaults::xml_module_prefix")]
    pub xml_module_prefix: String,
    #[serde(default)]
    pub use_syslog: bool,
    #[serde(default)]
    pub osc: OscConfig,
    #[serde(default, rename = "class")]
    pub classes: Vec<ClassConfig>,
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Deserialize, Debug)]
pub struct OscConfig {
    #[serde(default = "defaults::osc_port")]
    pub osc_port: u16,
    #[serde(default = "defaults::osc_root")]
    pub osc_root: String,
    #[serde(default = "defaults::osc_udp")]
    pub osc_udp: bool,
    #[serde(default)]
    pub osc_tcp: bool,
}

#[derive(Deserialize, Debug)]
pub struct ClassConfig {
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct ModuleConfig {
    pub module_path: String,
    pub module_class: String,
    #[serde(default)]
    pub module_description: String,
    #[serde(default)]
    pub module_is_lazy: bool,
    /// Trigger id for lazy modules; ignored for eager ones.
    #[serde(default)]
    pub lazy_id: Option<String>,
    /// Raw string values handed to the module's parameter setters in
    /// declaration order.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn xml_module_prefix() -> String {
        "sios".into()
    }

    pub fn osc_port() -> u16 {
        7770
    }

    pub fn osc_root() -> String {
        "/sios".into()
    }

    pub fn osc_udp() -> bool {
        true
    }
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            osc_port: defaults::osc_port(),
            osc_root: defaults::osc_root(),
            osc_udp: defaults::osc_udp(),
            osc_tcp: false,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(!config.strict_versioning);
        assert_eq!(config.osc.osc_port, 7770);
        assert_eq!(config.osc.osc_root, "/sios");
        assert!(config.osc.osc_udp);
        assert!(!config.osc.osc_tcp);
        assert!(config.classes.is_empty());
        assert!(config.modules.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            strict_versioning = true
            dump_module_xml = true
            xml_dump_path = "/tmp/sios"

            [osc]
            osc_port = 9000
            osc_root = "/lab"
            osc_tcp = true

            [[class]]
            name = "sensors"

            [[class]]
            name = "actuators"

            [[module]]
            module_path = "/usr/lib/sios/light.so"
            module_class = "actuators"
            module_description = "rgb lights"
            [module.params]
            devices = "2"
            auto_blink = "1"

            [[module]]
            module_path = "/usr/lib/sios/matrix.so"
            module_class = "sensors"
            module_is_lazy = true
            lazy_id = "matrix"
            "#,
        )
        .unwrap();

        assert!(config.strict_versioning);
        assert_eq!(config.osc.osc_port, 9000);
        assert_eq!(config.classes.len(), 2);
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.modules[0].params["devices"], "2");
        assert!(config.modules[1].module_is_lazy);
        assert_eq!(config.modules[1].lazy_id.as_deref(), Some("matrix"));
    }
}
