use crate::provider::service::Config as ProviderConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;

pub const fn default_listen_addr() -> &'static str {
    "127.0.0.1:5555"
}

pub const fn default_log_level() -> &'static str {
    "info"
}

fn listen_addr() -> String {
    default_listen_addr().to_string()
}

fn log_level() -> String {
    default_log_level().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "listen_addr")]
    pub listen_addr: String,
    #[serde(default = "log_level")]
    pub log_level: String,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: listen_addr(),
            log_level: log_level(),
            provider: ProviderConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file(path_to_file: String) -> Result<Config, String> {
        let file =
            File::open(path_to_file).map_err(|e| format!("Error reading config file: {:?}", e))?;
        let config: Config =
            serde_yaml::from_reader(file).map_err(|e| format!("Error parsing config file: {:?}", e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:5555");
        assert_eq!(config.log_level, "info");
        assert!(config.provider.upstreams.is_empty());
        assert_eq!(config.provider.slots_per_epoch_override, 32);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
listen_addr: "0.0.0.0:8000"
provider:
  namespace: testnet
  historical_distance: 5
  upstreams:
    - name: local
      url: "http://localhost:5052"
      data_provider: true
    - name: backup
      url: "http://backup:5052"
"#;

        let config: Config = serde_yaml::from_str(yaml).expect("should parse config");
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.provider.namespace, "testnet");
        assert_eq!(config.provider.historical_distance, 5);
        assert_eq!(config.provider.upstreams.len(), 2);
        assert!(config.provider.upstreams[0].data_provider);
        assert!(!config.provider.upstreams[1].data_provider);
    }
}
