//! Gateway configuration: built-in defaults, an optional YAML file named by
//! `BACPROP_CONFIG`, then environment-variable overrides, in that order.

use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bacnet::BACNET_IP_PORT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {name}")]
    BadEnv { name: &'static str, value: String },
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub mqtt: MqttConfig,
    pub bacnet: BacnetConfig,
    /// Seconds without data before a sensor is marked faulted.
    pub fault_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BacnetConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Virtual network number the router advertises.
    pub network: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            bacnet: BacnetConfig::default(),
            fault_timeout_sec: 600,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
        }
    }
}

impl Default for BacnetConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".parse().expect("valid literal"),
            port: BACNET_IP_PORT,
            network: 1,
        }
    }
}

impl GatewayConfig {
    /// Resolve the effective configuration for this process.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("BACPROP_CONFIG") {
            Ok(path) => Self::load_from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: display.clone(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::ParseFile {
            path: display,
            source,
        })
    }

    /// Apply environment overrides through an injectable lookup.
    fn apply_overrides<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = get("MQTT_ADDR") {
            self.mqtt.broker_host = value;
        }
        if let Some(value) = get("MQTT_PORT") {
            self.mqtt.broker_port = parse_env("MQTT_PORT", &value)?;
        }
        if let Some(value) = get("BACNET_BIND_ADDR") {
            self.bacnet.bind_addr = parse_env("BACNET_BIND_ADDR", &value)?;
        }
        if let Some(value) = get("BACNET_NETWORK") {
            self.bacnet.network = parse_env("BACNET_NETWORK", &value)?;
        }
        if let Some(value) = get("FAULT_TIMEOUT_SEC") {
            self.fault_timeout_sec = parse_env("FAULT_TIMEOUT_SEC", &value)?;
        }
        Ok(())
    }

    pub fn fault_timeout(&self) -> Duration {
        Duration::from_secs(self.fault_timeout_sec)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadEnv {
        name,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = GatewayConfig::default();
        assert_eq!(config.mqtt.broker_host, "127.0.0.1");
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.bacnet.bind_addr, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(config.bacnet.port, 47808);
        assert_eq!(config.bacnet.network, 1);
        assert_eq!(config.fault_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn overrides_replace_only_named_values() {
        let vars: HashMap<&str, &str> = [
            ("MQTT_ADDR", "broker.lan"),
            ("FAULT_TIMEOUT_SEC", "30"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.mqtt.broker_host, "broker.lan");
        assert_eq!(config.fault_timeout_sec, 30);
        assert_eq!(config.mqtt.broker_port, 1883);
    }

    #[test]
    fn malformed_override_is_an_error() {
        let mut config = GatewayConfig::default();
        let error = config
            .apply_overrides(|name| {
                (name == "MQTT_PORT").then(|| "not-a-port".to_string())
            })
            .unwrap_err();
        assert!(matches!(error, ConfigError::BadEnv { name: "MQTT_PORT", .. }));
    }

    #[test]
    fn partial_yaml_keeps_defaults_elsewhere() {
        let config: GatewayConfig =
            serde_yaml::from_str("mqtt:\n  broker_host: 10.1.2.3\n").unwrap();
        assert_eq!(config.mqtt.broker_host, "10.1.2.3");
        assert_eq!(config.bacnet.network, 1);
        assert_eq!(config.fault_timeout_sec, 600);
    }
}
