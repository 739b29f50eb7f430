//! Typed configuration loaded from the environment, optionally preloaded
//! from a `.env` file via `dotenvy`.
//!
//! Grounded in `original_source/tools/bms_disconnect.py`'s `load_dotenv`
//! use and `original_source/bms-monitor/app/config.py`'s env-var surface.
//! This is the one place in the system where an error is fatal: there is
//! no sensible degraded mode for "we don't know what device to read."

use std::time::Duration;

use crate::error::ConfigError;
use crate::model::RegisterMap;

#[derive(Debug, Clone)]
pub struct Config {
    pub bms_mac_address: String,
    pub poll_interval: Duration,
    pub registers: RegisterMap,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub mqtt_broker_url: Option<String>,
    pub mqtt_client_id: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub disconnect_helper_path: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let bms_mac_address = required("BMS_MAC_ADDRESS")?;

        let poll_interval = optional_u64("BMS_READ_INTERVAL", 30)?;
        let soc_register = optional_hex_u16("SOC_REGISTER", 0x002C)?;
        let soc_scale = optional_f64("SOC_SCALE", 0.1)?;
        let soc_offset = optional_f64("SOC_OFFSET", 0.0)?;

        let mut registers = RegisterMap::default();
        registers.soc = soc_register;
        registers.soc_scale = soc_scale;
        registers.soc_offset = soc_offset;

        let database_url = std::env::var("DATABASE_URL").ok();
        let redis_url = std::env::var("REDIS_URL").ok();
        let mqtt_broker_url = std::env::var("MQTT_BROKER_URL").ok();
        let mqtt_client_id = std::env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "daly-bms-gateway".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = optional_u16("PORT", 8080)?;
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let disconnect_helper_path = std::env::var("BMS_DISCONNECT_HELPER_PATH").ok();

        Ok(Self {
            bms_mac_address,
            poll_interval: Duration::from_secs(poll_interval),
            registers,
            database_url,
            redis_url,
            mqtt_broker_url,
            mqtt_client_id,
            host,
            port,
            log_level,
            disconnect_helper_path,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "expected an integer number of seconds".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn optional_u16(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "expected a 16-bit port number".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn optional_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "expected a floating point number".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Accepts `0x`-prefixed hex or plain decimal, per §6.
fn optional_hex_u16(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                u16::from_str_radix(hex, 16)
            } else {
                trimmed.parse()
            };
            parsed.map_err(|_| ConfigError::Invalid {
                name,
                value,
                reason: "expected a decimal or 0x-prefixed hex register address".to_string(),
            })
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_hex_u16_accepts_both_bases() {
        std::env::set_var("TEST_SOC_REGISTER_HEX", "0x002C");
        assert_eq!(optional_hex_u16("TEST_SOC_REGISTER_HEX", 0).unwrap(), 0x002C);
        std::env::remove_var("TEST_SOC_REGISTER_HEX");

        std::env::set_var("TEST_SOC_REGISTER_DEC", "44");
        assert_eq!(optional_hex_u16("TEST_SOC_REGISTER_DEC", 0).unwrap(), 44);
        std::env::remove_var("TEST_SOC_REGISTER_DEC");
    }

    #[test]
    fn missing_required_var_is_a_config_error() {
        std::env::remove_var("TEST_REQUIRED_MISSING");
        let result = required("TEST_REQUIRED_MISSING");
        assert!(matches!(result, Err(ConfigError::Missing("TEST_REQUIRED_MISSING"))));
    }
}
