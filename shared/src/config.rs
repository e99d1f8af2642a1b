use crate::types::{AppConfig, JwtConfig, MqttConfig, ServerConfig};
use anyhow::Result;
use config::{Config, Environment, File};
use dotenvy::dotenv;
use std::env;

pub fn load_config() -> Result<AppConfig> {
    // Load .env before reading the environment source
    dotenv().ok();

    let settings = Config::builder()
        // Default configuration file
        .add_source(File::with_name("config/default").required(false))
        // Environment-specific configuration file
        .add_source(
            File::with_name(&format!(
                "config/{}",
                env::var("ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        // Environment variables with APP_ prefix. The double-underscore
        // nesting separator keeps multi-word keys addressable, e.g.
        // APP_MQTT__TOPIC_ROOT maps to mqtt.topic_root.
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let config: AppConfig = settings.try_deserialize()?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &AppConfig) -> Result<()> {
    if config.jwt.secret.is_empty() {
        return Err(anyhow::anyhow!("JWT secret cannot be empty"));
    }

    if config.mqtt.broker.is_empty() {
        return Err(anyhow::anyhow!("MQTT broker host cannot be empty"));
    }

    if config.mqtt.topic_root.is_empty() || config.mqtt.topic_root.contains('/') {
        return Err(anyhow::anyhow!(
            "MQTT topic root must be a single non-empty topic segment"
        ));
    }

    Ok(())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "iotbridge-relay".to_string(),
            username: None,
            password: None,
            topic_root: "iot".to_string(),
            keep_alive_secs: 30,
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "your-super-secret-jwt-key".to_string(),
            expiration_hours: 24,
        }
    }
}
