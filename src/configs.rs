// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Application and broker settings with documented defaults. `ConfigBuilder` loads
//! the `.env.<environment>` file selected by `RUST_ENV` and then applies the
//! process environment on top of the defaults.

use dotenvy::from_filename;
use std::{env, time::Duration};
use thiserror::Error;
use tracing::debug;

pub const RUST_ENV_KEY: &str = "RUST_ENV";
pub const APP_NAME_ENV_KEY: &str = "APP_NAME";
pub const LOG_LEVEL_ENV_KEY: &str = "LOG_LEVEL";
pub const ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY: &str = "ENABLE_EXTERNAL_CRATES_LOGGING";
pub const BROKER_PREFETCH_COUNT_ENV_KEY: &str = "BROKER_PREFETCH_COUNT";
pub const BROKER_RPC_TIMEOUT_MS_ENV_KEY: &str = "BROKER_RPC_TIMEOUT_MS";
pub const BROKER_MAX_PENDING_CALLS_ENV_KEY: &str = "BROKER_MAX_PENDING_CALLS";
pub const BROKER_MAX_REDELIVERIES_ENV_KEY: &str = "BROKER_MAX_REDELIVERIES";

pub const LOCAL_ENV_FILE_NAME: &str = ".env.local";
pub const DEV_ENV_FILE_NAME: &str = ".env.dev";
pub const STAGING_FILE_NAME: &str = ".env.staging";
pub const PROD_FILE_NAME: &str = ".env.prod";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigsError {
    #[error("invalid value `{1}` for `{0}`")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_rust_env() -> Environment {
        match env::var(RUST_ENV_KEY) {
            Ok(value) => Environment::from(value.as_str()),
            Err(_) => Environment::Local,
        }
    }

    fn env_file(&self) -> &'static str {
        match self {
            Environment::Prod => PROD_FILE_NAME,
            Environment::Staging => STAGING_FILE_NAME,
            Environment::Dev => DEV_ENV_FILE_NAME,
            Environment::Local => LOCAL_ENV_FILE_NAME,
        }
    }
}

impl From<&str> for Environment {
    fn from(value: &str) -> Self {
        match value {
            "production" | "prod" | "PRODUCTION" | "PROD" => Environment::Prod,
            "staging" | "stg" | "STAGING" | "STG" => Environment::Staging,
            "develop" | "dev" | "DEVELOP" | "DEV" => Environment::Dev,
            _ => Environment::Local,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfigs {
    ///Default: rabbitmq-embedded
    pub name: String,
    ///Default: Environment::Local
    pub env: Environment,
    ///Default: debug
    pub log_level: String,
    ///Default: false
    pub enable_external_crates_logging: bool,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "rabbitmq-embedded".to_owned(),
            env: Environment::Local,
            log_level: "debug".to_owned(),
            enable_external_crates_logging: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfigs {
    ///Default: 1 (fair dispatch, one unacked delivery per consumer)
    pub prefetch_count: u16,
    ///Default: 5s
    pub rpc_timeout: Duration,
    ///Default: 1024
    pub max_pending_calls: usize,
    ///Default: 3
    pub max_redeliveries: u32,
}

impl Default for BrokerConfigs {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            rpc_timeout: Duration::from_secs(5),
            max_pending_calls: 1024,
            max_redeliveries: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Configs {
    pub app: AppConfigs,
    pub broker: BrokerConfigs,
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {}

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn build(&self) -> Result<Configs, ConfigsError> {
        let env = Environment::from_rust_env();
        if from_filename(env.env_file()).is_ok() {
            debug!("loaded env file: {}", env.env_file());
        }

        let mut cfg = Configs::default();
        cfg.app.env = env;

        for (key, value) in env::vars() {
            self.fill(&mut cfg, &key, &value)?;
        }

        Ok(cfg)
    }

    fn fill(&self, cfg: &mut Configs, key: &str, value: &str) -> Result<(), ConfigsError> {
        let invalid = || ConfigsError::InvalidValue(key.to_owned(), value.to_owned());

        match key {
            APP_NAME_ENV_KEY => cfg.app.name = value.to_owned(),
            LOG_LEVEL_ENV_KEY => cfg.app.log_level = value.to_owned(),
            ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY => {
                cfg.app.enable_external_crates_logging = value.parse().map_err(|_| invalid())?
            }
            BROKER_PREFETCH_COUNT_ENV_KEY => {
                cfg.broker.prefetch_count = value.parse().map_err(|_| invalid())?
            }
            BROKER_RPC_TIMEOUT_MS_ENV_KEY => {
                cfg.broker.rpc_timeout =
                    Duration::from_millis(value.parse().map_err(|_| invalid())?)
            }
            BROKER_MAX_PENDING_CALLS_ENV_KEY => {
                cfg.broker.max_pending_calls = value.parse().map_err(|_| invalid())?
            }
            BROKER_MAX_REDELIVERIES_ENV_KEY => {
                cfg.broker.max_redeliveries = value.parse().map_err(|_| invalid())?
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_environment() {
        assert_eq!(Environment::from("prod"), Environment::Prod);
        assert_eq!(Environment::from("STAGING"), Environment::Staging);
        assert_eq!(Environment::from("dev"), Environment::Dev);
        assert_eq!(Environment::from("anything"), Environment::Local);
    }

    #[test]
    fn fills_from_env_pairs() {
        let builder = ConfigBuilder::new();
        let mut cfg = Configs::default();

        builder.fill(&mut cfg, APP_NAME_ENV_KEY, "orders").unwrap();
        builder.fill(&mut cfg, BROKER_PREFETCH_COUNT_ENV_KEY, "10").unwrap();
        builder.fill(&mut cfg, BROKER_RPC_TIMEOUT_MS_ENV_KEY, "250").unwrap();
        builder.fill(&mut cfg, "UNRELATED", "value").unwrap();

        assert_eq!(cfg.app.name, "orders");
        assert_eq!(cfg.broker.prefetch_count, 10);
        assert_eq!(cfg.broker.rpc_timeout, Duration::from_millis(250));
        assert_eq!(cfg.broker.max_redeliveries, 3);
    }

    #[test]
    fn rejects_invalid_numbers() {
        let builder = ConfigBuilder::new();
        let mut cfg = Configs::default();

        assert_eq!(
            builder.fill(&mut cfg, BROKER_PREFETCH_COUNT_ENV_KEY, "many"),
            Err(ConfigsError::InvalidValue(
                BROKER_PREFETCH_COUNT_ENV_KEY.to_owned(),
                "many".to_owned()
            ))
        );
    }
}
