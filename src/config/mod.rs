use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::actions::BookingConfig;
use crate::llm::LlmClientConfig;
use crate::platform::PlatformClientConfig;
use crate::storage::memory::MemoryStoreConfig;
use crate::storage::redis::RedisStoreConfig;
use crate::worker::{AutoScalingConfig, ManagerConfig, RateLimitRetrySettings, WorkerSettings};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub llm: LlmConfig,
    pub rate_limit_retry: RateLimitRetryConfig,
    pub worker: WorkerConfig,
    pub scaling: ScalingConfig,
    pub dedup: DedupConfig,
    pub storage: StorageConfig,
    pub database: DatabaseSection,
    pub platform: PlatformConfig,
    pub calendar: CalendarConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitRetryConfig {
    pub enabled: bool,
    pub retry_delays_ms: Vec<u64>,
    pub initial_message: String,
    pub final_message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub lock_ttl_ms: u64,
    pub lease_ttl_ms: u64,
    pub lock_max_retries: u32,
    pub credit_cost: i64,
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: u64,
    pub scale_down_threshold: u64,
    pub cpu_threshold: f32,
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DedupConfig {
    pub ttl_s: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// "memory" or "redis".
    pub backend: String,
    pub redis_url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseSection {
    pub path: String,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    pub graph_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webchat_delivery_url: Option<String>,
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CalendarConfig {
    pub token_url: String,
    pub events_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    pub unavailable_message: String,
    pub failure_message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub health_check_port: u16,
    pub enable_metrics_server: bool,
}

impl Default for Config {
    fn default() -> Self {
        let llm_defaults = LlmClientConfig::default();
        let retry_defaults = RateLimitRetrySettings::default();
        let scaling_defaults = AutoScalingConfig::default();
        let platform_defaults = PlatformClientConfig::default();
        let booking_defaults = BookingConfig::default();

        Self {
            llm: LlmConfig {
                api_key: String::new(),
                base_url: llm_defaults.base_url,
                timeout_ms: llm_defaults.timeout.as_millis() as u64,
                max_retries: llm_defaults.max_retries,
            },
            rate_limit_retry: RateLimitRetryConfig {
                enabled: retry_defaults.enabled,
                retry_delays_ms: retry_defaults
                    .retry_delays
                    .iter()
                    .map(|d| d.as_millis() as u64)
                    .collect(),
                initial_message: retry_defaults.initial_message,
                final_message: retry_defaults.final_message,
            },
            worker: WorkerConfig {
                concurrency: 10,
                lock_ttl_ms: 300_000,
                lease_ttl_ms: 300_000,
                lock_max_retries: 150,
                credit_cost: 1,
                drain_timeout_ms: 30_000,
            },
            scaling: ScalingConfig {
                enabled: scaling_defaults.enabled,
                min_workers: scaling_defaults.min_workers,
                max_workers: scaling_defaults.max_workers,
                scale_up_threshold: scaling_defaults.scale_up_threshold,
                scale_down_threshold: scaling_defaults.scale_down_threshold,
                cpu_threshold: scaling_defaults.cpu_threshold,
                check_interval_ms: scaling_defaults.check_interval.as_millis() as u64,
            },
            dedup: DedupConfig { ttl_s: 5 },
            storage: StorageConfig {
                backend: "memory".to_string(),
                redis_url: "redis://localhost:6379".to_string(),
                key_prefix: "chatgate".to_string(),
            },
            database: DatabaseSection {
                path: "chatgate.db".to_string(),
                max_connections: 10,
            },
            platform: PlatformConfig {
                graph_base_url: platform_defaults.graph_base_url,
                webchat_delivery_url: None,
                send_timeout_ms: platform_defaults.timeout.as_millis() as u64,
            },
            calendar: CalendarConfig {
                token_url: booking_defaults.token_url,
                events_url: booking_defaults.events_url,
                client_id: String::new(),
                client_secret: String::new(),
                unavailable_message: booking_defaults.unavailable_message,
                failure_message: booking_defaults.failure_message,
            },
            monitoring: MonitoringConfig {
                health_check_port: 8080,
                enable_metrics_server: true,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_file = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create config directory: {}", config_dir.display()))?;

        let mut config = if config_file.exists() {
            info!("loading configuration from {}", config_file.display());
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("failed to read config file: {}", config_file.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", config_file.display()))?
        } else {
            warn!("config file not found, writing defaults");
            let default_config = Self::default();
            default_config.save(&config_file)?;
            default_config
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let mut content = String::new();
        content.push_str("# chatgate configuration\n");
        content.push_str("#\n");
        content.push_str("# Secrets belong in environment variables, not this file:\n");
        content.push_str("#   LLM_API_KEY            responses API key\n");
        content.push_str("#   GOOGLE_CLIENT_ID       calendar OAuth client\n");
        content.push_str("#   GOOGLE_CLIENT_SECRET   calendar OAuth secret\n");
        content.push_str("#   REDIS_URL              external KV backend\n");
        content.push('\n');
        content.push_str(&toml::to_string_pretty(self).context("failed to serialize configuration")?);

        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        info!("configuration saved to {}", path.display());
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            if !key.is_empty() {
                self.llm.api_key = key;
            }
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            if !url.is_empty() {
                self.llm.base_url = url;
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                self.storage.redis_url = url;
            }
        }
        if let Ok(backend) = std::env::var("CHATGATE_STORAGE_BACKEND") {
            if !backend.is_empty() {
                self.storage.backend = backend;
            }
        }
        if let Ok(path) = std::env::var("CHATGATE_DB_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(id) = std::env::var("GOOGLE_CLIENT_ID") {
            if !id.is_empty() {
                self.calendar.client_id = id;
            }
        }
        if let Ok(secret) = std::env::var("GOOGLE_CLIENT_SECRET") {
            if !secret.is_empty() {
                self.calendar.client_secret = secret;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.llm.api_key.is_empty() {
            anyhow::bail!(
                "\nLLM API key is required.\n\nSet the LLM_API_KEY environment variable:\n  export LLM_API_KEY=\"sk-...\""
            );
        }
        if self.scaling.min_workers == 0 || self.scaling.min_workers > self.scaling.max_workers {
            anyhow::bail!(
                "scaling.min_workers must be in 1..=scaling.max_workers (got {}..{})",
                self.scaling.min_workers,
                self.scaling.max_workers
            );
        }
        if self.rate_limit_retry.enabled && self.rate_limit_retry.retry_delays_ms.is_empty() {
            anyhow::bail!("rate_limit_retry.retry_delays_ms must not be empty when enabled");
        }
        match self.storage.backend.as_str() {
            "memory" | "redis" => {}
            other => anyhow::bail!("storage.backend must be \"memory\" or \"redis\", got {:?}", other),
        }
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".chatgate")
    }

    // Conversions into the component-level configs.

    pub fn llm_client_config(&self) -> LlmClientConfig {
        LlmClientConfig {
            api_key: self.llm.api_key.clone(),
            base_url: self.llm.base_url.clone(),
            timeout: Duration::from_millis(self.llm.timeout_ms),
            max_retries: self.llm.max_retries,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            lock_ttl: Duration::from_millis(self.worker.lock_ttl_ms),
            lock_max_retries: self.worker.lock_max_retries,
            credit_cost: self.worker.credit_cost,
            rate_limit_retry: RateLimitRetrySettings {
                enabled: self.rate_limit_retry.enabled,
                retry_delays: self
                    .rate_limit_retry
                    .retry_delays_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
                initial_message: self.rate_limit_retry.initial_message.clone(),
                final_message: self.rate_limit_retry.final_message.clone(),
            },
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            initial_workers: self.worker.concurrency,
            scaling: AutoScalingConfig {
                enabled: self.scaling.enabled,
                min_workers: self.scaling.min_workers,
                max_workers: self.scaling.max_workers,
                scale_up_threshold: self.scaling.scale_up_threshold,
                scale_down_threshold: self.scaling.scale_down_threshold,
                cpu_threshold: self.scaling.cpu_threshold,
                check_interval: Duration::from_millis(self.scaling.check_interval_ms),
            },
            drain_timeout: Duration::from_millis(self.worker.drain_timeout_ms),
        }
    }

    pub fn memory_store_config(&self) -> MemoryStoreConfig {
        MemoryStoreConfig {
            lease_ttl: Duration::from_millis(self.worker.lease_ttl_ms),
            dedup_ttl: Duration::from_secs(self.dedup.ttl_s),
            ..Default::default()
        }
    }

    pub fn redis_store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            redis_url: self.storage.redis_url.clone(),
            key_prefix: self.storage.key_prefix.clone(),
            lease_ttl: Duration::from_millis(self.worker.lease_ttl_ms),
            dedup_ttl: Duration::from_secs(self.dedup.ttl_s),
            ..Default::default()
        }
    }

    pub fn platform_client_config(&self) -> PlatformClientConfig {
        PlatformClientConfig {
            graph_base_url: self.platform.graph_base_url.clone(),
            webchat_delivery_url: self.platform.webchat_delivery_url.clone(),
            timeout: Duration::from_millis(self.platform.send_timeout_ms),
        }
    }

    pub fn booking_config(&self) -> BookingConfig {
        BookingConfig {
            token_url: self.calendar.token_url.clone(),
            events_url: self.calendar.events_url.clone(),
            client_id: self.calendar.client_id.clone(),
            client_secret: self.calendar.client_secret.clone(),
            unavailable_message: self.calendar.unavailable_message.clone(),
            failure_message: self.calendar.failure_message.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_policy() {
        let config = Config::default();
        assert_eq!(config.worker.concurrency, 10);
        assert_eq!(config.worker.lock_ttl_ms, 300_000);
        assert_eq!(config.worker.lease_ttl_ms, 300_000);
        assert_eq!(config.worker.lock_max_retries, 150);
        assert_eq!(config.scaling.scale_up_threshold, 50);
        assert_eq!(config.scaling.scale_down_threshold, 10);
        assert_eq!(config.dedup.ttl_s, 5);
        assert_eq!(config.storage.backend, "memory");
    }

    #[test]
    fn validation_requires_api_key() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut with_key = Config::default();
        with_key.llm.api_key = "sk-test".to_string();
        assert!(with_key.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_backend() {
        let mut config = Config::default();
        config.llm.api_key = "sk-test".to_string();
        config.storage.backend = "dynamo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_retry_delays() {
        let mut config = Config::default();
        config.llm.api_key = "sk-test".to_string();
        config.rate_limit_retry.retry_delays_ms.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.worker.concurrency, config.worker.concurrency);
        assert_eq!(parsed.scaling.max_workers, config.scaling.max_workers);
    }

    #[test]
    fn conversions_carry_durations() {
        let mut config = Config::default();
        config.llm.api_key = "sk-test".to_string();
        assert_eq!(
            config.worker_settings().lock_ttl,
            Duration::from_secs(300)
        );
        assert_eq!(
            config.manager_config().scaling.check_interval,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.memory_store_config().dedup_ttl,
            Duration::from_secs(5)
        );
    }
}
