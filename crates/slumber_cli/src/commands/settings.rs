//! JSON settings file for the simulator.

use serde::{Deserialize, Serialize};
use slumber_sync_engine::{RetryConfig, SyncConfig};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Settings read from `--config`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    /// Name of the primary device.
    pub phone_name: Option<String>,
    /// Name of the companion device.
    pub companion_name: Option<String>,
    /// Response timeout in milliseconds.
    pub response_timeout_ms: Option<u64>,
    /// Background reconciliation interval in seconds.
    pub reconcile_interval_secs: Option<u64>,
    /// Cap on entities per `fullDataSync` envelope.
    pub max_entities_per_envelope: Option<usize>,
    /// Retry queue capacity.
    pub retry_queue_capacity: Option<usize>,
    /// Reconcile as soon as the peer becomes reachable.
    pub reconcile_on_reconnect: Option<bool>,
    /// Retry policy overrides.
    pub retry: Option<RetrySettings>,
}

/// Retry policy overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Send attempts per change event.
    pub max_attempts: Option<u32>,
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: Option<u64>,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: Option<u64>,
    /// Backoff growth factor.
    pub backoff_multiplier: Option<f64>,
    /// Add up to 25% random jitter.
    pub jitter: Option<bool>,
}

impl SettingsFile {
    /// Reads settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        info!("Loading settings from {:?}", path);
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Name of the primary device.
    pub fn phone_name(&self) -> &str {
        self.phone_name.as_deref().unwrap_or("phone")
    }

    /// Name of the companion device.
    pub fn companion_name(&self) -> &str {
        self.companion_name.as_deref().unwrap_or("watch")
    }

    /// Builds the engine configuration for one device.
    pub fn sync_config(&self, device_name: &str) -> SyncConfig {
        let mut config = SyncConfig::new(device_name);
        if let Some(ms) = self.response_timeout_ms {
            config = config.with_response_timeout(Duration::from_millis(ms));
        }
        if let Some(secs) = self.reconcile_interval_secs {
            config = config.with_reconcile_interval(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_entities_per_envelope {
            config = config.with_max_entities_per_envelope(max);
        }
        if let Some(capacity) = self.retry_queue_capacity {
            config = config.with_retry_queue_capacity(capacity);
        }
        if let Some(enabled) = self.reconcile_on_reconnect {
            config = config.with_reconcile_on_reconnect(enabled);
        }
        if let Some(retry) = &self.retry {
            let merged = retry.apply(config.retry.clone());
            config = config.with_retry(merged);
        }
        config
    }
}

impl RetrySettings {
    fn apply(&self, base: RetryConfig) -> RetryConfig {
        let mut retry = match self.max_attempts {
            Some(max_attempts) => RetryConfig {
                max_attempts,
                ..base
            },
            None => base,
        };
        if let Some(ms) = self.initial_delay_ms {
            retry = retry.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_delay_ms {
            retry = retry.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(multiplier) = self.backoff_multiplier {
            retry = retry.with_backoff_multiplier(multiplier);
        }
        if let Some(jitter) = self.jitter {
            retry = retry.with_jitter(jitter);
        }
        retry
    }
}
