//! Registry snapshots and the validator selection policy.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::RegistryError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxonInfo {
    pub is_serving: bool,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neuron {
    pub hotkey: String,
    pub stake: f64,
    #[serde(default)]
    pub axon_info: AxonInfo,
}

/// Source of the authoritative peer list.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn neurons(&self) -> Result<Vec<Neuron>, RegistryError>;
}

/// Reads the snapshot as a JSON array from an HTTP endpoint.
pub struct HttpRegistrySource {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistrySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl RegistrySource for HttpRegistrySource {
    async fn neurons(&self) -> Result<Vec<Neuron>, RegistryError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(RegistryError::Status(resp.status().as_u16()));
        }
        let neurons: Vec<Neuron> = resp.json().await?;
        if let Some(bad) = neurons.iter().find(|n| n.hotkey.is_empty() || !n.stake.is_finite()) {
            return Err(RegistryError::Invalid(format!("bad neuron entry {:?}", bad.hotkey)));
        }
        Ok(neurons)
    }
}

/// Selection settings read once per sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Keep at most this many validators, highest stake first.
    pub validators_limit: Option<usize>,
    /// A validator that must survive the limit.
    pub our_validator: Option<String>,
}

impl SyncPolicy {
    pub fn is_validator(&self, neuron: &Neuron) -> bool {
        if self.our_validator.as_deref() == Some(neuron.hotkey.as_str()) {
            return true;
        }
        neuron.stake > 0.0
    }

    /// Hotkeys of the validators to keep active.
    pub fn select_validators(&self, neurons: &[Neuron]) -> Vec<String> {
        let mut validators: Vec<&Neuron> = neurons.iter().filter(|n| self.is_validator(n)).collect();

        let ours = self.our_validator.as_deref().and_then(|address| {
            let found = validators.iter().copied().find(|v| v.hotkey == address);
            if found.is_none() {
                error!(our_validator = %address, "our validator not found");
            }
            found
        });

        if let Some(limit) = self.validators_limit.filter(|&l| l > 0) {
            validators.sort_by(|a, b| b.stake.total_cmp(&a.stake));
            validators.truncate(limit);
            if let Some(ours) = ours {
                if !validators.iter().any(|v| v.hotkey == ours.hotkey) {
                    if validators.len() == limit {
                        let dropped = validators[limit - 1];
                        warn!(our_validator = %ours.hotkey, dropped = %dropped.hotkey, "forcing our validator into the limit");
                        validators[limit - 1] = ours;
                    } else {
                        validators.push(ours);
                    }
                }
            }
        }

        validators.into_iter().map(|v| v.hotkey.clone()).collect()
    }
}

/// Neurons that currently serve an axon.
pub fn serving_miners(neurons: &[Neuron]) -> Vec<&Neuron> {
    neurons.iter().filter(|n| n.axon_info.is_serving).collect()
}
