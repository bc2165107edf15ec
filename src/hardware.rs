//! Hardware specs of the compute subnet's miners, and how many GPUs of each
//! model the subnet has.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::HardwareError;
use crate::store::Store;

/// A number that may also arrive as a numeric string. An empty string or
/// null reads as missing.
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose<T> {
    Value(T),
    Text(String),
}

fn loose<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
{
    match Option::<Loose<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Loose::Value(v)) => Ok(Some(v)),
        Some(Loose::Text(s)) if s.is_empty() => Ok(None),
        Some(Loose::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("not a number: {s:?}"))),
    }
}

/// Miners report power limits in many shapes; anything unreadable is dropped.
fn power_limit<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuSpec {
    #[serde(default)]
    pub model: Option<String>,
    pub count: u32,
    /// MHz.
    #[serde(default, deserialize_with = "loose")]
    pub frequency: Option<f64>,
    #[serde(default)]
    pub clocks: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuDetails {
    pub name: String,
    /// MB.
    #[serde(default)]
    pub capacity: Option<f64>,
    #[serde(default)]
    pub cuda: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    /// MHz.
    #[serde(default)]
    pub graphics_speed: Option<i64>,
    /// MHz.
    #[serde(default)]
    pub memory_speed: Option<i64>,
    /// W.
    #[serde(default, deserialize_with = "power_limit")]
    pub power_limit: Option<f64>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuSpec {
    #[serde(default)]
    pub capacity: Option<f64>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub details: Vec<GpuDetails>,
    #[serde(default)]
    pub graphics_speed: Option<i64>,
    #[serde(default)]
    pub memory_speed: Option<i64>,
}

/// Sizes in kiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardDiskSpec {
    #[serde(default, deserialize_with = "loose")]
    pub total: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub free: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub used: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub read_speed: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub write_speed: Option<f64>,
}

impl HardDiskSpec {
    pub fn get_total_gb(&self) -> Option<f64> {
        self.total.map(kib_to_gb)
    }
}

/// Sizes in kiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RamSpec {
    #[serde(default, deserialize_with = "loose")]
    pub total: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub free: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub available: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub used: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub read_speed: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub write_speed: Option<f64>,
    #[serde(default, deserialize_with = "loose")]
    pub swap_free: Option<u64>,
    #[serde(default, deserialize_with = "loose")]
    pub swap_total: Option<u64>,
    #[serde(default, deserialize_with = "loose")]
    pub swap_used: Option<u64>,
}

impl RamSpec {
    pub fn get_total_gb(&self) -> Option<f64> {
        self.total.map(kib_to_gb)
    }
}

fn kib_to_gb(kib: f64) -> f64 {
    kib / 1024.0 / 1024.0
}

/// Everything a miner reports about its machine. Unknown top-level keys are
/// kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub cpu: CpuSpec,
    #[serde(default)]
    pub gpu: Option<GpuSpec>,
    pub hard_disk: HardDiskSpec,
    #[serde(default)]
    pub has_docker: Option<bool>,
    pub ram: RamSpec,
    #[serde(default)]
    pub virtualization: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Raw specs of the whole subnet as received, keyed by miner hotkey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareState {
    pub state: Value,
    pub measured_at: DateTime<Utc>,
}

/// Number of GPUs of one model present in the subnet at `measured_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuCount {
    pub gpu: String,
    pub count: u32,
    pub measured_at: DateTime<Utc>,
}

/// Canonical model name: whitespace collapsed, vendor prefix dropped.
pub fn normalize_gpu_name(name: &str) -> String {
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    match name.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("nvidia ") => name[7..].to_string(),
        _ => name,
    }
}

/// GPUs per normalized model over every miner's details.
pub fn gpu_counts<'a>(specs: impl IntoIterator<Item = &'a HardwareSpec>) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for spec in specs {
        let Some(gpu) = &spec.gpu else { continue };
        for detail in &gpu.details {
            *counts.entry(normalize_gpu_name(&detail.name)).or_insert(0) += 1;
        }
    }
    counts
}

/// Where the subnet's hardware specs come from.
#[async_trait]
pub trait HardwareSource: Send + Sync {
    /// Specs keyed by miner hotkey, untouched.
    async fn fetch(&self) -> Result<Map<String, Value>, HardwareError>;
}

/// Reads a JSON object of `{hotkey: specs}` from a URL.
pub struct HttpHardwareSource {
    client: reqwest::Client,
    url: String,
}

impl HttpHardwareSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, HardwareError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl HardwareSource for HttpHardwareSource {
    async fn fetch(&self) -> Result<Map<String, Value>, HardwareError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(HardwareError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HardwareReport {
    pub miners: usize,
    pub gpus: u32,
    pub models: usize,
}

/// Stores hardware snapshots of the compute subnet.
pub struct HardwareRecorder {
    store: Arc<dyn Store>,
    source: Arc<dyn HardwareSource>,
}

impl HardwareRecorder {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn HardwareSource>) -> Self {
        Self { store, source }
    }

    /// Store the raw snapshot, then one [`GpuCount`] per GPU model. The raw
    /// snapshot is kept even when it does not parse.
    pub async fn record(&self) -> Result<HardwareReport, HardwareError> {
        let raw = Value::Object(self.source.fetch().await?);
        let measured_at = Utc::now();
        let parsed = BTreeMap::<String, HardwareSpec>::deserialize(&raw);

        self.store.insert_hardware_state(HardwareState { state: raw, measured_at }).await?;
        info!("raw hardware state stored");

        debug!("parsing hardware specs");
        let specs = parsed.map_err(|e| HardwareError::Invalid(e.to_string()))?;
        let counts = gpu_counts(specs.values());
        let report = HardwareReport { miners: specs.len(), gpus: counts.values().sum(), models: counts.len() };

        let rows = counts.into_iter().map(|(gpu, count)| GpuCount { gpu, count, measured_at }).collect();
        self.store.insert_gpu_counts(rows).await?;
        info!(miners = report.miners, gpus = report.gpus, models = report.models, "gpu counts stored");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn spec(gpus: &[&str]) -> Value {
        json!({
            "cpu": {"count": 16, "model": "AMD EPYC 7B13", "frequency": "2450.0"},
            "gpu": {
                "count": gpus.len(),
                "details": gpus.iter().map(|name| json!({"name": name, "capacity": 24564, "power_limit": "450.00 W"})).collect::<Vec<_>>(),
            },
            "hard_disk": {"total": 1048576, "free": "", "used": 0},
            "ram": {"total": 65536000, "available": "1000", "swap_total": 0},
            "has_docker": true,
            "cuda_version": "12.2",
        })
    }

    struct StaticHardware(Map<String, Value>);

    #[async_trait]
    impl HardwareSource for StaticHardware {
        async fn fetch(&self) -> Result<Map<String, Value>, HardwareError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn specs_accept_loose_numbers_and_keep_extra_keys() {
        let spec: HardwareSpec = serde_json::from_value(spec(&["NVIDIA RTX 4090"])).unwrap();
        assert_eq!(spec.cpu.frequency, Some(2450.0));
        assert_eq!(spec.hard_disk.free, None);
        assert_eq!(spec.hard_disk.get_total_gb(), Some(1.0));
        assert_eq!(spec.ram.available, Some(1000.0));
        assert_eq!(spec.extra.get("cuda_version"), Some(&json!("12.2")));

        let gpu = spec.gpu.unwrap();
        assert_eq!(gpu.details[0].capacity, Some(24564.0));
        // "450.00 W" is not a number
        assert_eq!(gpu.details[0].power_limit, None);
    }

    #[test]
    fn nested_specs_reject_unknown_fields() {
        let mut raw = spec(&[]);
        raw["ram"]["speed"] = json!(3200);
        assert!(serde_json::from_value::<HardwareSpec>(raw).is_err());

        let mut raw = spec(&[]);
        raw["cpu"].as_object_mut().unwrap().remove("count");
        assert!(serde_json::from_value::<HardwareSpec>(raw).is_err());
    }

    #[test]
    fn power_limit_parses_numbers_and_numeric_strings() {
        let detail: GpuDetails = serde_json::from_value(json!({"name": "A100", "power_limit": "300"})).unwrap();
        assert_eq!(detail.power_limit, Some(300.0));
        let detail: GpuDetails = serde_json::from_value(json!({"name": "A100", "power_limit": [1]})).unwrap();
        assert_eq!(detail.power_limit, None);
    }

    #[test]
    fn gpu_names_are_normalized() {
        assert_eq!(normalize_gpu_name("NVIDIA GeForce RTX 4090"), "GeForce RTX 4090");
        assert_eq!(normalize_gpu_name("  nvidia   A100-SXM4-80GB "), "A100-SXM4-80GB");
        assert_eq!(normalize_gpu_name("RTX A6000"), "RTX A6000");
    }

    #[test]
    fn gpus_are_counted_per_model() {
        let specs: Vec<HardwareSpec> = [spec(&["NVIDIA A100", "A100"]), spec(&["NVIDIA H100"])]
            .into_iter()
            .map(|raw| serde_json::from_value(raw).unwrap())
            .collect();
        let mut without_gpu: HardwareSpec = serde_json::from_value(spec(&[])).unwrap();
        without_gpu.gpu = None;

        let counts = gpu_counts(specs.iter().chain([&without_gpu]));
        assert_eq!(counts, BTreeMap::from([("A100".to_string(), 2), ("H100".to_string(), 1)]));
    }

    #[tokio::test]
    async fn recorder_stores_state_then_counts() {
        let store = Arc::new(MemoryStore::new());
        let raw = Map::from_iter([
            ("5Miner1".to_string(), spec(&["NVIDIA A100", "NVIDIA A100"])),
            ("5Miner2".to_string(), spec(&["NVIDIA RTX 4090"])),
        ]);
        let recorder = HardwareRecorder::new(store.clone(), Arc::new(StaticHardware(raw.clone())));

        let report = recorder.record().await.unwrap();
        assert_eq!(report, HardwareReport { miners: 2, gpus: 3, models: 2 });

        let states = store.hardware_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, Value::Object(raw));
        let counts: Vec<(String, u32)> =
            store.gpu_counts().await.unwrap().into_iter().map(|c| (c.gpu, c.count)).collect();
        assert_eq!(counts, vec![("A100".to_string(), 2), ("RTX 4090".to_string(), 1)]);
    }

    #[tokio::test]
    async fn unparsable_specs_still_keep_raw_state() {
        let store = Arc::new(MemoryStore::new());
        let raw = Map::from_iter([("5Miner1".to_string(), json!({"cpu": {"count": "many"}}))]);
        let recorder = HardwareRecorder::new(store.clone(), Arc::new(StaticHardware(raw)));

        assert!(matches!(recorder.record().await, Err(HardwareError::Invalid(_))));
        assert_eq!(store.hardware_states().await.unwrap().len(), 1);
        assert!(store.gpu_counts().await.unwrap().is_empty());
    }
}
