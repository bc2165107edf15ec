use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use uuid::Uuid;

/// Executor class a job ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutorClass {
    #[default]
    #[serde(rename = "spin_up-4min.gpu-24gb")]
    SpinUp4MinGpu24Gb,
    #[serde(rename = "always_on.gpu-24gb")]
    AlwaysOnGpu24Gb,
    #[serde(rename = "always_on.llm.a6000")]
    AlwaysOnLlmA6000,
}

impl ExecutorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorClass::SpinUp4MinGpu24Gb => "spin_up-4min.gpu-24gb",
            ExecutorClass::AlwaysOnGpu24Gb => "always_on.gpu-24gb",
            ExecutorClass::AlwaysOnLlmA6000 => "always_on.llm.a6000",
        }
    }
}

impl fmt::Display for ExecutorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spin_up-4min.gpu-24gb" => Ok(ExecutorClass::SpinUp4MinGpu24Gb),
            "always_on.gpu-24gb" => Ok(ExecutorClass::AlwaysOnGpu24Gb),
            "always_on.llm.a6000" => Ok(ExecutorClass::AlwaysOnLlmA6000),
            other => Err(other.to_string()),
        }
    }
}

/// The signed part of a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    pub job_uuid: Uuid,
    pub miner_hotkey: String,
    pub validator_hotkey: String,
    pub time_started: DateTime<Utc>,
    pub time_took_us: u64,
    pub score_str: String,
    #[serde(default)]
    pub executor_class: ExecutorClass,
}

/// Sorted-key view of a payload; field order here is the signed key order.
#[derive(Serialize)]
struct SigningBlob<'a> {
    executor_class: &'a str,
    job_uuid: String,
    miner_hotkey: &'a str,
    score_str: &'a str,
    time_started: String,
    time_took_us: u64,
    validator_hotkey: &'a str,
}

/// JSON formatting with `", "` / `": "` separators and ASCII-only output.
struct SigningFormatter;

impl Formatter for SigningFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Serialize `value` the way signers produce their JSON: `", "` / `": "`
/// separators and non-ASCII escaped. Keys keep the field order of `value`.
pub fn to_signing_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut out = Vec::with_capacity(256);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, SigningFormatter);
    match value.serialize(&mut ser) {
        // the formatter only emits ASCII
        Ok(()) => String::from_utf8(out).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// `YYYY-MM-DDTHH:MM:SS[.ffffff]+00:00`, fraction only when non-zero.
pub fn format_signing_timestamp(ts: &DateTime<Utc>) -> String {
    let micros = ts.timestamp_subsec_micros();
    let base = ts.format("%Y-%m-%dT%H:%M:%S");
    if micros == 0 {
        format!("{base}+00:00")
    } else {
        format!("{base}.{micros:06}+00:00")
    }
}

impl ReceiptPayload {
    /// The exact bytes both parties sign.
    pub fn blob_for_signing(&self) -> String {
        let blob = SigningBlob {
            executor_class: self.executor_class.as_str(),
            job_uuid: self.job_uuid.to_string(),
            miner_hotkey: &self.miner_hotkey,
            score_str: &self.score_str,
            time_started: format_signing_timestamp(&self.time_started),
            time_took_us: self.time_took_us,
            validator_hotkey: &self.validator_hotkey,
        };
        to_signing_json(&blob)
    }

    pub fn time_took(&self) -> Duration {
        Duration::from_micros(self.time_took_us)
    }

    /// The score, if `score_str` is a finite number.
    pub fn score(&self) -> Option<f64> {
        self.score_str.trim().parse::<f64>().ok().filter(|s| s.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub payload: ReceiptPayload,
    pub validator_signature: String,
    pub miner_signature: String,
}

/// A verified receipt as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_uuid: Uuid,
    pub miner_hotkey: String,
    pub validator_hotkey: String,
    pub time_started: DateTime<Utc>,
    pub time_took_us: u64,
    pub score_str: String,
    pub executor_class: ExecutorClass,
}

impl From<ReceiptPayload> for JobReceipt {
    fn from(p: ReceiptPayload) -> Self {
        Self {
            job_uuid: p.job_uuid,
            miner_hotkey: p.miner_hotkey,
            validator_hotkey: p.validator_hotkey,
            time_started: p.time_started,
            time_took_us: p.time_took_us,
            score_str: p.score_str,
            executor_class: p.executor_class,
        }
    }
}
