//! Row-level decoding of receipt feeds.
//!
//! Every row is parsed on its own; a bad row yields a [`ParseError`] and the
//! caller moves on to the next one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ParseError;
use crate::receipt::{ExecutorClass, Receipt, ReceiptPayload};

/// Column names of a receipt feed, in the order peers write them.
pub const FEED_COLUMNS: [&str; 9] = [
    "job_uuid",
    "miner_hotkey",
    "validator_hotkey",
    "time_started",
    "time_took_us",
    "score_str",
    "executor_class",
    "validator_signature",
    "miner_signature",
];

/// One feed row keyed by column name. Absent columns are absent keys.
pub type RawReceipt = BTreeMap<String, String>;

fn required<'a>(row: &'a RawReceipt, field: &'static str) -> Result<&'a str, ParseError> {
    match row.get(field).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ParseError::Malformed { field }),
    }
}

fn parse_time_started(row: &RawReceipt) -> Result<DateTime<Utc>, ParseError> {
    let raw = row
        .get("time_started")
        .ok_or(ParseError::Malformed { field: "time_started" })?
        .trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ParseError::BadTimestamp(raw.to_string()))
}

fn parse_time_took_us(row: &RawReceipt) -> Result<u64, ParseError> {
    let raw = row
        .get("time_took_us")
        .ok_or(ParseError::Malformed { field: "time_took_us" })?
        .trim();
    raw.parse::<u64>().map_err(|_| ParseError::BadDuration(raw.to_string()))
}

fn parse_executor_class(row: &RawReceipt) -> Result<ExecutorClass, ParseError> {
    match row.get("executor_class").map(|v| v.trim()) {
        None | Some("") => Ok(ExecutorClass::default()),
        Some(tag) => tag.parse().map_err(ParseError::UnknownExecutorClass),
    }
}

/// Decode one feed row into a receipt. Signatures are not checked here.
pub fn parse_row(row: &RawReceipt) -> Result<Receipt, ParseError> {
    let job_uuid = Uuid::parse_str(required(row, "job_uuid")?)
        .map_err(|_| ParseError::Malformed { field: "job_uuid" })?;

    let payload = ReceiptPayload {
        job_uuid,
        miner_hotkey: required(row, "miner_hotkey")?.to_string(),
        validator_hotkey: required(row, "validator_hotkey")?.to_string(),
        time_started: parse_time_started(row)?,
        time_took_us: parse_time_took_us(row)?,
        score_str: required(row, "score_str")?.to_string(),
        executor_class: parse_executor_class(row)?,
    };

    Ok(Receipt {
        payload,
        validator_signature: required(row, "validator_signature")?.to_string(),
        miner_signature: required(row, "miner_signature")?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(overrides: &[(&str, Option<&str>)]) -> RawReceipt {
        let mut row: RawReceipt = [
            ("job_uuid", "0cce29bb-ea05-4c5e-a274-f185ccb117bc"),
            ("miner_hotkey", "5CPhGRp4cdEG4KSui7VQixHhvN5eBUSnMYeUF5thdxm4sKtz"),
            ("validator_hotkey", "5Ctd7bcs7Fgsh5KzZuJZ72fMBvPp5Xwxj4RqWZ1m3UTM7oor"),
            ("time_started", "2024-05-18T16:00:11+00:00"),
            ("time_took_us", "15241820"),
            ("score_str", "1.661293"),
            ("validator_signature", "0x82"),
            ("miner_signature", "0xf8"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (key, value) in overrides {
            match value {
                Some(v) => row.insert(key.to_string(), v.to_string()),
                None => row.remove(*key),
            };
        }
        row
    }

    #[test]
    fn parses_a_legacy_row_without_executor_class() {
        let receipt = parse_row(&row(&[])).unwrap();
        assert_eq!(receipt.payload.executor_class, ExecutorClass::SpinUp4MinGpu24Gb);
        assert_eq!(receipt.payload.time_started, Utc.with_ymd_and_hms(2024, 5, 18, 16, 0, 11).unwrap());
        assert_eq!(receipt.payload.time_took_us, 15241820);
        assert_eq!(receipt.payload.score_str, "1.661293");
        assert_eq!(receipt.miner_signature, "0xf8");
    }

    #[test]
    fn empty_executor_class_gets_default() {
        let receipt = parse_row(&row(&[("executor_class", Some(""))])).unwrap();
        assert_eq!(receipt.payload.executor_class, ExecutorClass::default());
    }

    #[test]
    fn known_executor_class_is_kept() {
        let receipt = parse_row(&row(&[("executor_class", Some("always_on.llm.a6000"))])).unwrap();
        assert_eq!(receipt.payload.executor_class, ExecutorClass::AlwaysOnLlmA6000);
    }

    #[test]
    fn unknown_executor_class_is_rejected() {
        assert_eq!(
            parse_row(&row(&[("executor_class", Some("tpu"))])),
            Err(ParseError::UnknownExecutorClass("tpu".into()))
        );
    }

    #[test]
    fn offsets_are_normalized_to_utc() {
        let receipt = parse_row(&row(&[("time_started", Some("2024-05-18T18:00:11.5+02:00"))])).unwrap();
        assert_eq!(
            receipt.payload.time_started,
            Utc.with_ymd_and_hms(2024, 5, 18, 16, 0, 11).unwrap() + chrono::Duration::milliseconds(500)
        );
    }

    #[test]
    fn bad_timestamps_are_rejected() {
        for ts in ["", "yesterday", "2024-05-18T16:00:11"] {
            assert!(matches!(
                parse_row(&row(&[("time_started", Some(ts))])),
                Err(ParseError::BadTimestamp(_))
            ));
        }
    }

    #[test]
    fn bad_durations_are_rejected() {
        for took in ["", "-1", "1.5", "lots"] {
            assert_eq!(
                parse_row(&row(&[("time_took_us", Some(took))])),
                Err(ParseError::BadDuration(took.into()))
            );
        }
    }

    #[test]
    fn missing_fields_are_malformed() {
        assert_eq!(
            parse_row(&row(&[("miner_signature", None)])),
            Err(ParseError::Malformed { field: "miner_signature" })
        );
        assert_eq!(
            parse_row(&row(&[("validator_hotkey", Some(""))])),
            Err(ParseError::Malformed { field: "validator_hotkey" })
        );
        assert_eq!(
            parse_row(&row(&[("job_uuid", Some("invalid"))])),
            Err(ParseError::Malformed { field: "job_uuid" })
        );
        assert_eq!(
            parse_row(&row(&[("time_started", None)])),
            Err(ParseError::Malformed { field: "time_started" })
        );
    }
}
