//! System events validators report over HTTP, authenticated by a signed
//! timestamp.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AuthError, EventError};
use crate::receipt::to_signing_json;
use crate::signing;
use crate::store::{PeerKind, Store};

/// Seconds a signing timestamp stays acceptable.
pub const MAX_SIGNATURE_AGE_SECS: i64 = 60;

pub const TIMESTAMP_HEADER: &str = "Validator-Signing-Timestamp";
pub const SIGNATURE_HEADER: &str = "Validator-Signature";

const MAX_LABEL_LEN: usize = 255;

/// A stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub subtype: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    /// Row id of the reporting validator.
    pub validator: u64,
}

/// One posted event. The validator comes from the authenticated path, so
/// any `validator` field in the body is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemEventItem {
    #[serde(rename = "type")]
    pub event_type: String,
    pub subtype: String,
    pub timestamp: String,
    pub data: Value,
}

#[derive(Serialize)]
struct SignedData<'a> {
    signing_timestamp: i64,
    validator_ss58_address: &'a str,
}

/// The exact text a validator signs for `signing_timestamp`.
pub fn signed_data(signing_timestamp: i64, address: &str) -> String {
    to_signing_json(&SignedData { signing_timestamp, validator_ss58_address: address })
}

/// RFC 3339, or an ISO date-time without offset taken as UTC.
pub fn parse_event_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Check the signed headers of a request made on behalf of `address` and
/// return the validator's row id.
///
/// `now` is the current unix time in seconds. Timestamps from the future
/// are accepted.
pub async fn authenticate_validator(
    store: &dyn Store,
    address: &str,
    timestamp: Option<&str>,
    signature: Option<&str>,
    now: i64,
) -> Result<u64, EventError> {
    let signing_timestamp: i64 = timestamp
        .and_then(|ts| ts.trim().parse().ok())
        .ok_or(AuthError::InvalidTimestamp)?;
    if now - signing_timestamp > MAX_SIGNATURE_AGE_SECS {
        return Err(AuthError::SignatureTooOld.into());
    }

    let signature = signature.filter(|s| !s.is_empty()).ok_or(AuthError::MissingSignature)?;
    let (_, public_key) = signing::decode_ss58(address).map_err(|_| AuthError::InvalidAddress)?;
    let message = signed_data(signing_timestamp, address);
    if !signing::verify_with_public_key(&public_key, message.as_bytes(), signature) {
        return Err(AuthError::InvalidSignature.into());
    }

    let validator = store
        .peer(PeerKind::Validator, address)
        .await?
        .ok_or(AuthError::UnknownValidator)?;
    if !validator.is_active {
        return Err(AuthError::InactiveValidator.into());
    }
    Ok(validator.id)
}

impl SystemEventItem {
    fn into_event(self, validator: u64) -> Result<SystemEvent, EventError> {
        for (field, value) in [("type", &self.event_type), ("subtype", &self.subtype)] {
            if value.is_empty() || value.chars().count() > MAX_LABEL_LEN {
                return Err(EventError::Invalid(format!("`{field}` must be 1 to {MAX_LABEL_LEN} characters")));
            }
        }
        let timestamp = parse_event_timestamp(&self.timestamp)
            .ok_or_else(|| EventError::Invalid(format!("bad timestamp {:?}", self.timestamp)))?;
        Ok(SystemEvent {
            event_type: self.event_type,
            subtype: self.subtype,
            timestamp,
            data: self.data,
            validator,
        })
    }
}

/// Authenticates validators and stores the event batches they post.
pub struct SystemEventService {
    store: Arc<dyn Store>,
}

impl SystemEventService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Store a JSON list of events posted by `address`. Either the whole
    /// batch is stored or none of it.
    pub async fn record(
        &self,
        address: &str,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<Vec<SystemEvent>, EventError> {
        let validator =
            authenticate_validator(self.store.as_ref(), address, timestamp, signature, Utc::now().timestamp()).await?;

        let items: Vec<SystemEventItem> =
            serde_json::from_slice(body).map_err(|e| EventError::Invalid(e.to_string()))?;
        let events = items
            .into_iter()
            .map(|item| item.into_event(validator))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(validator = %address, num_events = events.len(), "storing system events");
        self.store.insert_system_events(events.clone()).await?;
        info!(validator = %address, num_events = events.len(), "system events stored");
        Ok(events)
    }
}
