//! Message shapes exchanged with validators over their persistent connections.
//!
//! Shapes that peers are allowed to extend carry an explicit `extra` map;
//! everything else is a closed set of fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::signing::{self, SS58_PREFIX};

/// Messages a validator sends to the facilitator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum ValidatorMessage {
    #[serde(rename = "V0AuthenticationRequest")]
    Authentication(AuthenticationRequest),
    #[serde(rename = "V0Heartbeat")]
    Heartbeat,
    #[serde(rename = "V0JobStatusUpdate")]
    JobStatusUpdate(JobStatusUpdate),
    #[serde(rename = "V0MachineSpecsUpdate")]
    MachineSpecs(MachineSpecs),
}

/// Events delivered to a validator's transport session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    #[serde(rename = "job.new")]
    JobNew(JobRequest),
    /// The validator is no longer active and must be disconnected.
    #[serde(rename = "validator.disconnect")]
    ForceDisconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationRequest {
    /// Hex-encoded public key.
    pub public_key: String,
    /// `0x`-hex signature of the raw public key bytes.
    pub signature: String,
}

impl AuthenticationRequest {
    pub fn from_hotkey(hotkey: &signing::Hotkey) -> Self {
        let public_key = hotkey.public_key();
        Self {
            public_key: hex::encode(public_key),
            signature: hotkey.sign(&public_key),
        }
    }

    fn public_key_bytes(&self) -> Option<[u8; 32]> {
        hex::decode(&self.public_key).ok()?.try_into().ok()
    }

    pub fn verify_signature(&self) -> bool {
        match self.public_key_bytes() {
            Some(key) => signing::verify_with_public_key(&key, &key, &self.signature),
            None => false,
        }
    }

    pub fn ss58_address(&self) -> Option<String> {
        self.public_key_bytes().map(|key| signing::encode_ss58(&key, SS58_PREFIX))
    }
}

/// Request for a validator to run a job on a miner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    #[serde(default = "JobRequest::message_type")]
    pub message_type: String,
    pub uuid: String,
    pub miner_hotkey: String,
    pub docker_image: String,
    pub raw_script: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub use_gpu: bool,
    pub input_url: String,
    pub output_url: String,
}

impl JobRequest {
    fn message_type() -> String {
        "V0JobRequest".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Failed,
    Rejected,
    Accepted,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerResponse {
    pub job_uuid: String,
    pub message_type: String,
    pub docker_process_stderr: String,
    pub docker_process_stdout: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusMetadata {
    pub comment: String,
    #[serde(default)]
    pub miner_response: Option<MinerResponse>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub uuid: String,
    pub status: JobStatus,
    #[serde(default)]
    pub metadata: Option<JobStatusMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpecs {
    pub specs: Map<String, Value>,
    pub miner_hotkey: String,
    pub validator_hotkey: String,
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub help: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Error,
    Success,
}

/// Reply to a validator message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
}

impl Response {
    pub fn success() -> Self {
        Self { status: ResponseStatus::Success, errors: Vec::new() }
    }

    pub fn error(msg: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            errors: vec![ErrorDetail { msg: msg.into(), kind: kind.into(), help: String::new(), extra: Map::new() }],
        }
    }
}
